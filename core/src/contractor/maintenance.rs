//! Contract maintenance: the periodic pass that keeps every renter's
//! contract set healthy, plus the `FormContracts`/`RenewContracts` entry
//! points that actually move money.
//!
//! The pass runs on a cadence and whenever the consensus tip advances. Only
//! one pass runs at a time; between steps the pass yields to interrupts sent
//! via [`Contractor::call_interrupt_contract_maintenance`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::contractor::negotiate::FileContractRenewal;
use crate::data::Database;
use crate::errors::{ContractorError, Result};
use crate::shutdown::Controller;
use crate::types::{
	BlockHeight, ContractId, ContractMetadata, ContractUtility, Currency, PublicKey, Renter,
	TipEvent, ESTIMATED_FILE_CONTRACT_TRANSACTION_SET_SIZE, SECTOR_SIZE,
};
use crate::utils::spawn_in_span;
use crate::watchdog::WatchdogEvent;

/// Outcome of checking whether a contract's host is still worth using.
enum HostVerdict {
	Keep,
	NotGoodForUpload,
	NotGoodForAnything,
}

/// Drives contract maintenance until shutdown: one pass per tick, one pass
/// per consensus advance, and double-spend notifications folded in as they
/// arrive.
pub async fn run<DB: Database + 'static>(
	contractor: Arc<super::Contractor<DB>>,
	mut tip_events: broadcast::Receiver<TipEvent>,
	mut watchdog_events: mpsc::UnboundedReceiver<WatchdogEvent>,
	shutdown: Controller<String>,
) {
	info!("starting contract maintenance loop");

	let mut interval = tokio::time::interval(contractor.config.maintenance_interval);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = interval.tick() => {
				contractor.threaded_contract_maintenance().await;
			},
			event = tip_events.recv() => match event {
				Ok(event) => {
					contractor.process_tip_event(&event);
					contractor.threaded_contract_maintenance().await;
				},
				Err(broadcast::error::RecvError::Lagged(missed)) => {
					warn!(missed, "maintenance loop lagged behind consensus events");
				},
				Err(broadcast::error::RecvError::Closed) => {
					let _ = shutdown.trigger_shutdown("consensus event stream closed".to_string());
					break;
				},
			},
			Some(event) = watchdog_events.recv() => {
				let WatchdogEvent::DoubleSpend { id, height } = event;
				contractor.call_notify_double_spend(id, height).await;
			},
			reason = shutdown.triggered_shutdown() => {
				info!(reason = %reason, "stopping contract maintenance loop");
				break;
			},
		}
	}
}

impl<DB: Database + 'static> super::Contractor<DB> {
	/// Issues an interrupt to any running maintenance pass and keeps issuing
	/// it until a helper task confirms by grabbing the maintenance lock.
	pub async fn call_interrupt_contract_maintenance(self: &Arc<Self>) {
		let (got_lock_tx, mut got_lock_rx) = oneshot::channel::<()>();
		let contractor = self.clone();
		spawn_in_span(async move {
			let _guard = contractor.maintenance_lock.lock().await;
			let _ = got_lock_tx.send(());
		});

		// There may be multiple passes contending for the maintenance lock;
		// interrupt until the lock has demonstrably been acquired.
		loop {
			tokio::select! {
				_ = &mut got_lock_rx => return,
				result = self.interrupt_tx.send(()) => {
					if result.is_err() {
						return;
					}
					info!("signal sent to interrupt contract maintenance");
				},
			}
		}
	}

	/// One maintenance pass: archive what expired, resolve duplicates,
	/// rebuild the key map, prune address-range violations, refresh the
	/// directory's contract view, demote contracts that stopped being
	/// worthwhile and advance billing periods.
	///
	/// Does not itself form or renew contracts; those are driven by the
	/// [`form_contracts`](Self::form_contracts) and
	/// [`renew_contracts`](Self::renew_contracts) entry points.
	pub async fn threaded_contract_maintenance(self: &Arc<Self>) {
		let Ok(_delay_token) = self.shutdown.delay_token() else {
			return;
		};

		// No contract maintenance unless the consensus view is synced.
		if !self.managed_synced() {
			info!("skipping contract maintenance since consensus isn't synced yet");
			return;
		}
		info!("starting contract maintenance");

		// Only one pass at a time; the next tick triggers another round, so
		// returning early is fine.
		let Ok(_lock) = self.maintenance_lock.try_lock() else {
			info!("maintenance lock could not be obtained");
			return;
		};
		self.drain_interrupts();

		self.managed_archive_contracts().await;
		if self.maintenance_interrupted() {
			info!("maintenance interrupted");
			return;
		}
		self.managed_check_for_duplicates().await;
		if self.maintenance_interrupted() {
			info!("maintenance interrupted");
			return;
		}
		self.managed_update_pub_keys_map();
		self.managed_prune_redundant_address_range().await;
		if self.maintenance_interrupted() {
			info!("maintenance interrupted");
			return;
		}
		if let Err(e) = self.hdb.update_contracts(self.contracts.view_all()).await {
			warn!("unable to update host directory contracts: {e}");
			return;
		}
		self.managed_mark_contract_utilities().await;
		if self.maintenance_interrupted() {
			info!("maintenance interrupted");
			return;
		}
		self.managed_limit_gfu_hosts().await;
		self.managed_advance_renter_periods();
		info!("contract maintenance completed");
	}

	/// Moves contracts whose end height has passed into the archive.
	pub(crate) async fn managed_archive_contracts(&self) {
		let block_height = self.block_height();
		for contract in self.contracts.view_all() {
			if block_height <= contract.end_height {
				continue;
			}
			let Some(handle) = self.contracts.acquire(contract.id).await else {
				continue;
			};
			let metadata = handle.metadata();
			info!(contract_id = %metadata.id, end_height = metadata.end_height, "archiving expired contract");
			{
				let mut state = self.state.write().expect("lock acquired");
				state.old_contracts.insert(metadata.id, metadata.clone());
				self.save_locked(&state);
			}
			self.contracts.delete(handle);
			self.watchdog.call_stop_monitoring(metadata.id);
		}
	}

	/// Resolves contracts sharing a `(renter, host)` pair: the younger one
	/// survives, the older one is linked into the lineage and archived.
	pub(crate) async fn managed_check_for_duplicates(&self) {
		let mut pubkeys: HashMap<(PublicKey, PublicKey), ContractId> = HashMap::new();
		for contract in self.contracts.view_all() {
			let key = (contract.renter_public_key, contract.host_public_key);
			let Some(existing_id) = pubkeys.get(&key).copied() else {
				pubkeys.insert(key, contract.id);
				continue;
			};

			// Duplicate found; decide which of the pair is older.
			let Some(existing) = self.contracts.view(existing_id) else {
				pubkeys.insert(key, contract.id);
				continue;
			};
			let (new_contract, old_contract) = if existing.start_height >= contract.start_height {
				(existing, contract)
			} else {
				(contract, existing)
			};
			warn!(
				new_id = %new_contract.id,
				old_id = %old_contract.id,
				"duplicate contract found"
			);

			let Some(old_handle) = self.contracts.acquire(old_contract.id).await else {
				pubkeys.insert(key, new_contract.id);
				continue;
			};

			// Link the pair and archive the loser with its metadata intact.
			// If there are several duplicates for one host the ordering may
			// be imperfect, but every loser ends up archived.
			{
				let mut state = self.state.write().expect("lock acquired");
				state.renewed_from.insert(new_contract.id, old_contract.id);
				state.renewed_to.insert(old_contract.id, new_contract.id);
				state
					.old_contracts
					.insert(old_contract.id, old_handle.metadata());
				self.save_locked(&state);
			}
			self.contracts.delete(old_handle);
			pubkeys.insert(key, new_contract.id);
		}
	}

	/// Rebuilds the `(renter, host) → contract` map from the live set.
	pub(crate) fn managed_update_pub_keys_map(&self) {
		let contracts = self.contracts.view_all();
		let mut state = self.state.write().expect("lock acquired");
		state.pub_keys_to_contract_id.clear();
		for contract in contracts {
			state.pub_keys_to_contract_id.insert(
				(contract.renter_public_key, contract.host_public_key),
				contract.id,
			);
		}
	}

	/// Cancels contracts with hosts the directory flags as violating the
	/// address-range rules. Contracts that are already canceled are left
	/// alone.
	pub(crate) async fn managed_prune_redundant_address_range(&self) {
		let mut host_keys: Vec<PublicKey> = Vec::new();
		let mut contract_ids: HashMap<PublicKey, Vec<ContractId>> = HashMap::new();
		for contract in self.contracts.view_all() {
			let utility = contract.utility;
			if utility.locked && !utility.good_for_renew && !utility.good_for_upload {
				// Contract is canceled.
				continue;
			}
			let ids = contract_ids.entry(contract.host_public_key).or_default();
			if ids.is_empty() {
				host_keys.push(contract.host_public_key);
			}
			ids.push(contract.id);
		}

		let bad_hosts = match self.hdb.check_for_ip_violations(&host_keys).await {
			Ok(bad_hosts) => bad_hosts,
			Err(e) => {
				warn!("error checking for IP violations: {e}");
				return;
			},
		};
		for host in bad_hosts {
			// Multiple renters can have contracts with the same host.
			for id in contract_ids.get(&host).into_iter().flatten() {
				if let Err(e) = self.managed_cancel_contract(*id).await {
					warn!(contract_id = %id, "unable to cancel contract violating address range: {e}");
				}
			}
		}
	}

	/// Demotes contracts whose host dropped out of the directory, got
	/// filtered, started gouging, or scored below the floor computed from a
	/// fresh host sample.
	pub(crate) async fn managed_mark_contract_utilities(&self) {
		for renter in self.renters() {
			let scores = match self
				.managed_find_min_allowed_host_scores(renter.public_key)
				.await
			{
				Ok(scores) => scores,
				Err(e) => {
					warn!(renter = %renter.public_key, "unable to compute minimum host scores: {e}");
					continue;
				},
			};

			for contract in self.contracts.by_renter(renter.public_key) {
				if contract.utility.locked {
					continue;
				}
				let mut utility = contract.utility;

				let verdict = self.host_utility_verdict(&renter, &contract, &scores).await;
				match verdict {
					HostVerdict::Keep => continue,
					HostVerdict::NotGoodForUpload => {
						if !utility.good_for_upload {
							continue;
						}
						utility.good_for_upload = false;
					},
					HostVerdict::NotGoodForAnything => {
						if !utility.good_for_upload && !utility.good_for_renew {
							continue;
						}
						utility.good_for_upload = false;
						utility.good_for_renew = false;
					},
				}

				if let Err(e) = self
					.managed_acquire_and_update_contract_utility(contract.id, utility)
					.await
				{
					warn!(contract_id = %contract.id, "failed to demote contract: {e}");
				}
			}
		}
	}

	async fn host_utility_verdict(
		&self,
		renter: &Renter,
		contract: &ContractMetadata,
		scores: &super::selection::MinimumScores,
	) -> HostVerdict {
		let host = match self.hdb.host(contract.host_public_key).await {
			Ok(Some(host)) => host,
			Ok(None) => return HostVerdict::NotGoodForAnything,
			Err(e) => {
				warn!(host = %contract.host_public_key, "host lookup failed: {e}");
				return HostVerdict::Keep;
			},
		};
		if host.filtered {
			return HostVerdict::NotGoodForAnything;
		}
		if super::gouging::check_form_contract_gouging(&renter.allowance, &host.settings).is_err()
		{
			return HostVerdict::NotGoodForAnything;
		}
		let score = match self.hdb.score_breakdown(&host).await {
			Ok(breakdown) => breakdown.score,
			Err(e) => {
				warn!(host = %contract.host_public_key, "score lookup failed: {e}");
				return HostVerdict::Keep;
			},
		};
		if score < scores.good_for_renew {
			return HostVerdict::NotGoodForAnything;
		}
		if score < scores.good_for_upload {
			return HostVerdict::NotGoodForUpload;
		}
		HostVerdict::Keep
	}

	/// Caps the number of contracts marked good-for-upload at each renter's
	/// host count, demoting the lowest-scoring surplus.
	pub(crate) async fn managed_limit_gfu_hosts(&self) {
		// Score every GFU contract through its host.
		let mut host_scores: HashMap<PublicKey, Currency> = HashMap::new();
		let mut gfu_contracts: Vec<(ContractMetadata, Currency)> = Vec::new();
		for contract in self.contracts.view_all() {
			if !contract.utility.good_for_upload {
				continue;
			}
			let score = match host_scores.get(&contract.host_public_key) {
				Some(score) => *score,
				None => {
					let Ok(Some(host)) = self.hdb.host(contract.host_public_key).await else {
						warn!(
							host = %contract.host_public_key,
							"found GFU contract without a directory entry for its host"
						);
						continue;
					};
					let Ok(breakdown) = self.hdb.score_breakdown(&host).await else {
						warn!("failed to get a score breakdown for a GFU host");
						continue;
					};
					host_scores.insert(contract.host_public_key, breakdown.score);
					breakdown.score
				},
			};
			gfu_contracts.push((contract, score));
		}

		// Ascending by score, so the surplus to demote sits at the front of
		// each renter's slice.
		gfu_contracts.sort_by(|a, b| a.1.cmp(&b.1));

		let mut surplus: HashMap<PublicKey, i64> = HashMap::new();
		for renter in self.renters() {
			let gfu_count = gfu_contracts
				.iter()
				.filter(|(contract, _)| contract.renter_public_key == renter.public_key)
				.count() as i64;
			surplus.insert(renter.public_key, gfu_count - renter.allowance.hosts as i64);
		}

		for (contract, _) in gfu_contracts {
			let Some(remaining) = surplus.get_mut(&contract.renter_public_key) else {
				continue;
			};
			if *remaining <= 0 {
				continue;
			}
			*remaining -= 1;

			let mut utility = contract.utility;
			utility.good_for_upload = false;
			if let Err(e) = self
				.managed_acquire_and_update_contract_utility(contract.id, utility)
				.await
			{
				warn!(contract_id = %contract.id, "failed to cap GFU contract: {e}");
			}
		}
	}

	/// Advances `current_period` for every renter whose billing cycle has
	/// been passed by the consensus tip, persisting the updated records.
	pub(crate) fn managed_advance_renter_periods(&self) {
		let block_height = self.block_height();
		let mut changed: Vec<Renter> = Vec::new();
		{
			let mut state = self.state.write().expect("lock acquired");
			for renter in state.renters.values_mut() {
				let period = renter.allowance.period;
				if period == 0 {
					continue;
				}
				let mut advanced = false;
				while renter.current_period + period <= block_height {
					renter.current_period += period;
					advanced = true;
				}
				if advanced {
					changed.push(renter.clone());
				}
			}
		}
		for renter in changed {
			info!(
				renter = %renter.public_key,
				current_period = renter.current_period,
				"advanced billing period"
			);
			self.update_renter(renter);
		}
	}

	/// Forms contracts on behalf of the renter until it has `hosts` upload-
	/// worthy contracts, and returns the set of upload-worthy contracts.
	pub async fn form_contracts(
		self: &Arc<Self>,
		renter_public_key: PublicKey,
	) -> Result<Vec<ContractMetadata>> {
		if !self.managed_synced() {
			return Err(ContractorError::NotSynced);
		}
		let renter = self.renter(renter_public_key)?;
		let block_height = self.block_height();

		let mut register_low_funds_alert = false;
		let result = self
			.form_contracts_inner(&renter, block_height, &mut register_low_funds_alert)
			.await;
		self.update_low_funds_alert(register_low_funds_alert);
		result
	}

	async fn form_contracts_inner(
		&self,
		renter: &Renter,
		block_height: BlockHeight,
		register_low_funds_alert: &mut bool,
	) -> Result<Vec<ContractMetadata>> {
		let num_hosts = renter.allowance.hosts;
		if num_hosts == 0 {
			return Err(ContractorError::InsufficientAllowance);
		}
		let end_height = block_height + renter.allowance.period + renter.allowance.renew_window;

		// Spending so far this period decides how much allowance is left.
		// Guard against an underflow: the user may have reduced the
		// allowance below what has already been spent.
		let spending = self.period_spending(renter.public_key)?;
		let mut funds_remaining = renter.allowance.funds;
		if spending.total_allocated < funds_remaining {
			funds_remaining = funds_remaining.saturating_sub(spending.total_allocated);
		}

		// Count the contracts which are good for uploading, and make more as
		// needed to fill the gap.
		let mut contract_set: Vec<ContractMetadata> = Vec::new();
		for contract in self.contracts.by_renter(renter.public_key) {
			let Some(utility) = self.managed_contract_utility(contract.id) else {
				continue;
			};
			if utility.good_for_upload {
				contract_set.push(contract);
				if contract_set.len() >= num_hosts as usize {
					break;
				}
			}
		}
		let mut needed = num_hosts as i64 - contract_set.len() as i64;
		if needed <= 0 {
			return Ok(contract_set);
		}
		info!(needed, "need more contracts");

		// Two exclusion lists: hosts the renter has any contract with, and
		// hosts with an active contract whose address range must not repeat.
		let all_contracts = self.contracts.by_renter(renter.public_key);
		let mut blacklist: Vec<PublicKey> = Vec::new();
		let mut address_blacklist: Vec<PublicKey> = Vec::new();
		for contract in &all_contracts {
			blacklist.push(contract.host_public_key);
			let utility = contract.utility;
			if !utility.locked || utility.good_for_renew || utility.good_for_upload {
				address_blacklist.push(contract.host_public_key);
			}
		}

		// Bounds on the initial contract funding, protecting against a large
		// allowance being consumed by a few hosts and against contracts
		// renewing too quickly.
		let share = renter.allowance.funds.div_u64(num_hosts);
		let max_initial_funding = share
			.mul_u64(self.config.max_initial_contract_funding_mul_factor)
			.div_u64(self.config.max_initial_contract_funding_div_factor);
		let min_initial_funding =
			share.div_u64(self.config.min_initial_contract_funding_div_factor);

		let hosts = self
			.managed_candidate_hosts(renter, &blacklist, &address_blacklist, needed as usize)
			.await?;

		let (_, max_fee) = self.tpool.fee_estimation().await;
		let txn_fee = max_fee.mul_u64(ESTIMATED_FILE_CONTRACT_TRANSACTION_SET_SIZE);

		for host in hosts {
			if self.shutdown.is_triggered() {
				return Err(ContractorError::Stopped);
			}
			if needed <= 0 {
				break;
			}

			let mut contract_funds = host
				.settings
				.contract_price
				.add(txn_fee)
				.mul_u64(self.config.contract_fee_funding_mul_factor);
			if contract_funds > max_initial_funding {
				contract_funds = max_initial_funding;
			}
			if contract_funds < min_initial_funding {
				contract_funds = min_initial_funding;
			}

			match self.wallet.unlocked().await {
				Ok(true) => {},
				_ => return Err(ContractorError::WalletLocked),
			}

			if funds_remaining < contract_funds {
				*register_low_funds_alert = true;
				warn!("need to form new contracts, but unable to because of a low allowance");
				break;
			}

			let start = Instant::now();
			let host_address = host.net_address.clone();
			let (funds_spent, result) = self
				.managed_new_contract(renter.public_key, host, contract_funds, end_height)
				.await;
			let new_contract = match result {
				Ok(contract) => contract,
				Err(e) => {
					info!(
						host = %host_address,
						elapsed = ?start.elapsed(),
						"attempted to form a contract, but negotiation failed: {e}"
					);
					continue;
				},
			};
			funds_remaining = funds_remaining.saturating_sub(funds_spent);
			needed -= 1;

			// Lock the spent amount in the renter's ledger.
			self.lock_funds(&renter.email, funds_spent);

			contract_set.push(new_contract.clone());
			if let Err(e) = self
				.managed_acquire_and_update_contract_utility(
					new_contract.id,
					ContractUtility::active(),
				)
				.await
			{
				warn!("failed to update the contract utilities: {e}");
				continue;
			}
			self.save();
		}

		Ok(contract_set)
	}

	/// Classifies the given contracts into keep/renew/refresh and executes
	/// the renewals, expiring contracts first. Returns the renter's
	/// resulting contract set.
	pub async fn renew_contracts(
		self: &Arc<Self>,
		renter_public_key: PublicKey,
		contract_ids: Vec<ContractId>,
	) -> Result<Vec<ContractMetadata>> {
		if !self.managed_synced() {
			return Err(ContractorError::NotSynced);
		}
		let renter = self.renter(renter_public_key)?;
		let block_height = self.block_height();

		let mut register_low_funds_alert = false;
		let result = self
			.renew_contracts_inner(
				&renter,
				block_height,
				contract_ids,
				&mut register_low_funds_alert,
			)
			.await;
		self.update_low_funds_alert(register_low_funds_alert);
		result
	}

	async fn renew_contracts_inner(
		&self,
		renter: &Renter,
		block_height: BlockHeight,
		contract_ids: Vec<ContractId>,
		register_low_funds_alert: &mut bool,
	) -> Result<Vec<ContractMetadata>> {
		let min_version = semver::Version::parse(&self.config.min_supported_host_version).ok();

		// The renew set holds contracts about to expire; the refresh set
		// holds contracts that ran out of money. Renewals take priority: if
		// the allowance runs short, keeping data in the long term beats
		// topping up spent contracts.
		let mut renew_set: Vec<FileContractRenewal> = Vec::new();
		let mut refresh_set: Vec<FileContractRenewal> = Vec::new();
		let mut contract_set: Vec<ContractMetadata> = Vec::new();
		let mut funds_remaining = Currency::ZERO;

		for id in contract_ids {
			let Some(rc) = self.contracts.view(id) else {
				warn!(contract_id = %id, "submitted contract ID does not exist");
				continue;
			};
			if rc.renter_public_key != renter.public_key {
				warn!(
					contract_id = %id,
					renter = %renter.public_key,
					"submitted contract ID does not belong to this renter"
				);
				continue;
			}

			let utility = rc.utility;
			if block_height + renter.allowance.renew_window < rc.end_height
				&& utility.good_for_upload
			{
				info!(contract_id = %id, "contract is still GFU and hasn't expired yet");
				contract_set.push(rc);
				continue;
			}

			// Recompute the remaining allowance from period spending; money
			// committed by earlier iterations shows up here.
			let spending = self.period_spending(renter.public_key)?;
			funds_remaining = renter.allowance.funds;
			if spending.total_allocated < funds_remaining {
				funds_remaining = funds_remaining.saturating_sub(spending.total_allocated);
			}

			let host = match self.hdb.host(rc.host_public_key).await {
				Ok(Some(host)) => host,
				Ok(None) => {
					info!(contract_id = %id, "contract skipped because its host is unknown");
					continue;
				},
				Err(e) => {
					warn!(contract_id = %id, "error getting host: {e}");
					continue;
				},
			};
			if host.filtered {
				info!(contract_id = %id, "contract skipped because its host is filtered");
				continue;
			}
			// Hosts on an outdated release can't complete the current
			// renter-host protocol.
			if let Some(min_version) = &min_version {
				match semver::Version::parse(&host.version) {
					Ok(version) if version >= *min_version => {},
					_ => {
						info!(
							contract_id = %id,
							version = %host.version,
							"contract skipped because its host runs an outdated version"
						);
						continue;
					},
				}
			}
			if !utility.good_for_renew {
				info!(contract_id = %id, "contract skipped because it is not good for renew");
				continue;
			}

			// Expiring contracts renew with funding proportional to what the
			// contract line spent over the ending billing cycle.
			if block_height + renter.allowance.renew_window >= rc.end_height {
				match self
					.managed_estimate_renew_funding_requirements(
						&rc,
						block_height,
						&renter.allowance,
					)
					.await
				{
					Ok(amount) => {
						renew_set.push(FileContractRenewal {
							id: rc.id,
							amount,
							host_public_key: rc.host_public_key,
							renter_public_key: renter.public_key,
						});
						info!(contract_id = %id, "contract added to the renew set");
					},
					Err(e) => {
						info!(contract_id = %id, "contract skipped, couldn't estimate renew funding: {e}");
					},
				}
				continue;
			}

			// A contract is empty when less than the configured fraction of
			// its funds remains, or when fewer than three sectors worth of
			// storage and bandwidth are left.
			let block_bytes = Currency::new(SECTOR_SIZE as u128 * renter.allowance.period as u128);
			let sector_storage_price = host.settings.storage_price.mul(block_bytes);
			let sector_upload_price = host.settings.upload_bandwidth_price.mul_u64(SECTOR_SIZE);
			let sector_download_price = host.settings.download_bandwidth_price.mul_u64(SECTOR_SIZE);
			let sector_price = sector_storage_price
				.add(sector_upload_price)
				.add(sector_download_price);
			let percent_remaining = rc.renter_funds.ratio(rc.total_cost);
			if rc.renter_funds < sector_price.mul_u64(3)
				|| percent_remaining < self.config.min_contract_fund_renewal_threshold
			{
				// Refresh with double the previous funding. The usage
				// pattern is unknown and may have been a recent burst, so
				// doubling lets heavily used contracts grow quickly without
				// wasting transaction fees on repeated small top-ups.
				let mut refresh_amount = rc.total_cost.mul_u64(2);
				let minimum = renter
					.allowance
					.funds
					.mul_float(self.config.file_contract_minimum_funding)
					.div_u64(renter.allowance.hosts);
				if refresh_amount < minimum {
					refresh_amount = minimum;
				}
				refresh_set.push(FileContractRenewal {
					id: rc.id,
					amount: refresh_amount,
					host_public_key: rc.host_public_key,
					renter_public_key: renter.public_key,
				});
				info!(
					contract_id = %id,
					remaining = %rc.renter_funds,
					"contract identified as needing to be refreshed"
				);
			}
		}
		if !renew_set.is_empty() || !refresh_set.is_empty() {
			info!(
				renewals = renew_set.len(),
				refreshes = refresh_set.len(),
				"renewing and refreshing contracts"
			);
		}

		let end_height = renter.contract_end_height();
		self.managed_process_renewals(
			&renew_set,
			false,
			&mut funds_remaining,
			&mut contract_set,
			register_low_funds_alert,
			block_height,
			end_height,
			renter,
		)
		.await?;
		self.managed_process_renewals(
			&refresh_set,
			true,
			&mut funds_remaining,
			&mut contract_set,
			register_low_funds_alert,
			block_height,
			end_height,
			renter,
		)
		.await?;

		// Shrink the failure counter to the contracts still being renewed
		// or refreshed, so it keeps tracking consecutive failures only.
		let current: HashSet<ContractId> = renew_set
			.iter()
			.chain(refresh_set.iter())
			.map(|renewal| renewal.id)
			.collect();
		self.retain_renew_failures(&current);

		Ok(contract_set)
	}

	#[allow(clippy::too_many_arguments)]
	async fn managed_process_renewals(
		&self,
		renewals: &[FileContractRenewal],
		refreshing: bool,
		funds_remaining: &mut Currency,
		contract_set: &mut Vec<ContractMetadata>,
		register_low_funds_alert: &mut bool,
		block_height: BlockHeight,
		end_height: BlockHeight,
		renter: &Renter,
	) -> Result<()> {
		let verb = if refreshing { "refresh" } else { "renewal" };
		for renewal in renewals {
			if self.shutdown.is_triggered() {
				info!("returning because the satellite was stopped");
				return Err(ContractorError::Stopped);
			}

			match self.wallet.unlocked().await {
				Ok(true) => {},
				_ => {
					warn!("attempting to {verb} contracts, however the wallet is locked");
					return Err(ContractorError::WalletLocked);
				},
			}

			// Skip if the remaining allowance cannot cover this renewal.
			if renewal.amount > *funds_remaining {
				info!(
					contract_id = %renewal.id,
					amount = %renewal.amount,
					remaining = %funds_remaining,
					"skipping {verb}, not enough funds remaining in the allowance"
				);
				*register_low_funds_alert = true;
				continue;
			}

			let (funds_spent, result) = self
				.managed_renew_contract(renewal.clone(), block_height, end_height)
				.await;
			*funds_remaining = funds_remaining.saturating_sub(funds_spent);

			let new_contract = match result {
				Ok(contract) => contract,
				Err(e) => {
					if matches!(e.root(), ContractorError::ContractNotGoodForRenew) {
						info!(contract_id = %renewal.id, "contract skipped, not good for renew");
					} else {
						warn!(contract_id = %renewal.id, "error during contract {verb}: {e}");
					}
					continue;
				},
			};

			// Lock the spent amount in the renter's ledger.
			self.lock_funds(&renter.email, funds_spent);
			contract_set.push(new_contract);
			self.save();
		}
		Ok(())
	}
}
