//! Contract negotiation: forming new contracts and renewing existing ones
//! with a single host. Every operation here blocks on wallet and network
//! I/O, so none of it runs under the contractor's state lock.

use tracing::{info, warn};

use crate::contractor::gouging::check_form_contract_gouging;
use crate::data::Database;
use crate::errors::{ContractorError, Result};
use crate::hostdb::{HostDbEntry, HostSettings};
use crate::proto::{ContractParams, FundedTransactionSet};
use crate::types::{
	BlockHeight, ContractId, ContractMetadata, ContractUtility, Currency, Output, PublicKey,
	Renter,
};
use crate::utils::spawn_in_span;
use crate::wallet::derive_renter_seed;
use crate::watchdog::MonitorContractArgs;

use super::Contractor;

/// An instruction to renew a file contract.
#[derive(Clone, Debug)]
pub(crate) struct FileContractRenewal {
	pub id: ContractId,
	pub amount: Currency,
	pub host_public_key: PublicKey,
	pub renter_public_key: PublicKey,
}

impl<DB: Database> Contractor<DB> {
	/// Negotiates an initial file contract with the specified host and saves
	/// it. Returns the amount of money moved into the contract alongside the
	/// result: when a duplicate `(renter, host)` contract is detected after
	/// formation, money was already committed on chain, so the spent amount
	/// is reported together with the error.
	pub(crate) async fn managed_new_contract(
		&self,
		renter_public_key: PublicKey,
		host: HostDbEntry,
		contract_funding: Currency,
		end_height: BlockHeight,
	) -> (Currency, Result<ContractMetadata>) {
		let renter = match self.renter(renter_public_key) {
			Ok(renter) => renter,
			Err(e) => return (Currency::ZERO, Err(e)),
		};
		if let Err(e) = self.check_host_for_negotiation(&renter, &host) {
			return (Currency::ZERO, Err(e));
		}
		let mut host = host;
		if host.settings.max_collateral > self.config.max_collateral {
			host.settings.max_collateral = self.config.max_collateral;
		}
		if let Err(e) = check_form_contract_gouging(&renter.allowance, &host.settings) {
			return (
				Currency::ZERO,
				Err(e.context("unable to form a contract due to price gouging detection")),
			);
		}

		// Get an address to use for negotiation.
		let refund_address = match self.wallet.next_address().await {
			Ok(address) => address,
			Err(e) => return (Currency::ZERO, Err(e.into())),
		};

		let result = self
			.new_contract_inner(&renter, host, contract_funding, end_height, refund_address)
			.await;
		match result {
			Ok(contract) => (contract_funding, Ok(contract)),
			Err(e) => {
				if let Err(mark_err) = self.wallet.mark_address_unused(refund_address).await {
					warn!("failed to mark refund address unused: {mark_err}");
				}
				// A duplicate is detected only after the formation succeeded
				// on chain, so the funding still counts as spent.
				if matches!(e, ContractorError::DuplicateContract) {
					(contract_funding, Err(e))
				} else {
					(Currency::ZERO, Err(e))
				}
			},
		}
	}

	async fn new_contract_inner(
		&self,
		renter: &Renter,
		host: HostDbEntry,
		contract_funding: Currency,
		end_height: BlockHeight,
		refund_address: crate::types::Address,
	) -> Result<ContractMetadata> {
		let host_address = host.net_address.clone();

		// Derive the renter seed; it is wiped when the params are dropped.
		let seed = self.wallet.primary_seed().await?;
		let renter_seed = derive_renter_seed(&seed, &renter.email);
		drop(seed);

		let params = ContractParams {
			allowance: renter.allowance.clone(),
			host,
			funding: contract_funding,
			start_height: self.block_height(),
			end_height,
			refund_address,
			renter_seed,
		};

		let mut builder = self.wallet.start_transaction().await?;
		let formed = self
			.contracts
			.form_contract(&params, builder.as_mut(), &self.shutdown)
			.await;
		let (contract, formation_set, sweep_txn, sweep_parents) = match formed {
			Ok(formed) => formed,
			Err(e) => {
				builder.discard();
				return Err(e);
			},
		};

		self.watchdog.call_monitor_contract(MonitorContractArgs {
			renewed: false,
			id: contract.id,
			revision_txn: contract.revision_txn.clone(),
			formation_set,
			sweep_txn,
			sweep_parents,
			start_height: params.start_height,
		})?;

		if let Err(e) = self.map_contract_keys(&contract) {
			builder.discard();
			warn!(
				renter = %contract.renter_public_key,
				host = %contract.host_public_key,
				"attempted to form a new contract with a host this renter already has a contract with"
			);
			return Err(e);
		}

		info!(
			contract_id = %contract.id,
			host = %host_address,
			funds = %contract.renter_funds,
			"formed new contract"
		);

		if let Err(e) = self.hdb.update_contracts(self.contracts.view_all()).await {
			warn!("unable to update host directory contracts: {e}");
		}
		Ok(contract)
	}

	/// Negotiates a new contract for data already stored with a host,
	/// superseding `id`. Blocking call performing network I/O.
	pub(crate) async fn managed_renew(
		&self,
		id: ContractId,
		renter_public_key: PublicKey,
		host_public_key: PublicKey,
		contract_funding: Currency,
		new_end_height: BlockHeight,
		host_settings: HostSettings,
	) -> Result<ContractMetadata> {
		let renter = self.renter(renter_public_key)?;

		let mut host = self
			.hdb
			.host(host_public_key)
			.await
			.map_err(|e| ContractorError::HostDb(e.to_string()))?
			.ok_or(ContractorError::HostNotFound)?;
		// Use the most recent settings from the session, along with the
		// directory entry.
		host.settings = host_settings;

		self.check_host_for_negotiation(&renter, &host)?;
		if host.settings.max_collateral > self.config.max_collateral {
			host.settings.max_collateral = self.config.max_collateral;
		}
		check_form_contract_gouging(&renter.allowance, &host.settings)
			.map_err(|e| e.context("unable to renew due to price gouging detection"))?;

		let refund_address = self.wallet.next_address().await?;
		let result = self
			.renew_inner(
				&renter,
				host,
				id,
				contract_funding,
				new_end_height,
				refund_address,
			)
			.await;
		if result.is_err() {
			if let Err(mark_err) = self.wallet.mark_address_unused(refund_address).await {
				warn!("failed to mark refund address unused: {mark_err}");
			}
		}
		result
	}

	async fn renew_inner(
		&self,
		renter: &Renter,
		host: HostDbEntry,
		id: ContractId,
		contract_funding: Currency,
		new_end_height: BlockHeight,
		refund_address: crate::types::Address,
	) -> Result<ContractMetadata> {
		let seed = self.wallet.primary_seed().await?;
		let renter_seed = derive_renter_seed(&seed, &renter.email);
		drop(seed);

		let params = ContractParams {
			allowance: renter.allowance.clone(),
			host,
			funding: contract_funding,
			start_height: self.block_height(),
			end_height: new_end_height,
			refund_address,
			renter_seed,
		};

		let mut builder = self.wallet.start_transaction().await?;
		if let Err(e) = builder.fund(params.funding).await {
			builder.discard();
			return Err(e.into());
		}
		// An output sending all funds back to the refund address; a miner
		// fee is subtracted if this transaction ever needs to be posted.
		let (sweep_txn, sweep_parents) = builder.sweep(Output {
			value: params.funding,
			address: params.refund_address,
		});
		let funded = {
			let (transaction, parents) = builder.view();
			FundedTransactionSet {
				transaction,
				parents,
			}
		};

		let Some(old_handle) = self.contracts.acquire(id).await else {
			builder.discard();
			return Err(ContractorError::ContractNotFound);
		};
		if self.block_height() > old_handle.metadata().end_height {
			builder.discard();
			return Err(ContractorError::ContractEnded);
		}
		if !old_handle.utility().good_for_renew {
			builder.discard();
			return Err(ContractorError::ContractNotGoodForRenew);
		}
		let renewed = self
			.contracts
			.renew(&old_handle, &params, &funded, &self.shutdown)
			.await;
		// Release the old contract regardless of the outcome.
		drop(old_handle);
		let (new_contract, formation_set) = match renewed {
			Ok(renewed) => renewed,
			Err(e) => {
				builder.discard();
				return Err(e);
			},
		};

		self.watchdog.call_monitor_contract(MonitorContractArgs {
			renewed: true,
			id: new_contract.id,
			revision_txn: new_contract.revision_txn.clone(),
			formation_set,
			sweep_txn,
			sweep_parents,
			start_height: params.start_height,
		})?;

		// This overwrites the previous mapping for the pair, but other
		// modules are only interested in the most recent contract anyway.
		self.remap_contract_keys(&new_contract);

		if let Err(e) = self.hdb.update_contracts(self.contracts.view_all()).await {
			warn!("unable to update host directory contracts: {e}");
		}
		Ok(new_contract)
	}

	/// Renews one contract per the given instructions, returning the amount
	/// of money that was put into the new contract. On failure the amount is
	/// zero and the failure counters decide whether the contract gets locked
	/// for good.
	pub(crate) async fn managed_renew_contract(
		&self,
		renewal: FileContractRenewal,
		block_height: BlockHeight,
		end_height: BlockHeight,
	) -> (Currency, Result<ContractMetadata>) {
		let renter = match self.renter(renewal.renter_public_key) {
			Ok(renter) => renter,
			Err(e) => return (Currency::ZERO, Err(e)),
		};

		// Fetch fresh settings through a session with the host before
		// marking the contract as being renewed.
		let host = match self.hdb.host(renewal.host_public_key).await {
			Ok(Some(host)) => host,
			Ok(None) => return (Currency::ZERO, Err(ContractorError::HostNotFound)),
			Err(e) => return (Currency::ZERO, Err(ContractorError::HostDb(e.to_string()))),
		};
		let host_settings = match self
			.contracts
			.proto
			.session_settings(renewal.renter_public_key, &host)
			.await
		{
			Ok(settings) => settings,
			Err(e) => {
				return (
					Currency::ZERO,
					Err(ContractorError::from(e).context("unable to get host settings")),
				)
			},
		};

		self.mark_renewing(renewal.id);
		let result = self
			.renew_and_track_failures(&renewal, &renter, block_height, end_height, host_settings)
			.await;
		self.unmark_renewing(renewal.id);
		result
	}

	async fn renew_and_track_failures(
		&self,
		renewal: &FileContractRenewal,
		renter: &Renter,
		block_height: BlockHeight,
		end_height: BlockHeight,
		host_settings: HostSettings,
	) -> (Currency, Result<ContractMetadata>) {
		let renew_error = match self
			.managed_renew(
				renewal.id,
				renewal.renter_public_key,
				renewal.host_public_key,
				renewal.amount,
				end_height,
				host_settings,
			)
			.await
		{
			Ok(new_contract) => return self.finalize_renewal(renewal, new_contract).await,
			Err(e) => e,
		};

		// If the renewal failed, check how often it has failed before. Once
		// it has failed often enough in a row and the contract has reached
		// the second half of its renew window, give up and lock it.
		let Some(mut old_handle) = self.contracts.acquire(renewal.id).await else {
			return (
				Currency::ZERO,
				Err(ContractorError::ContractNotFound
					.context("failed to acquire contract after renewal")),
			);
		};
		let old_meta = old_handle.metadata();

		if renew_error.is_hosts_fault() {
			let failures = self.note_renew_failure(renewal.id);
			info!(
				contract_id = %renewal.id,
				failures,
				"remote host determined to be at fault, tallying up failed renews"
			);
		}

		let failures = self.renew_failure_count(renewal.id);
		let second_half_of_window =
			block_height + renter.allowance.renew_window / 2 >= old_meta.end_height;
		let replace = failures >= self.config.consecutive_renewals_before_replacement;
		if failures > 0 && second_half_of_window && replace {
			self.call_update_utility(&mut old_handle, ContractUtility::locked(), true);
			warn!(
				host = %old_meta.host_public_key,
				"consistently failed to renew, contract marked as bad and locked: {renew_error}"
			);
			return (
				Currency::ZERO,
				Err(renew_error
					.context("contract marked as bad for too many consecutive failed renew attempts")),
			);
		}

		warn!(
			host = %old_meta.host_public_key,
			failures,
			block_height,
			proposed_end_height = end_height,
			"failed to renew contract: {renew_error}"
		);
		(
			Currency::ZERO,
			Err(renew_error.context("contract renewal with host was unsuccessful")),
		)
	}

	async fn finalize_renewal(
		&self,
		renewal: &FileContractRenewal,
		new_contract: ContractMetadata,
	) -> (Currency, Result<ContractMetadata>) {
		info!(old_id = %renewal.id, new_id = %new_contract.id, "renewed contract");

		// Update the utility values for the new contract and the old one.
		if let Err(e) = self
			.managed_acquire_and_update_contract_utility(new_contract.id, ContractUtility::active())
			.await
		{
			warn!("failed to update the contract utilities: {e}");
			return (renewal.amount, Ok(new_contract));
		}
		let Some(mut old_handle) = self.contracts.acquire(renewal.id).await else {
			warn!(contract_id = %renewal.id, "old contract vanished before being archived");
			return (renewal.amount, Ok(new_contract));
		};
		self.call_update_utility(&mut old_handle, ContractUtility::locked(), true);

		// Link the contracts, archive the superseded metadata and persist.
		let old_meta = old_handle.metadata();
		self.record_renewal(old_meta.clone(), new_contract.id);

		// Delete the old contract from the live set.
		self.contracts.delete(old_handle);

		// Have the watchdog post the old contract's last revision right
		// away.
		let watchdog = self.watchdog.clone();
		spawn_in_span(async move {
			watchdog.threaded_send_most_recent_revision(old_meta).await;
		});

		(renewal.amount, Ok(new_contract))
	}

	/// Shared host suitability checks for forming and renewing.
	fn check_host_for_negotiation(&self, renter: &Renter, host: &HostDbEntry) -> Result<()> {
		if host.filtered {
			return Err(ContractorError::HostBlocked);
		}
		if host.settings.storage_price > self.config.max_storage_price {
			return Err(ContractorError::HostTooExpensive);
		}
		if !renter.allowance.is_set() {
			return Err(ContractorError::InsufficientAllowance);
		}
		if host.settings.max_duration < renter.allowance.period {
			return Err(ContractorError::UnsuitableHost(
				"insufficient max duration of host".to_string(),
			));
		}
		Ok(())
	}
}
