//! The contractor: forms, renews and refreshes storage contracts on behalf
//! of every tracked renter.
//!
//! One coarse reader/writer lock guards the renter table, the renewal
//! lineage, the archive of superseded contracts and the failure counters.
//! The lock is held for short durations only and never across network or
//! wallet I/O; the live contracts themselves are owned by the
//! [`ContractSet`](crate::contracts::ContractSet) with its own per-contract
//! acquire/return locking.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alerts::{AlertId, AlertSeverity, Alerter};
use crate::contracts::{ContractHandle, ContractSet};
use crate::data::{
	Database, DoubleSpentKey, LockedFundsKey, OldContractsKey, RenewalLineageKey, RenterIndexKey,
	RenterKey,
};
use crate::errors::{ContractorError, Result};
use crate::hostdb::HostDb;
use crate::proto::HostProtocol;
use crate::shutdown::Controller;
use crate::types::{
	BlockHeight, ContractId, ContractMetadata, ContractUtility, ContractorConfig, Currency,
	PublicKey, Renter, TipEvent,
};
use crate::wallet::{TransactionPool, Wallet};
use crate::watchdog::Watchdog;

pub mod funding;
pub mod gouging;
pub mod maintenance;
pub mod negotiate;
pub mod selection;
#[cfg(test)]
pub(crate) mod testing;

/// Message shown with the low-funds alert.
pub const ALERT_MSG_ALLOWANCE_LOW_FUNDS: &str =
	"At least one contract formation or renewal was skipped due to low allowance funds";
const ALERT_CAUSE_INSUFFICIENT_FUNDS: &str = "Wallet funds allocated to the renter ran out";

/// Spending of a renter's allowance over the current billing period.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenterSpending {
	pub total_allocated: Currency,
	pub upload_spending: Currency,
	pub download_spending: Currency,
	pub fund_account_spending: Currency,
	pub maintenance_spending: Currency,
}

#[derive(Default)]
struct State {
	renters: HashMap<PublicKey, Renter>,
	block_height: BlockHeight,
	synced: bool,
	renewed_from: HashMap<ContractId, ContractId>,
	renewed_to: HashMap<ContractId, ContractId>,
	old_contracts: HashMap<ContractId, ContractMetadata>,
	pub_keys_to_contract_id: HashMap<(PublicKey, PublicKey), ContractId>,
	num_failed_renews: HashMap<ContractId, u64>,
	double_spent: HashMap<ContractId, BlockHeight>,
	renewing: HashSet<ContractId>,
}

pub struct Contractor<DB: Database> {
	state: RwLock<State>,
	pub(crate) contracts: ContractSet,
	pub(crate) hdb: Arc<dyn HostDb>,
	pub(crate) wallet: Arc<dyn Wallet>,
	pub(crate) tpool: Arc<dyn TransactionPool>,
	pub(crate) watchdog: Arc<Watchdog>,
	pub(crate) alerter: Arc<dyn Alerter>,
	pub(crate) db: DB,
	pub(crate) config: ContractorConfig,
	pub(crate) maintenance_lock: tokio::sync::Mutex<()>,
	pub(crate) interrupt_tx: mpsc::Sender<()>,
	interrupt_rx: std::sync::Mutex<mpsc::Receiver<()>>,
	pub(crate) shutdown: Controller<String>,
}

impl<DB: Database> Contractor<DB> {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		db: DB,
		hdb: Arc<dyn HostDb>,
		wallet: Arc<dyn Wallet>,
		tpool: Arc<dyn TransactionPool>,
		proto: Arc<dyn HostProtocol>,
		watchdog: Arc<Watchdog>,
		alerter: Arc<dyn Alerter>,
		config: ContractorConfig,
		shutdown: Controller<String>,
	) -> Self {
		let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
		let contractor = Contractor {
			state: RwLock::new(State::default()),
			contracts: ContractSet::new(proto),
			hdb,
			wallet,
			tpool,
			watchdog,
			alerter,
			db,
			config,
			maintenance_lock: tokio::sync::Mutex::new(()),
			interrupt_tx,
			interrupt_rx: std::sync::Mutex::new(interrupt_rx),
			shutdown,
		};
		contractor.load();
		contractor
	}

	/// Loads the persisted renter table, lineage, archive and double-spend
	/// set. A corrupt or missing record is logged and regenerated empty; the
	/// in-memory state is authoritative from there on.
	fn load(&self) {
		let mut state = self.state.write().expect("lock acquired");

		match self.db.get(RenterIndexKey) {
			Ok(Some(emails)) => {
				for email in emails {
					match self.db.get(RenterKey(email.clone())) {
						Ok(Some(renter)) => {
							state.renters.insert(renter.public_key, renter);
						},
						Ok(None) => warn!(email = %email, "renter is indexed but has no record"),
						Err(e) => warn!(email = %email, "failed to load renter record: {e}"),
					}
				}
			},
			Ok(None) => {},
			Err(e) => warn!("failed to load renter index: {e}"),
		}

		match self.db.get(RenewalLineageKey) {
			Ok(Some(pairs)) => {
				for (old_id, new_id) in pairs {
					state.renewed_from.insert(new_id, old_id);
					state.renewed_to.insert(old_id, new_id);
				}
			},
			Ok(None) => {},
			Err(e) => warn!("failed to load renewal lineage: {e}"),
		}

		match self.db.get(OldContractsKey) {
			Ok(Some(contracts)) => {
				for contract in contracts {
					state.old_contracts.insert(contract.id, contract);
				}
			},
			Ok(None) => {},
			Err(e) => warn!("failed to load the contract archive: {e}"),
		}

		match self.db.get(DoubleSpentKey) {
			Ok(Some(entries)) => {
				state.double_spent = entries.into_iter().collect();
			},
			Ok(None) => {},
			Err(e) => warn!("failed to load the double-spent set: {e}"),
		}
	}

	/// Persists the aggregate contractor state. Failures are logged and the
	/// in-memory state stays authoritative; the record is regenerated on the
	/// next successful save.
	///
	/// Must be called with the state lock held by the caller's thread of
	/// control, snapshotting under the same lock it mutated under.
	fn save_locked(&self, state: &State) {
		let pairs: Vec<(ContractId, ContractId)> = state
			.renewed_to
			.iter()
			.map(|(old_id, new_id)| (*old_id, *new_id))
			.collect();
		if let Err(e) = self.db.put(RenewalLineageKey, pairs) {
			warn!("failed to save renewal lineage: {e}");
		}
		let archive: Vec<ContractMetadata> = state.old_contracts.values().cloned().collect();
		if let Err(e) = self.db.put(OldContractsKey, archive) {
			warn!("failed to save the contract archive: {e}");
		}
		let double_spent: Vec<(ContractId, BlockHeight)> = state
			.double_spent
			.iter()
			.map(|(id, height)| (*id, *height))
			.collect();
		if let Err(e) = self.db.put(DoubleSpentKey, double_spent) {
			warn!("failed to save the double-spent set: {e}");
		}
	}

	pub(crate) fn save(&self) {
		let state = self.state.read().expect("lock acquired");
		self.save_locked(&state);
	}

	/// Creates or replaces a renter record; the store write is a full-record
	/// update keyed by email.
	pub fn update_renter(&self, renter: Renter) {
		let mut state = self.state.write().expect("lock acquired");
		let known = state.renters.values().any(|r| r.email == renter.email);
		state.renters.insert(renter.public_key, renter.clone());
		drop(state);

		if !known {
			let mut index = match self.db.get(RenterIndexKey) {
				Ok(Some(index)) => index,
				Ok(None) => Vec::new(),
				Err(e) => {
					warn!("failed to load renter index: {e}");
					Vec::new()
				},
			};
			if !index.contains(&renter.email) {
				index.push(renter.email.clone());
				if let Err(e) = self.db.put(RenterIndexKey, index) {
					warn!("failed to save renter index: {e}");
				}
			}
		}
		if let Err(e) = self.db.put(RenterKey(renter.email.clone()), renter) {
			warn!("failed to save renter record: {e}");
		}
	}

	pub fn renter(&self, public_key: PublicKey) -> Result<Renter> {
		let state = self.state.read().expect("lock acquired");
		state
			.renters
			.get(&public_key)
			.cloned()
			.ok_or(ContractorError::RenterNotFound)
	}

	pub fn renters(&self) -> Vec<Renter> {
		let state = self.state.read().expect("lock acquired");
		state.renters.values().cloned().collect()
	}

	pub fn block_height(&self) -> BlockHeight {
		self.state.read().expect("lock acquired").block_height
	}

	pub(crate) fn managed_synced(&self) -> bool {
		self.state.read().expect("lock acquired").synced
	}

	/// Folds a consensus update into the contractor and lets the watchdog
	/// scan the applied transactions.
	pub fn process_tip_event(&self, event: &TipEvent) {
		{
			let mut state = self.state.write().expect("lock acquired");
			state.block_height = event.height;
			state.synced = event.synced;
		}
		self.watchdog
			.call_scan_applied_transactions(&event.applied, event.height);
	}

	/// Snapshot of all live contracts.
	pub fn contracts(&self) -> Vec<ContractMetadata> {
		self.contracts.view_all()
	}

	pub fn managed_contract_utility(&self, id: ContractId) -> Option<ContractUtility> {
		self.contracts.view(id).map(|contract| contract.utility)
	}

	/// Superseded contracts, keyed by id.
	pub fn old_contracts(&self) -> HashMap<ContractId, ContractMetadata> {
		let state = self.state.read().expect("lock acquired");
		state.old_contracts.clone()
	}

	pub fn renewed_from(&self, id: ContractId) -> Option<ContractId> {
		let state = self.state.read().expect("lock acquired");
		state.renewed_from.get(&id).copied()
	}

	pub fn renewed_to(&self, id: ContractId) -> Option<ContractId> {
		let state = self.state.read().expect("lock acquired");
		state.renewed_to.get(&id).copied()
	}

	/// Breakdown of the renter's spending over the current billing period.
	/// Contracts whose funding was double-spent are excluded.
	pub fn period_spending(&self, public_key: PublicKey) -> Result<RenterSpending> {
		let state = self.state.read().expect("lock acquired");
		let renter = state
			.renters
			.get(&public_key)
			.ok_or(ContractorError::RenterNotFound)?;

		let mut spending = RenterSpending::default();
		let mut tally = |contract: &ContractMetadata| {
			spending.total_allocated = spending.total_allocated.add(contract.total_cost);
			spending.upload_spending = spending.upload_spending.add(contract.spending.upload_spending);
			spending.download_spending = spending
				.download_spending
				.add(contract.spending.download_spending);
			spending.fund_account_spending = spending
				.fund_account_spending
				.add(contract.spending.fund_account_spending);
			spending.maintenance_spending = spending
				.maintenance_spending
				.add(contract.spending.maintenance_spending);
		};

		for contract in self.contracts.by_renter(public_key) {
			if state.double_spent.contains_key(&contract.id) {
				continue;
			}
			tally(&contract);
		}
		for contract in state.old_contracts.values() {
			if contract.renter_public_key != public_key
				|| contract.start_height < renter.current_period
				|| state.double_spent.contains_key(&contract.id)
			{
				continue;
			}
			tally(contract);
		}

		Ok(spending)
	}

	/// Marks a contract's funding as double-spent: the contract is excluded
	/// from period spending and locked for good.
	pub async fn call_notify_double_spend(&self, id: ContractId, height: BlockHeight) {
		warn!(contract_id = %id, height, "watchdog found a double-spend");

		{
			let mut state = self.state.write().expect("lock acquired");
			state.double_spent.insert(id, height);
			self.save_locked(&state);
		}

		if let Err(e) = self.mark_contract_bad(id).await {
			error!(contract_id = %id, "failed to mark double-spent contract bad: {e}");
		}
	}

	/// Locks a contract: not good for upload, not good for renew, dead for
	/// this contract id.
	pub async fn mark_contract_bad(&self, id: ContractId) -> Result<()> {
		let mut handle = self
			.contracts
			.acquire(id)
			.await
			.ok_or(ContractorError::ContractNotFound)?;
		self.call_update_utility(&mut handle, ContractUtility::locked(), false);
		Ok(())
	}

	/// Cancels a contract; it keeps running out its term on chain, but the
	/// satellite stops using it.
	pub(crate) async fn managed_cancel_contract(&self, id: ContractId) -> Result<()> {
		self.mark_contract_bad(id).await
	}

	pub(crate) async fn managed_acquire_and_update_contract_utility(
		&self,
		id: ContractId,
		utility: ContractUtility,
	) -> Result<()> {
		let mut handle = self
			.contracts
			.acquire(id)
			.await
			.ok_or(ContractorError::ContractNotFound)?;
		self.call_update_utility(&mut handle, utility, false);
		Ok(())
	}

	/// Writes a contract's utility. Always use this instead of touching the
	/// handle directly; it guards against resurrecting a renewed contract.
	/// Pass `renewed` as true if the contract has just been renewed.
	pub(crate) fn call_update_utility(
		&self,
		handle: &mut ContractHandle,
		utility: ContractUtility,
		renewed: bool,
	) {
		if !renewed && (utility.good_for_renew || utility.good_for_upload) {
			let state = self.state.read().expect("lock acquired");
			if state.renewed_to.contains_key(&handle.id()) {
				error!(
					contract_id = %handle.id(),
					"attempting to update contract utility on a contract that has been renewed"
				);
			}
		}
		handle.update_utility(utility);
	}

	/// Records a renewal in the lineage maps, archives the old contract's
	/// metadata and persists both. Archiving and persisting are not atomic;
	/// a crash in between is recovered by the duplicate sweep on the next
	/// maintenance pass, which re-links any orphaned pair.
	pub(crate) fn record_renewal(&self, old_contract: ContractMetadata, new_id: ContractId) {
		let mut state = self.state.write().expect("lock acquired");
		let old_id = old_contract.id;
		state.renewed_from.insert(new_id, old_id);
		state.renewed_to.insert(old_id, new_id);
		state.old_contracts.insert(old_id, old_contract);
		self.save_locked(&state);
	}

	/// Tracks which contract is live for a `(renter, host)` pair. Returns an
	/// error when the pair is already mapped to some other live contract.
	pub(crate) fn map_contract_keys(&self, contract: &ContractMetadata) -> Result<()> {
		let mut state = self.state.write().expect("lock acquired");
		let key = (contract.renter_public_key, contract.host_public_key);
		if let Some(existing) = state.pub_keys_to_contract_id.get(&key) {
			if *existing != contract.id {
				return Err(ContractorError::DuplicateContract);
			}
		}
		state.pub_keys_to_contract_id.insert(key, contract.id);
		Ok(())
	}

	/// Replaces the `(renter, host)` mapping unconditionally; used on
	/// renewal, where other modules only care about the newest contract.
	pub(crate) fn remap_contract_keys(&self, contract: &ContractMetadata) {
		let mut state = self.state.write().expect("lock acquired");
		let key = (contract.renter_public_key, contract.host_public_key);
		state.pub_keys_to_contract_id.insert(key, contract.id);
	}

	/// Locks funds in the renter's ledger after money moved into a contract.
	pub(crate) fn lock_funds(&self, email: &str, amount: Currency) {
		let locked = match self.db.get(LockedFundsKey(email.to_string())) {
			Ok(Some(locked)) => locked,
			Ok(None) => Currency::ZERO,
			Err(e) => {
				error!(email = %email, "couldn't read locked funds: {e}");
				return;
			},
		};
		if let Err(e) = self
			.db
			.put(LockedFundsKey(email.to_string()), locked.add(amount))
		{
			error!(email = %email, "couldn't lock funds: {e}");
		}
	}

	pub(crate) fn renew_failure_count(&self, id: ContractId) -> u64 {
		let state = self.state.read().expect("lock acquired");
		state.num_failed_renews.get(&id).copied().unwrap_or(0)
	}

	pub(crate) fn note_renew_failure(&self, id: ContractId) -> u64 {
		let mut state = self.state.write().expect("lock acquired");
		let count = state.num_failed_renews.entry(id).or_insert(0);
		*count += 1;
		*count
	}

	/// Shrinks the failure counter to the ids still being renewed or
	/// refreshed, so stale entries don't survive across passes.
	pub(crate) fn retain_renew_failures(&self, current: &HashSet<ContractId>) {
		let mut state = self.state.write().expect("lock acquired");
		state
			.num_failed_renews
			.retain(|id, _| current.contains(id));
	}

	pub(crate) fn mark_renewing(&self, id: ContractId) -> bool {
		let mut state = self.state.write().expect("lock acquired");
		state.renewing.insert(id)
	}

	pub(crate) fn unmark_renewing(&self, id: ContractId) {
		let mut state = self.state.write().expect("lock acquired");
		state.renewing.remove(&id);
	}

	pub(crate) fn is_double_spent(&self, id: ContractId) -> bool {
		let state = self.state.read().expect("lock acquired");
		state.double_spent.contains_key(&id)
	}

	pub(crate) fn update_low_funds_alert(&self, register: bool) {
		if register {
			self.alerter.register_alert(
				AlertId::RenterAllowanceLowFunds,
				ALERT_MSG_ALLOWANCE_LOW_FUNDS.to_string(),
				ALERT_CAUSE_INSUFFICIENT_FUNDS.to_string(),
				AlertSeverity::Warning,
			);
		} else {
			self.alerter.unregister_alert(AlertId::RenterAllowanceLowFunds);
		}
	}

	/// Discards interrupts buffered while no maintenance pass was running.
	pub(crate) fn drain_interrupts(&self) {
		let mut rx = self.interrupt_rx.lock().expect("lock acquired");
		while rx.try_recv().is_ok() {}
	}

	/// Returns whether the maintenance pass was asked to yield. Drains one
	/// pending interrupt per call.
	pub(crate) fn maintenance_interrupted(&self) -> bool {
		let mut rx = self.interrupt_rx.lock().expect("lock acquired");
		match rx.try_recv() {
			Ok(()) => true,
			Err(_) => self.shutdown.is_triggered(),
		}
	}

	#[cfg(test)]
	pub(crate) fn set_tip(&self, height: BlockHeight, synced: bool) {
		let mut state = self.state.write().expect("lock acquired");
		state.block_height = height;
		state.synced = synced;
	}

	#[cfg(test)]
	pub(crate) fn insert_old_contract(&self, contract: ContractMetadata) {
		let mut state = self.state.write().expect("lock acquired");
		state.old_contracts.insert(contract.id, contract);
	}

	#[cfg(test)]
	pub(crate) fn insert_lineage(&self, old_id: ContractId, new_id: ContractId) {
		let mut state = self.state.write().expect("lock acquired");
		state.renewed_from.insert(new_id, old_id);
		state.renewed_to.insert(old_id, new_id);
	}

	#[cfg(test)]
	pub(crate) fn failure_counter_len(&self) -> usize {
		let state = self.state.read().expect("lock acquired");
		state.num_failed_renews.len()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tokio::sync::mpsc;

	use super::*;
	use crate::contractor::testing::{self, TestParts};
	use crate::data::MemoryDB;
	use crate::hostdb::MockHostDb;
	use crate::proto::MockHostProtocol;
	use crate::types::ContractMetadata;
	use crate::wallet::{MockTransactionPool, MockWallet};

	fn rebuild_on(db: MemoryDB) -> Arc<Contractor<MemoryDB>> {
		let (events_tx, _events_rx) = mpsc::unbounded_channel();
		let tpool = Arc::new(MockTransactionPool::new());
		Arc::new(Contractor::new(
			db,
			Arc::new(MockHostDb::new()),
			Arc::new(MockWallet::new()),
			tpool.clone(),
			Arc::new(MockHostProtocol::new()),
			Arc::new(Watchdog::new(tpool, events_tx)),
			Arc::new(crate::alerts::AlertRegistry::default()),
			ContractorConfig::default(),
			Controller::new(),
		))
	}

	#[tokio::test]
	async fn persisted_state_survives_a_restart() {
		let renter_key = PublicKey([1; 32]);
		let parts = TestParts::default();
		let (contractor, _alerter, _events) = testing::build(parts);
		contractor.update_renter(testing::renter(renter_key, 12_345, 3, 1_000));

		let old = ContractMetadata {
			id: ContractId([10; 32]),
			renter_public_key: renter_key,
			start_height: 50,
			total_cost: Currency::new(7_000),
			..Default::default()
		};
		contractor.record_renewal(old.clone(), ContractId([11; 32]));
		contractor.call_notify_double_spend(ContractId([12; 32]), 900).await;

		// A second contractor over the same store sees the same world.
		let restarted = rebuild_on(contractor.db.clone());
		let renter = restarted.renter(renter_key).unwrap();
		assert_eq!(renter.allowance.funds, Currency::new(12_345));
		assert_eq!(restarted.renewed_to(old.id), Some(ContractId([11; 32])));
		assert_eq!(restarted.renewed_from(ContractId([11; 32])), Some(old.id));
		assert!(restarted.old_contracts().contains_key(&old.id));
		assert!(restarted.is_double_spent(ContractId([12; 32])));
	}

	#[tokio::test]
	async fn double_spent_contracts_are_excluded_from_period_spending() {
		let renter_key = PublicKey([1; 32]);
		let parts = TestParts::default();
		let (contractor, _alerter, _events) = testing::build(parts);
		contractor.update_renter(testing::renter(renter_key, 100_000, 2, 1_000));

		contractor.contracts.insert(ContractMetadata {
			id: ContractId([10; 32]),
			renter_public_key: renter_key,
			total_cost: Currency::new(5_000),
			..Default::default()
		});
		contractor.contracts.insert(ContractMetadata {
			id: ContractId([11; 32]),
			renter_public_key: renter_key,
			total_cost: Currency::new(3_000),
			..Default::default()
		});

		let spending = contractor.period_spending(renter_key).unwrap();
		assert_eq!(spending.total_allocated, Currency::new(8_000));

		contractor.call_notify_double_spend(ContractId([11; 32]), 500).await;
		let spending = contractor.period_spending(renter_key).unwrap();
		assert_eq!(spending.total_allocated, Currency::new(5_000));
	}

	#[tokio::test]
	async fn locked_funds_accumulate_per_renter() {
		let parts = TestParts::default();
		let (contractor, _alerter, _events) = testing::build(parts);

		contractor.lock_funds("renter@example.com", Currency::new(100));
		contractor.lock_funds("renter@example.com", Currency::new(250));

		let locked = contractor
			.db
			.get(LockedFundsKey("renter@example.com".to_string()))
			.unwrap()
			.unwrap();
		assert_eq!(locked, Currency::new(350));
	}
}
