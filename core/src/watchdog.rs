//! Contract watchdog.
//!
//! Every formed or renewed contract is registered here exactly once. The
//! watchdog remembers which outputs fund the contract's formation set and
//! scans applied blocks for a foreign transaction spending any of them; a
//! hit means the renter's funding was double-spent and the contractor is
//! notified so the contract can be marked bad. On renewal, the watchdog
//! broadcasts the superseded contract's last known revision immediately.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::errors::{ContractorError, Result};
use crate::types::{BlockHeight, ContractId, ContractMetadata, OutputId, Transaction, TransactionId};
use crate::wallet::TransactionPool;

/// Notification sent to the contractor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchdogEvent {
	DoubleSpend {
		id: ContractId,
		height: BlockHeight,
	},
}

/// Registration arguments for one monitored contract.
pub struct MonitorContractArgs {
	pub renewed: bool,
	pub id: ContractId,
	pub revision_txn: Transaction,
	pub formation_set: Vec<Transaction>,
	pub sweep_txn: Transaction,
	pub sweep_parents: Vec<Transaction>,
	pub start_height: BlockHeight,
}

struct MonitoredContract {
	formation_ids: HashSet<TransactionId>,
	watched_outputs: HashSet<OutputId>,
	revision_txn: Transaction,
	sweep_txn: Transaction,
	sweep_parents: Vec<Transaction>,
	start_height: BlockHeight,
	double_spent: bool,
}

pub struct Watchdog {
	contracts: Mutex<HashMap<ContractId, MonitoredContract>>,
	tpool: Arc<dyn TransactionPool>,
	events: UnboundedSender<WatchdogEvent>,
}

impl Watchdog {
	pub fn new(tpool: Arc<dyn TransactionPool>, events: UnboundedSender<WatchdogEvent>) -> Self {
		Watchdog {
			contracts: Mutex::new(HashMap::new()),
			tpool,
			events,
		}
	}

	/// Starts monitoring the funding inputs of a contract. Each contract id
	/// may be registered exactly once.
	pub fn call_monitor_contract(&self, args: MonitorContractArgs) -> Result<()> {
		let mut contracts = self.contracts.lock().expect("lock acquired");
		if contracts.contains_key(&args.id) {
			return Err(ContractorError::AlreadyMonitored);
		}

		let formation_ids: HashSet<TransactionId> =
			args.formation_set.iter().map(|txn| txn.id).collect();
		let watched_outputs: HashSet<OutputId> = args
			.formation_set
			.iter()
			.flat_map(|txn| txn.inputs.iter().copied())
			.collect();

		info!(
			contract_id = %args.id,
			renewed = args.renewed,
			inputs = watched_outputs.len(),
			"monitoring contract"
		);
		contracts.insert(
			args.id,
			MonitoredContract {
				formation_ids,
				watched_outputs,
				revision_txn: args.revision_txn,
				sweep_txn: args.sweep_txn,
				sweep_parents: args.sweep_parents,
				start_height: args.start_height,
				double_spent: false,
			},
		);
		Ok(())
	}

	pub fn is_monitoring(&self, id: ContractId) -> bool {
		self.contracts.lock().expect("lock acquired").contains_key(&id)
	}

	/// Scans the transactions applied at `height` for spends of monitored
	/// funding outputs by transactions outside the formation set. Emits one
	/// double-spend notification per affected contract.
	pub fn call_scan_applied_transactions(&self, applied: &[Transaction], height: BlockHeight) {
		let mut notifications = Vec::new();
		{
			let mut contracts = self.contracts.lock().expect("lock acquired");
			for (id, monitored) in contracts.iter_mut() {
				if monitored.double_spent {
					continue;
				}
				let foreign_spend = applied.iter().any(|txn| {
					!monitored.formation_ids.contains(&txn.id)
						&& txn
							.inputs
							.iter()
							.any(|input| monitored.watched_outputs.contains(input))
				});
				if foreign_spend {
					monitored.double_spent = true;
					notifications.push(*id);
				}
			}
		}

		for id in notifications {
			warn!(contract_id = %id, height, "found a double-spend");
			if self
				.events
				.send(WatchdogEvent::DoubleSpend { id, height })
				.is_err()
			{
				warn!("double-spend notification dropped, contractor is gone");
			}
		}
	}

	/// Broadcasts the last known revision of a contract. Called when the
	/// contract is superseded by a renewal so the final state is posted
	/// before the old contract expires.
	pub async fn threaded_send_most_recent_revision(&self, contract: ContractMetadata) {
		let revision_txn = {
			let contracts = self.contracts.lock().expect("lock acquired");
			match contracts.get(&contract.id) {
				Some(monitored) => monitored.revision_txn.clone(),
				None => contract.revision_txn.clone(),
			}
		};

		if let Err(e) = self.tpool.accept_transaction_set(vec![revision_txn]).await {
			warn!(contract_id = %contract.id, "failed to broadcast final revision: {e}");
			return;
		}
		info!(contract_id = %contract.id, "broadcast final revision");
	}

	/// Returns the sweep transaction of a monitored contract, used to
	/// recover the funding outputs if the host never countersigned.
	pub fn sweep_transaction(&self, id: ContractId) -> Option<(Transaction, Vec<Transaction>)> {
		let contracts = self.contracts.lock().expect("lock acquired");
		contracts
			.get(&id)
			.map(|monitored| (monitored.sweep_txn.clone(), monitored.sweep_parents.clone()))
	}

	/// Stops monitoring a contract, e.g. when it expires and is archived.
	pub fn call_stop_monitoring(&self, id: ContractId) {
		let mut contracts = self.contracts.lock().expect("lock acquired");
		if contracts.remove(&id).is_some() {
			info!(contract_id = %id, "stopped monitoring contract");
		}
	}

	pub fn monitored_start_height(&self, id: ContractId) -> Option<BlockHeight> {
		let contracts = self.contracts.lock().expect("lock acquired");
		contracts.get(&id).map(|monitored| monitored.start_height)
	}
}
