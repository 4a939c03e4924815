//! The live contract set.
//!
//! The set exclusively owns every live contract's metadata. Reads go through
//! cheap snapshots; mutations require acquiring the contract, which hands out
//! an exclusive [`ContractHandle`]. Dropping the handle returns the contract,
//! so every return path releases it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::OwnedMutexGuard;
use tracing::info;

use crate::errors::{ContractorError, Result};
use crate::proto::{ContractParams, FundedTransactionSet, HostProtocol, NegotiatedContract};
use crate::shutdown::Controller;
use crate::types::{ContractId, ContractMetadata, ContractUtility, Output, PublicKey, Transaction};
use crate::wallet::TransactionBuilder;

struct ContractEntry {
	meta: Mutex<ContractMetadata>,
	busy: Arc<tokio::sync::Mutex<()>>,
}

/// Exclusive ownership of one live contract, released on drop.
pub struct ContractHandle {
	id: ContractId,
	entry: Arc<ContractEntry>,
	_guard: OwnedMutexGuard<()>,
}

impl ContractHandle {
	pub fn id(&self) -> ContractId {
		self.id
	}

	pub fn metadata(&self) -> ContractMetadata {
		self.entry.meta.lock().expect("lock acquired").clone()
	}

	pub fn utility(&self) -> ContractUtility {
		self.entry.meta.lock().expect("lock acquired").utility
	}

	pub fn update_utility(&mut self, utility: ContractUtility) {
		self.entry.meta.lock().expect("lock acquired").utility = utility;
	}
}

pub struct ContractSet {
	contracts: RwLock<HashMap<ContractId, Arc<ContractEntry>>>,
	pub(crate) proto: Arc<dyn HostProtocol>,
}

impl ContractSet {
	pub fn new(proto: Arc<dyn HostProtocol>) -> Self {
		ContractSet {
			contracts: RwLock::new(HashMap::new()),
			proto,
		}
	}

	/// Snapshot of a single contract's metadata.
	pub fn view(&self, id: ContractId) -> Option<ContractMetadata> {
		let contracts = self.contracts.read().expect("lock acquired");
		contracts
			.get(&id)
			.map(|entry| entry.meta.lock().expect("lock acquired").clone())
	}

	/// Snapshot of every live contract.
	pub fn view_all(&self) -> Vec<ContractMetadata> {
		let contracts = self.contracts.read().expect("lock acquired");
		contracts
			.values()
			.map(|entry| entry.meta.lock().expect("lock acquired").clone())
			.collect()
	}

	/// Snapshot of every live contract belonging to the given renter.
	pub fn by_renter(&self, renter_public_key: PublicKey) -> Vec<ContractMetadata> {
		self.view_all()
			.into_iter()
			.filter(|contract| contract.renter_public_key == renter_public_key)
			.collect()
	}

	pub fn ids(&self) -> Vec<ContractId> {
		let contracts = self.contracts.read().expect("lock acquired");
		contracts.keys().copied().collect()
	}

	/// Takes exclusive ownership of a contract. Returns `None` if the
	/// contract does not exist, or was deleted while waiting for the lock.
	pub async fn acquire(&self, id: ContractId) -> Option<ContractHandle> {
		let entry = {
			let contracts = self.contracts.read().expect("lock acquired");
			contracts.get(&id)?.clone()
		};
		let guard = entry.busy.clone().lock_owned().await;

		// The contract may have been deleted while we were waiting.
		let contracts = self.contracts.read().expect("lock acquired");
		if !contracts.contains_key(&id) {
			return None;
		}
		drop(contracts);

		Some(ContractHandle {
			id,
			entry,
			_guard: guard,
		})
	}

	/// Removes an acquired contract from the live set.
	pub fn delete(&self, handle: ContractHandle) {
		let mut contracts = self.contracts.write().expect("lock acquired");
		contracts.remove(&handle.id);
	}

	pub fn insert(&self, contract: ContractMetadata) {
		let mut contracts = self.contracts.write().expect("lock acquired");
		contracts.insert(
			contract.id,
			Arc::new(ContractEntry {
				meta: Mutex::new(contract),
				busy: Arc::new(tokio::sync::Mutex::new(())),
			}),
		);
	}

	/// Negotiates a new contract with the host in `params`. The builder is
	/// funded here; on success the contract is inserted into the live set
	/// and the formation set plus the sweep transaction are returned so the
	/// watchdog can monitor the funding inputs.
	pub async fn form_contract(
		&self,
		params: &ContractParams,
		builder: &mut dyn TransactionBuilder,
		shutdown: &Controller<String>,
	) -> Result<(ContractMetadata, Vec<Transaction>, Transaction, Vec<Transaction>)> {
		builder.fund(params.funding).await?;

		// The sweep returns the funding outputs to the refund address in
		// case the host never countersigns.
		let (sweep_txn, sweep_parents) = builder.sweep(Output {
			value: params.funding,
			address: params.refund_address,
		});

		if shutdown.is_triggered() {
			return Err(ContractorError::Stopped);
		}

		let funded = {
			let (transaction, parents) = builder.view();
			FundedTransactionSet {
				transaction,
				parents,
			}
		};
		let NegotiatedContract {
			contract,
			formation_set,
		} = self.proto.form_contract(params, &funded).await?;

		info!(
			contract_id = %contract.id,
			host = %params.host.net_address,
			"formed contract"
		);
		self.insert(contract.clone());
		Ok((contract, formation_set, sweep_txn, sweep_parents))
	}

	/// Negotiates the renewal of an acquired contract. The caller funds the
	/// builder beforehand; on success the new contract is inserted into the
	/// live set. The old contract stays in the set and is archived by the
	/// caller once lineage is recorded.
	pub async fn renew(
		&self,
		old_contract: &ContractHandle,
		params: &ContractParams,
		funded: &FundedTransactionSet,
		shutdown: &Controller<String>,
	) -> Result<(ContractMetadata, Vec<Transaction>)> {
		if shutdown.is_triggered() {
			return Err(ContractorError::Stopped);
		}

		let old_meta = old_contract.metadata();
		let NegotiatedContract {
			contract,
			formation_set,
		} = self
			.proto
			.renew_contract(&old_meta, params, funded)
			.await?;

		info!(
			old_id = %old_meta.id,
			new_id = %contract.id,
			"renewed contract"
		);
		self.insert(contract.clone());
		Ok((contract, formation_set))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proto::MockHostProtocol;

	fn test_set() -> ContractSet {
		ContractSet::new(Arc::new(MockHostProtocol::new()))
	}

	fn contract(id: u8, renter: u8) -> ContractMetadata {
		ContractMetadata {
			id: ContractId([id; 32]),
			renter_public_key: PublicKey([renter; 32]),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn acquire_gives_exclusive_ownership() {
		let set = test_set();
		set.insert(contract(1, 1));

		let handle = set.acquire(ContractId([1; 32])).await.unwrap();
		// A second acquire must wait until the handle is dropped.
		let second = tokio::time::timeout(
			std::time::Duration::from_millis(20),
			set.acquire(ContractId([1; 32])),
		)
		.await;
		assert!(second.is_err());

		drop(handle);
		assert!(set.acquire(ContractId([1; 32])).await.is_some());
	}

	#[tokio::test]
	async fn deleted_contracts_cannot_be_acquired() {
		let set = test_set();
		set.insert(contract(1, 1));

		let handle = set.acquire(ContractId([1; 32])).await.unwrap();
		set.delete(handle);

		assert!(set.view(ContractId([1; 32])).is_none());
		assert!(set.acquire(ContractId([1; 32])).await.is_none());
	}

	#[tokio::test]
	async fn by_renter_filters_on_the_renter_key() {
		let set = test_set();
		set.insert(contract(1, 1));
		set.insert(contract(2, 1));
		set.insert(contract(3, 2));

		assert_eq!(set.by_renter(PublicKey([1; 32])).len(), 2);
		assert_eq!(set.by_renter(PublicKey([2; 32])).len(), 1);
		assert_eq!(set.view_all().len(), 3);
	}

	#[tokio::test]
	async fn utility_updates_are_visible_through_views() {
		let set = test_set();
		set.insert(contract(1, 1));

		let mut handle = set.acquire(ContractId([1; 32])).await.unwrap();
		handle.update_utility(ContractUtility::locked());
		drop(handle);

		let meta = set.view(ContractId([1; 32])).unwrap();
		assert!(meta.utility.locked);
		assert!(!meta.utility.good_for_renew);
	}
}
