//! Shared fixtures for contractor tests.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::alerts::AlertRegistry;
use crate::contractor::Contractor;
use crate::data::MemoryDB;
use crate::hostdb::{HostDbEntry, HostSettings, MockHostDb};
use crate::proto::MockHostProtocol;
use crate::shutdown::Controller;
use crate::types::{Allowance, ContractorConfig, Currency, PublicKey, Renter};
use crate::wallet::{MockTransactionPool, MockWallet};
use crate::watchdog::{Watchdog, WatchdogEvent};

pub(crate) struct TestParts {
	pub hdb: MockHostDb,
	pub wallet: MockWallet,
	pub tpool: MockTransactionPool,
	pub proto: MockHostProtocol,
	pub config: ContractorConfig,
	pub shutdown: Controller<String>,
}

impl Default for TestParts {
	fn default() -> Self {
		TestParts {
			hdb: MockHostDb::new(),
			wallet: MockWallet::new(),
			tpool: MockTransactionPool::new(),
			proto: MockHostProtocol::new(),
			config: ContractorConfig::default(),
			shutdown: Controller::new(),
		}
	}
}

pub(crate) fn build(
	parts: TestParts,
) -> (
	Arc<Contractor<MemoryDB>>,
	Arc<AlertRegistry>,
	mpsc::UnboundedReceiver<WatchdogEvent>,
) {
	let (events_tx, events_rx) = mpsc::unbounded_channel();
	let alerter = Arc::new(AlertRegistry::default());
	let tpool = Arc::new(parts.tpool);
	let watchdog = Arc::new(Watchdog::new(tpool.clone(), events_tx));
	let contractor = Arc::new(Contractor::new(
		MemoryDB::default(),
		Arc::new(parts.hdb),
		Arc::new(parts.wallet),
		tpool,
		Arc::new(parts.proto),
		watchdog,
		alerter.clone(),
		parts.config,
		parts.shutdown,
	));
	(contractor, alerter, events_rx)
}

pub(crate) fn renter(public_key: PublicKey, funds: u128, hosts: u64, period: u64) -> Renter {
	Renter {
		public_key,
		email: format!("renter-{}@example.com", hex::encode(&public_key.0[..4])),
		current_period: 0,
		allowance: Allowance {
			funds: Currency::new(funds),
			hosts,
			period,
			renew_window: 100,
			..Default::default()
		},
	}
}

pub(crate) fn host_entry(
	public_key: PublicKey,
	storage_price: u128,
	contract_price: u128,
) -> HostDbEntry {
	HostDbEntry {
		public_key,
		net_address: format!("host-{}.example.com:9982", hex::encode(&public_key.0[..4])),
		version: "1.6.0".to_string(),
		filtered: false,
		settings: HostSettings {
			base_rpc_price: Currency::ZERO,
			contract_price: Currency::new(contract_price),
			storage_price: Currency::new(storage_price),
			upload_bandwidth_price: Currency::ZERO,
			download_bandwidth_price: Currency::ZERO,
			sector_access_price: Currency::ZERO,
			max_collateral: Currency::new(1_000_000_000),
			max_duration: 100_000,
		},
	}
}
