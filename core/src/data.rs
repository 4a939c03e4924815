use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::types::{BlockHeight, ContractId, ContractMetadata, Currency, Renter};

mod keys;
use keys::*;

mod mem_db;
pub use mem_db::*;

#[cfg(feature = "rocksdb")]
mod rocks_db;

#[cfg(not(feature = "rocksdb"))]
pub type DB = mem_db::MemoryDB;
#[cfg(feature = "rocksdb")]
pub type DB = rocks_db::RocksDB;

/// Column family for satellite state
pub const SATELLITE_STATE_CF: &str = "satellite_state_cf";

/// Type of the database key which we can get from the custom key.
pub trait RecordKey {
	type Type: Serialize + for<'a> Deserialize<'a>;

	fn space(&self) -> Option<&'static str>;

	/// Returns key space (if any) and key
	fn key(&self) -> String;
}

/// Persistent record store. Renter records are full-record writes keyed by
/// email; aggregate state (lineage, archive, double-spend set) is written
/// wholesale on every save. Failures are surfaced so callers can log and
/// keep the in-memory state authoritative.
pub trait Database: Send + Sync {
	/// Puts value for given key into database.
	fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<(), StoreError>;

	/// Gets value for given key, or `None` if the record does not exist.
	fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>, StoreError>;

	/// Deletes value from the database for the given key.
	fn delete<T: RecordKey>(&self, key: T) -> Result<(), StoreError>;
}

/// Full renter record, written whenever any field changes.
pub struct RenterKey(pub String);

impl RecordKey for RenterKey {
	type Type = Renter;

	fn space(&self) -> Option<&'static str> {
		Some(SATELLITE_STATE_CF)
	}

	fn key(&self) -> String {
		let RenterKey(email) = self;
		format!("{RENTER_KEY_PREFIX}:{email}")
	}
}

/// Emails of all known renters; the index used to enumerate `RenterKey`
/// records on boot.
pub struct RenterIndexKey;

impl RecordKey for RenterIndexKey {
	type Type = Vec<String>;

	fn space(&self) -> Option<&'static str> {
		Some(SATELLITE_STATE_CF)
	}

	fn key(&self) -> String {
		RENTER_INDEX_KEY.into()
	}
}

/// Renewal lineage as `(old, new)` contract id pairs.
pub struct RenewalLineageKey;

impl RecordKey for RenewalLineageKey {
	type Type = Vec<(ContractId, ContractId)>;

	fn space(&self) -> Option<&'static str> {
		Some(SATELLITE_STATE_CF)
	}

	fn key(&self) -> String {
		RENEWAL_LINEAGE_KEY.into()
	}
}

/// Archive of superseded contracts, indexed by id on load.
pub struct OldContractsKey;

impl RecordKey for OldContractsKey {
	type Type = Vec<ContractMetadata>;

	fn space(&self) -> Option<&'static str> {
		Some(SATELLITE_STATE_CF)
	}

	fn key(&self) -> String {
		OLD_CONTRACTS_KEY.into()
	}
}

/// Contracts whose funding inputs were double-spent, with the height the
/// double-spend was observed at.
pub struct DoubleSpentKey;

impl RecordKey for DoubleSpentKey {
	type Type = Vec<(ContractId, BlockHeight)>;

	fn space(&self) -> Option<&'static str> {
		Some(SATELLITE_STATE_CF)
	}

	fn key(&self) -> String {
		DOUBLE_SPENT_KEY.into()
	}
}

/// Funds locked in a renter's ledger for contracts currently in force.
pub struct LockedFundsKey(pub String);

impl RecordKey for LockedFundsKey {
	type Type = Currency;

	fn space(&self) -> Option<&'static str> {
		Some(SATELLITE_STATE_CF)
	}

	fn key(&self) -> String {
		let LockedFundsKey(email) = self;
		format!("{LOCKED_FUNDS_KEY_PREFIX}:{email}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{Allowance, PublicKey};

	#[test]
	fn renter_records_are_keyed_by_email() {
		let db = MemoryDB::default();
		let renter = Renter {
			public_key: PublicKey([1; 32]),
			email: "renter@example.com".to_string(),
			current_period: 100,
			allowance: Allowance {
				funds: Currency::new(10_000),
				hosts: 3,
				period: 1_000,
				renew_window: 100,
				..Default::default()
			},
		};

		db.put(RenterKey(renter.email.clone()), renter.clone()).unwrap();
		let loaded = db
			.get(RenterKey("renter@example.com".to_string()))
			.unwrap()
			.unwrap();
		assert_eq!(loaded.public_key, renter.public_key);
		assert_eq!(loaded.allowance.funds, Currency::new(10_000));

		db.delete(RenterKey(renter.email.clone())).unwrap();
		assert!(db
			.get(RenterKey("renter@example.com".to_string()))
			.unwrap()
			.is_none());
	}

	#[test]
	fn lineage_pairs_survive_a_round_trip() {
		let db = MemoryDB::default();
		let pairs = vec![(ContractId([1; 32]), ContractId([2; 32]))];
		db.put(RenewalLineageKey, pairs.clone()).unwrap();
		assert_eq!(db.get(RenewalLineageKey).unwrap().unwrap(), pairs);
	}
}
