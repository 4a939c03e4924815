use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options};

use super::RecordKey;
use crate::data::{self, SATELLITE_STATE_CF};
use crate::errors::StoreError;

#[derive(Clone)]
pub struct RocksDB {
	db: Arc<rocksdb::DB>,
}

pub struct RocksDBKey(Option<&'static str>, Vec<u8>);

impl<T: RecordKey> From<&T> for RocksDBKey {
	fn from(value: &T) -> Self {
		RocksDBKey(value.space(), value.key().into_bytes())
	}
}

impl RocksDB {
	pub fn open(path: &str) -> Result<RocksDB, StoreError> {
		let cf_opts = vec![ColumnFamilyDescriptor::new(
			SATELLITE_STATE_CF,
			Options::default(),
		)];

		let mut db_opts = Options::default();
		db_opts.create_if_missing(true);
		db_opts.create_missing_column_families(true);

		let db = rocksdb::DB::open_cf_descriptors(&db_opts, path, cf_opts).map_err(|e| {
			StoreError::Get {
				key: path.to_string(),
				reason: e.to_string(),
			}
		})?;
		Ok(RocksDB { db: Arc::new(db) })
	}

	fn cf_handle(&self, cf: &'static str, key: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
		self.db.cf_handle(cf).ok_or_else(|| StoreError::Get {
			key: key.to_string(),
			reason: format!("missing column family {cf}"),
		})
	}
}

impl data::Database for RocksDB {
	fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<(), StoreError> {
		let name = key.key();
		// Records are fixed structs; failing to encode one is a programming
		// error, not a runtime condition.
		let encoded = serde_json::to_vec(&value).expect("encoding record for the store failed");
		let RocksDBKey(column_family, raw_key) = RocksDBKey::from(&key);
		let result = match column_family {
			Some(cf) => {
				let handle = self.cf_handle(cf, &name)?;
				self.db.put_cf(handle, raw_key, encoded)
			},
			None => self.db.put(raw_key, encoded),
		};
		result.map_err(|e| StoreError::Put {
			key: name,
			reason: e.to_string(),
		})
	}

	fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>, StoreError> {
		let name = key.key();
		let RocksDBKey(column_family, raw_key) = RocksDBKey::from(&key);
		let raw = match column_family {
			Some(cf) => {
				let handle = self.cf_handle(cf, &name)?;
				self.db.get_cf(handle, raw_key)
			},
			None => self.db.get(raw_key),
		}
		.map_err(|e| StoreError::Get {
			key: name.clone(),
			reason: e.to_string(),
		})?;

		raw.map(|bytes| {
			serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
				key: name,
				reason: e.to_string(),
			})
		})
		.transpose()
	}

	fn delete<T: RecordKey>(&self, key: T) -> Result<(), StoreError> {
		let name = key.key();
		let RocksDBKey(column_family, raw_key) = RocksDBKey::from(&key);
		let result = match column_family {
			Some(cf) => {
				let handle = self.cf_handle(cf, &name)?;
				self.db.delete_cf(handle, raw_key)
			},
			None => self.db.delete(raw_key),
		};
		result.map_err(|e| StoreError::Put {
			key: name,
			reason: e.to_string(),
		})
	}
}
