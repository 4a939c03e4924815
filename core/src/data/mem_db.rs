use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use crate::data::Database;
use crate::errors::StoreError;

use super::RecordKey;

#[derive(Clone, Default)]
pub struct MemoryDB {
	map: Arc<RwLock<HashMap<HashMapKey, String>>>,
}

#[derive(Eq, Hash, PartialEq)]
pub struct HashMapKey(pub String);

impl<T: RecordKey> From<T> for HashMapKey {
	fn from(value: T) -> Self {
		let key = value.key();
		HashMapKey(match value.space() {
			Some(space) => format!("{space}::{key}"),
			None => key,
		})
	}
}

impl Database for MemoryDB {
	fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<(), StoreError> {
		// Records are fixed structs; failing to encode one is a programming
		// error, not a runtime condition.
		let encoded = serde_json::to_string(&value).expect("encoding record for the store failed");
		let mut map = self.map.write().expect("lock acquired");
		map.insert(key.into(), encoded);
		Ok(())
	}

	fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>, StoreError> {
		let name = key.key();
		let map = self.map.read().expect("lock acquired");
		map.get(&key.into())
			.map(|value| {
				serde_json::from_str(value).map_err(|e| StoreError::Corrupt {
					key: name,
					reason: e.to_string(),
				})
			})
			.transpose()
	}

	fn delete<T: RecordKey>(&self, key: T) -> Result<(), StoreError> {
		let mut map = self.map.write().expect("lock acquired");
		map.remove(&key.into());
		Ok(())
	}
}
