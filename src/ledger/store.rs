//! Key-value persistence under the ledger.
//!
//! The ledger needs nothing more than atomic single-key reads and writes plus
//! a prefix scan. [`MemoryStore`] backs tests and throwaway runs,
//! [`FjallStore`] keeps the ledger on disk.

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::LedgerError;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), LedgerError>;

    fn delete(&self, key: &str) -> Result<(), LedgerError>;

    /// Every pair whose key starts with `prefix`, in key order
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, LedgerError>;

    /// Make completed writes durable
    fn flush(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), LedgerError> {
        self.map.write().remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, LedgerError> {
        let map = self.map.read();
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

pub struct FjallStore {
    keyspace: Keyspace,
    entries: PartitionHandle,
}

impl FjallStore {
    const PARTITION: &'static str = "ledger";

    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let keyspace = Config::new(path).open()?;
        let entries = keyspace.open_partition(Self::PARTITION, PartitionCreateOptions::default())?;
        tracing::debug!(path = %path.display(), "opened ledger store");
        Ok(Self { keyspace, entries })
    }
}

impl KvStore for FjallStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.entries.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        self.entries.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), LedgerError> {
        self.entries.remove(key)?;
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, LedgerError> {
        self.entries
            .prefix(prefix)
            .map(|item| {
                let (k, v) = item?;
                Ok((String::from_utf8_lossy(&k).into_owned(), v.to_vec()))
            })
            .collect()
    }

    fn flush(&self) -> Result<(), LedgerError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) {
        store.put("entry/b", b"2").unwrap();
        store.put("entry/a", b"1").unwrap();
        store.put("other/c", b"3").unwrap();

        assert_eq!(store.get("entry/a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("entry/zz").unwrap(), None);

        let keys: Vec<_> = store
            .scan("entry/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["entry/a", "entry/b"]);

        store.delete("entry/a").unwrap();
        store.delete("entry/a").unwrap();
        assert_eq!(store.scan("entry/").unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_fjall_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FjallStore::open(dir.path()).unwrap();
            exercise(&store);
            store.flush().unwrap();
        }
        let reopened = FjallStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("entry/b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(reopened.get("entry/a").unwrap(), None);
    }
}
