//! Durable local key-value store backing the replicated state machine.
//!
//! sled provides the MVCC the read path relies on: `get` and `keys` never
//! block the apply path. Every mutation is flushed before it is reported
//! successful, and every applied mutation records the log index it came
//! from in the same atomic batch, so replay after a restart skips entries
//! the store already holds.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::NodeError;

/// Reserved key space. User keys are printable, so a leading NUL byte can
/// never collide.
const APPLIED_INDEX_KEY: &[u8] = b"\x00nubedb:applied_index";
const INTERNAL_PREFIX: u8 = 0;

pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open(dir: &Path) -> Result<KvStore, NodeError> {
        let db = sled::open(dir).map_err(|e| NodeError::fatal("couldn't open local store", e))?;
        Ok(KvStore { db })
    }

    /// Point lookup of the value bytes stored under `key`.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, NodeError> {
        match self
            .db
            .get(key.as_bytes())
            .map_err(|e| NodeError::fatal("couldn't read from local store", e))?
        {
            Some(v) => Ok(v.to_vec()),
            None => Err(NodeError::NotFound),
        }
    }

    /// Stores `value` under `key` at log position `index`.
    pub fn apply_set(&self, key: &str, value: &[u8], index: u64) -> Result<(), NodeError> {
        let mut batch = sled::Batch::default();
        batch.insert(key.as_bytes(), value);
        batch.insert(APPLIED_INDEX_KEY, &index.to_be_bytes()[..]);
        self.apply(batch)
    }

    /// Removes `key` at log position `index`. Deleting an absent key is a
    /// semantic error surfaced to the submitter; the applied index still
    /// advances because the entry was committed.
    pub fn apply_delete(&self, key: &str, index: u64) -> Result<(), NodeError> {
        let existed = self
            .db
            .contains_key(key.as_bytes())
            .map_err(|e| NodeError::fatal("couldn't read from local store", e))?;
        let mut batch = sled::Batch::default();
        if existed {
            batch.remove(key.as_bytes());
        }
        batch.insert(APPLIED_INDEX_KEY, &index.to_be_bytes()[..]);
        self.apply(batch)?;
        if existed {
            Ok(())
        } else {
            Err(NodeError::NotFound)
        }
    }

    fn apply(&self, batch: sled::Batch) -> Result<(), NodeError> {
        self.db
            .apply_batch(batch)
            .map_err(|e| NodeError::fatal("couldn't write to local store", e))?;
        self.db
            .flush()
            .map_err(|e| NodeError::fatal("couldn't flush local store", e))?;
        Ok(())
    }

    /// Index of the last entry applied to this store, 0 when none.
    pub fn applied_index(&self) -> Result<u64, NodeError> {
        match self
            .db
            .get(APPLIED_INDEX_KEY)
            .map_err(|e| NodeError::fatal("couldn't read from local store", e))?
        {
            Some(v) => {
                let raw: [u8; 8] = v
                    .as_ref()
                    .try_into()
                    .map_err(|_| NodeError::Fatal("malformed applied index".to_string()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Enumerates every user key in order.
    pub fn keys(&self) -> Result<Vec<String>, NodeError> {
        let mut keys = Vec::new();
        for item in self.db.iter() {
            let (k, _) = item.map_err(|e| NodeError::fatal("couldn't scan local store", e))?;
            if k.first() == Some(&INTERNAL_PREFIX) {
                continue;
            }
            keys.push(String::from_utf8_lossy(&k).into_owned());
        }
        Ok(keys)
    }

    /// Full ordered image of the user key space.
    pub fn dump(&self) -> Result<BTreeMap<String, Vec<u8>>, NodeError> {
        let mut image = BTreeMap::new();
        for item in self.db.iter() {
            let (k, v) = item.map_err(|e| NodeError::fatal("couldn't scan local store", e))?;
            if k.first() == Some(&INTERNAL_PREFIX) {
                continue;
            }
            image.insert(String::from_utf8_lossy(&k).into_owned(), v.to_vec());
        }
        Ok(image)
    }

    /// Atomically replaces the whole store with `image`, recording
    /// `applied` as the log position the image corresponds to. One batch,
    /// all or nothing.
    pub fn replace(&self, image: BTreeMap<String, Vec<u8>>, applied: u64) -> Result<(), NodeError> {
        let mut batch = sled::Batch::default();
        for item in self.db.iter() {
            let (k, _) = item.map_err(|e| NodeError::fatal("couldn't scan local store", e))?;
            batch.remove(k);
        }
        for (k, v) in image {
            batch.insert(k.as_bytes(), v);
        }
        batch.insert(APPLIED_INDEX_KEY, &applied.to_be_bytes()[..]);
        self.apply(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, KvStore) {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn set_get_delete() {
        let (_dir, store) = open_store();
        store.apply_set("alpha", b"1", 1).unwrap();
        assert_eq!(store.get("alpha").unwrap(), b"1");
        store.apply_delete("alpha", 2).unwrap();
        assert!(matches!(store.get("alpha"), Err(NodeError::NotFound)));
    }

    #[test]
    fn delete_missing_reports_not_found_but_advances() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.apply_delete("ghost", 1),
            Err(NodeError::NotFound)
        ));
        assert_eq!(store.applied_index().unwrap(), 1);
    }

    #[test]
    fn keys_exclude_internal_entries() {
        let (_dir, store) = open_store();
        store.apply_set("b", b"2", 1).unwrap();
        store.apply_set("a", b"1", 2).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["a", "b"]);
        assert_eq!(store.applied_index().unwrap(), 2);
    }

    #[test]
    fn replace_is_a_full_image() {
        let (_dir, store) = open_store();
        store.apply_set("old", b"x", 1).unwrap();
        let mut image = BTreeMap::new();
        image.insert("new".to_string(), b"y".to_vec());
        store.replace(image, 9).unwrap();
        assert!(matches!(store.get("old"), Err(NodeError::NotFound)));
        assert_eq!(store.get("new").unwrap(), b"y");
        assert_eq!(store.applied_index().unwrap(), 9);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(dir.path()).unwrap();
            store.apply_set("k", b"v", 3).unwrap();
        }
        let store = KvStore::open(dir.path()).unwrap();
        assert_eq!(store.get("k").unwrap(), b"v");
        assert_eq!(store.applied_index().unwrap(), 3);
    }
}
