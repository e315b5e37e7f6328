//! Replicated state machine: deterministic application of committed log
//! entries to the local key-value store.
//!
//! The `Payload` encoding here is the one canonical encoding of a command.
//! It is what travels in log entries and what followers forward to the
//! leader, so both sides always agree byte for byte. serde_json keeps
//! object keys ordered, which makes re-encoding a decoded value canonical.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::consensus::StateMachine;
use crate::error::NodeError;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "SET")]
    Set,
    #[serde(rename = "DELETE")]
    Delete,
}

/// The application-level command submitted through the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub operation: Operation,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Payload {
    pub fn set(key: &str, value: Value) -> Payload {
        Payload {
            operation: Operation::Set,
            key: key.to_string(),
            value: Some(value),
        }
    }

    pub fn delete(key: &str) -> Payload {
        Payload {
            operation: Operation::Delete,
            key: key.to_string(),
            value: None,
        }
    }

    /// Rejects keys the data model does not admit. Runs where commands
    /// enter the system, before anything is proposed; committed entries
    /// are past this check on every replica.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.key.is_empty() {
            return Err(NodeError::InvalidPayload("key must not be empty".to_string()));
        }
        if self.key.chars().any(|c| c.is_control()) {
            return Err(NodeError::InvalidPayload(
                "key must be printable".to_string(),
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, NodeError> {
        serde_json::to_vec(self).map_err(|e| NodeError::fatal("couldn't encode payload", e))
    }

    /// Decodes command bytes. On the apply path a failure here is fatal:
    /// the bytes were committed, so malformed input means corruption, not
    /// a bad client.
    pub fn decode(data: &[u8]) -> Result<Payload, NodeError> {
        serde_json::from_slice(data).map_err(|e| NodeError::fatal("couldn't decode payload", e))
    }
}

/// The database state machine. Cheap to clone; the consensus actor holds
/// one clone for the apply path while the public read surface holds
/// another.
#[derive(Clone)]
pub struct DatabaseFsm {
    store: Arc<KvStore>,
}

impl DatabaseFsm {
    pub fn new(store: Arc<KvStore>) -> DatabaseFsm {
        DatabaseFsm { store }
    }

    /// Reads a value from the LOCAL replica and decodes it.
    ///
    /// Not linearizable: a lagging replica returns the value as of its
    /// last applied entry.
    pub fn get(&self, key: &str) -> Result<Value, NodeError> {
        let bytes = self.store.get(key)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| NodeError::fatal("couldn't decode stored value", e))
    }

    pub fn keys(&self) -> Result<Vec<String>, NodeError> {
        self.store.keys()
    }

    pub fn applied_index(&self) -> Result<u64, NodeError> {
        self.store.applied_index()
    }
}

impl StateMachine for DatabaseFsm {
    fn apply(&mut self, index: u64, data: &[u8]) -> Result<(), NodeError> {
        // Replay after a restart: the store already holds this entry.
        if index <= self.store.applied_index()? {
            return Ok(());
        }
        let payload = Payload::decode(data)?;
        match payload.operation {
            Operation::Set => {
                let value = payload.value.unwrap_or(Value::Null);
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| NodeError::fatal("couldn't encode value", e))?;
                self.store.apply_set(&payload.key, &bytes, index)
            }
            Operation::Delete => self.store.apply_delete(&payload.key, index),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, NodeError> {
        let mut image: BTreeMap<String, Value> = BTreeMap::new();
        for (key, bytes) in self.store.dump()? {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| NodeError::fatal("couldn't decode stored value", e))?;
            image.insert(key, value);
        }
        serde_json::to_vec(&image).map_err(|e| NodeError::fatal("couldn't encode snapshot", e))
    }

    fn restore(&mut self, last_index: u64, _last_term: u64, data: &[u8]) -> Result<(), NodeError> {
        let image: BTreeMap<String, Value> = if data.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(data)
                .map_err(|e| NodeError::fatal("couldn't decode snapshot", e))?
        };
        let mut raw = BTreeMap::new();
        for (key, value) in image {
            let bytes = serde_json::to_vec(&value)
                .map_err(|e| NodeError::fatal("couldn't encode value", e))?;
            raw.insert(key, bytes);
        }
        self.store.replace(raw, last_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_fsm() -> (TempDir, DatabaseFsm) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KvStore::open(dir.path()).unwrap());
        (dir, DatabaseFsm::new(store))
    }

    #[test]
    fn payload_encoding_round_trips() {
        let payload = Payload::set("greeting", json!({"text": "hola", "lang": "es"}));
        let decoded = Payload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded.operation, Operation::Set);
        assert_eq!(decoded.key, "greeting");
        assert_eq!(decoded.value, payload.value);
    }

    #[test]
    fn payload_validation_rejects_bad_keys() {
        assert!(Payload::set("", json!(1)).validate().is_err());
        assert!(Payload::delete("a\nb").validate().is_err());
        assert!(Payload::set("ok key", json!(1)).validate().is_ok());
    }

    #[test]
    fn operations_serialize_as_wire_names() {
        let encoded = Payload::delete("k").encode().unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("\"DELETE\""));
        assert!(!text.contains("value"));
    }

    #[test]
    fn apply_set_then_get() {
        let (_dir, mut fsm) = open_fsm();
        let entry = Payload::set("k", json!([1, 2, 3])).encode().unwrap();
        fsm.apply(1, &entry).unwrap();
        assert_eq!(fsm.get("k").unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn delete_missing_is_semantic_not_fatal() {
        let (_dir, mut fsm) = open_fsm();
        let entry = Payload::delete("ghost").encode().unwrap();
        let err = fsm.apply(1, &entry).unwrap_err();
        assert!(matches!(err, NodeError::NotFound));
        assert!(!err.is_fatal());
    }

    #[test]
    fn replayed_entries_are_skipped() {
        let (_dir, mut fsm) = open_fsm();
        let set = Payload::set("k", json!("v")).encode().unwrap();
        let del = Payload::delete("k").encode().unwrap();
        fsm.apply(1, &set).unwrap();
        fsm.apply(2, &del).unwrap();
        // A replay of the SET must not resurrect the key.
        fsm.apply(1, &set).unwrap();
        assert!(matches!(fsm.get("k"), Err(NodeError::NotFound)));
    }

    #[test]
    fn identical_entries_produce_identical_states() {
        let (_a, mut fsm_a) = open_fsm();
        let (_b, mut fsm_b) = open_fsm();
        let entries = vec![
            Payload::set("x", json!({"b": 1, "a": 2})).encode().unwrap(),
            Payload::set("y", json!("s")).encode().unwrap(),
            Payload::delete("x").encode().unwrap(),
            Payload::set("x", json!(null)).encode().unwrap(),
        ];
        for (i, entry) in entries.iter().enumerate() {
            let _ = fsm_a.apply(i as u64 + 1, entry);
            let _ = fsm_b.apply(i as u64 + 1, entry);
        }
        assert_eq!(fsm_a.snapshot().unwrap(), fsm_b.snapshot().unwrap());
    }

    #[test]
    fn snapshot_restore_is_identity() {
        let (_dir, mut fsm) = open_fsm();
        for i in 0..10 {
            let entry = Payload::set(&format!("key{i}"), json!(i)).encode().unwrap();
            fsm.apply(i + 1, &entry).unwrap();
        }
        let image = fsm.snapshot().unwrap();

        let (_other, mut restored) = open_fsm();
        restored.restore(10, 1, &image).unwrap();
        assert_eq!(restored.snapshot().unwrap(), image);
        assert_eq!(restored.keys().unwrap(), fsm.keys().unwrap());
        assert_eq!(restored.applied_index().unwrap(), 10);
    }

    #[test]
    fn restore_from_empty_data_clears_state() {
        let (_dir, mut fsm) = open_fsm();
        let entry = Payload::set("k", json!("v")).encode().unwrap();
        fsm.apply(1, &entry).unwrap();
        fsm.restore(5, 1, &[]).unwrap();
        assert!(fsm.keys().unwrap().is_empty());
        assert_eq!(fsm.applied_index().unwrap(), 5);
    }
}
