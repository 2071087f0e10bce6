//! State machine implementation for the key-value service
//!
//! Commands arrive as opaque bytes from the consensus apply channel and are
//! decoded into [`KvCmd`] here; the core never learns what they mean.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::raft::StateMachine;

/// Commands replicated through the log, bincode-encoded by the service layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCmd {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// In-memory key-value store fed exclusively by committed log entries.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    map: HashMap<String, Vec<u8>>,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore {
            map: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, index: u64, data: &[u8]) {
        match bincode::deserialize::<KvCmd>(data) {
            Ok(KvCmd::Put { key, value }) => {
                self.map.insert(key, value);
            }
            Ok(KvCmd::Delete { key }) => {
                self.map.remove(&key);
            }
            Err(e) => {
                // A committed entry we cannot decode is skipped, not fatal:
                // every replica skips it identically.
                log::warn!("discarding undecodable command at index {}: {}", index, e);
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.map).expect("kv state serialization")
    }

    fn on_snapshot(&mut self, _last_index: u64, _last_term: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match bincode::deserialize(data) {
            Ok(map) => self.map = map,
            Err(e) => log::error!("cannot decode kv snapshot: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(cmd: &KvCmd) -> Vec<u8> {
        bincode::serialize(cmd).unwrap()
    }

    #[test]
    fn test_apply_put_and_delete() {
        let mut store = KvStore::new();
        store.apply(
            1,
            &encoded(&KvCmd::Put {
                key: "k".to_string(),
                value: b"v1".to_vec(),
            }),
        );
        assert_eq!(store.get("k").unwrap(), b"v1");

        store.apply(
            2,
            &encoded(&KvCmd::Put {
                key: "k".to_string(),
                value: b"v2".to_vec(),
            }),
        );
        assert_eq!(store.get("k").unwrap(), b"v2");

        store.apply(3, &encoded(&KvCmd::Delete { key: "k".to_string() }));
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_undecodable_command_is_skipped() {
        let mut store = KvStore::new();
        store.apply(1, b"\xff\xff\xff");
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut store = KvStore::new();
        for i in 0..10 {
            store.apply(
                i,
                &encoded(&KvCmd::Put {
                    key: format!("k{}", i),
                    value: vec![i as u8],
                }),
            );
        }
        let snapshot = store.snapshot();

        let mut restored = KvStore::new();
        restored.on_snapshot(10, 1, &snapshot);
        assert_eq!(restored.len(), 10);
        assert_eq!(restored.get("k3").unwrap(), vec![3]);
    }
}
