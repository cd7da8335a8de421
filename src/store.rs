// Tessera - Replicated key-value store over a token ring, with tunable consistency and a minimal binary peer protocol
// Copyright (C) 2024  tessera authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use bytes::Bytes;

use parking_lot::Mutex;

use uuid::Uuid;

use crate::error::{TesseraError, TesseraResult};

/// Microseconds since the Unix epoch; the resolution write timestamps
/// are recorded at.
pub type Timestamp = u64;

pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A stored payload and the write timestamp competing for its key.
///
/// A tombstone is a value whose data is `None`. Competing values resolve
/// last-writer-wins on the timestamp; ties keep whatever landed first.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub data: Option<Bytes>,
    pub timestamp: Timestamp,
}

impl Value {
    pub fn new(data: Bytes, timestamp: Timestamp) -> Self {
        Self {
            data: Some(data),
            timestamp,
        }
    }

    pub fn tombstone(timestamp: Timestamp) -> Self {
        Self {
            data: None,
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// Named reads a store supports, carried on the wire as one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalKind {
    Get = 0,
}

impl TryFrom<u8> for RetrievalKind {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self, TesseraError> {
        match value {
            x if x == RetrievalKind::Get as u8 => Ok(RetrievalKind::Get),
            x => Err(TesseraError::InvalidInstruction(x)),
        }
    }
}

/// Named writes a store supports, carried on the wire as one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Set = 0,
    Delete = 1,
}

impl TryFrom<u8> for MutationKind {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self, TesseraError> {
        match value {
            x if x == MutationKind::Set as u8 => Ok(MutationKind::Set),
            x if x == MutationKind::Delete as u8 => Ok(MutationKind::Delete),
            x => Err(TesseraError::InvalidInstruction(x)),
        }
    }
}

/// A concrete write to apply on a node, either relayed from a client or
/// produced by read-repair reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub key: String,
    pub value: Option<Bytes>,
    pub timestamp: Timestamp,
}

impl Mutation {
    pub fn set(key: &str, value: Bytes, timestamp: Timestamp) -> Self {
        Self {
            kind: MutationKind::Set,
            key: key.to_string(),
            value: Some(value),
            timestamp,
        }
    }

    pub fn delete(key: &str, timestamp: Timestamp) -> Self {
        Self {
            kind: MutationKind::Delete,
            key: key.to_string(),
            value: None,
            timestamp,
        }
    }
}

pub type SharedStore = Arc<dyn Store>;

/// Picks the winning value out of a set of replica responses.
///
/// Missing values lose against any present value; ties on the timestamp
/// keep the earliest response.
pub fn resolve(values: &[Option<Value>]) -> Option<Value> {
    let mut winner: Option<&Value> = None;

    for value in values.iter().flatten() {
        match winner {
            Some(current) if value.timestamp <= current.timestamp => {}
            _ => winner = Some(value),
        }
    }

    winner.cloned()
}

/// The per-node value container the cluster coordinates over.
///
/// Writes are last-writer-wins: a mutation older than the stored value
/// is a no-op. Deletion writes a tombstone so that replicas which missed
/// the delete converge instead of resurrecting the key.
#[async_trait]
pub trait Store: Send + Sync {
    /// Current value for the key, tombstones included.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Writes the value unless an equal-or-newer one exists. Returns
    /// whether the write took effect.
    async fn set(&self, key: &str, data: Bytes, timestamp: Timestamp) -> bool;

    /// Writes a tombstone unless an equal-or-newer value exists.
    async fn delete(&self, key: &str, timestamp: Timestamp) -> bool;

    /// Snapshot of every known key, tombstones included.
    async fn all_keys(&self) -> Vec<String>;

    /// The serializable record stored under the key.
    async fn get_raw_value(&self, key: &str) -> Option<Value>;

    /// Idempotent last-writer-wins merge of a streamed record.
    async fn set_and_reconcile_raw_value(&self, key: &str, value: Value);

    /// Applies a typed mutation, dispatching on its kind.
    async fn apply(&self, mutation: &Mutation) -> TesseraResult<bool> {
        match mutation.kind {
            MutationKind::Set => {
                let data = mutation.value.clone().ok_or_else(|| {
                    TesseraError::Unsupported("set requires a value".to_string())
                })?;

                Ok(self.set(&mutation.key, data, mutation.timestamp).await)
            }
            MutationKind::Delete => Ok(self.delete(&mutation.key, mutation.timestamp).await),
        }
    }

    /// Reduces the replica responses gathered for a read to the one
    /// canonical value.
    fn resolve_retrieval(
        &self,
        instruction: RetrievalKind,
        _key: &str,
        values: &[Option<Value>],
    ) -> Option<Value> {
        match instruction {
            RetrievalKind::Get => resolve(values),
        }
    }

    /// Per-node writes that bring divergent replicas back to the
    /// canonical value. Nodes that answered nothing are repaired too.
    fn retrieval_repairs(
        &self,
        instruction: RetrievalKind,
        key: &str,
        results: &HashMap<Uuid, Option<Value>>,
    ) -> HashMap<Uuid, Vec<Mutation>> {
        let values: Vec<Option<Value>> = results.values().cloned().collect();
        let canonical = match self.resolve_retrieval(instruction, key, &values) {
            Some(value) => value,
            None => return HashMap::new(),
        };

        let mut repairs = HashMap::new();

        for (node_id, value) in results {
            if value.as_ref() == Some(&canonical) {
                continue;
            }

            let mutation = match &canonical.data {
                Some(data) => Mutation::set(key, data.clone(), canonical.timestamp),
                None => Mutation::delete(key, canonical.timestamp),
            };

            repairs.insert(*node_id, vec![mutation]);
        }

        repairs
    }
}

/// In-memory store: a mutex-guarded map of key to timestamped value.
///
/// This is the container the contract promises; nothing survives the
/// process.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    async fn set(&self, key: &str, data: Bytes, timestamp: Timestamp) -> bool {
        let mut map = self.data.lock();

        if let Some(existing) = map.get(key) {
            if existing.timestamp >= timestamp {
                return false;
            }
        }

        map.insert(key.to_string(), Value::new(data, timestamp));

        true
    }

    async fn delete(&self, key: &str, timestamp: Timestamp) -> bool {
        let mut map = self.data.lock();

        if let Some(existing) = map.get(key) {
            if existing.timestamp >= timestamp {
                return false;
            }
        }

        map.insert(key.to_string(), Value::tombstone(timestamp));

        true
    }

    async fn all_keys(&self) -> Vec<String> {
        self.data.lock().keys().cloned().collect()
    }

    async fn get_raw_value(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    async fn set_and_reconcile_raw_value(&self, key: &str, value: Value) {
        let mut map = self.data.lock();

        if let Some(existing) = map.get(key) {
            if existing.timestamp >= value.timestamp {
                return;
            }
        }

        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(data: &'static [u8], timestamp: Timestamp) -> Value {
        Value::new(Bytes::from_static(data), timestamp)
    }

    #[tokio::test]
    async fn newer_writes_win() {
        let store = MemoryStore::new();

        assert!(store.set("k", Bytes::from_static(b"v1"), 10).await);
        assert!(store.set("k", Bytes::from_static(b"v2"), 20).await);
        assert!(!store.set("k", Bytes::from_static(b"stale"), 15).await);

        assert_eq!(store.get("k").await, Some(value(b"v2", 20)));
    }

    #[tokio::test]
    async fn deletes_leave_tombstones() {
        let store = MemoryStore::new();

        store.set("k", Bytes::from_static(b"v1"), 10).await;
        assert!(store.delete("k", 20).await);

        let stored = store.get("k").await.unwrap();
        assert!(stored.is_tombstone());
        assert_eq!(stored.timestamp, 20);

        // a stale write cannot resurrect the key
        assert!(!store.set("k", Bytes::from_static(b"zombie"), 15).await);
        assert!(store.get("k").await.unwrap().is_tombstone());

        // tombstones stay visible to the key iterator
        assert_eq!(store.all_keys().await, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_and_commutative() {
        let records = vec![
            ("a".to_string(), value(b"1", 10)),
            ("a".to_string(), value(b"2", 30)),
            ("b".to_string(), value(b"3", 5)),
            ("a".to_string(), value(b"ignored", 20)),
        ];

        // apply in several orders, twice each, and expect the same state
        let orders: Vec<Vec<usize>> = vec![vec![0, 1, 2, 3], vec![3, 2, 1, 0], vec![1, 3, 0, 2]];

        for order in orders {
            let store = MemoryStore::new();

            for &i in &order {
                let (key, val) = &records[i];
                store.set_and_reconcile_raw_value(key, val.clone()).await;
            }
            for &i in order.iter().rev() {
                let (key, val) = &records[i];
                store.set_and_reconcile_raw_value(key, val.clone()).await;
            }

            assert_eq!(store.get("a").await, Some(value(b"2", 30)));
            assert_eq!(store.get("b").await, Some(value(b"3", 5)));
        }
    }

    #[test]
    fn resolution_prefers_the_newest_value() {
        let values = vec![
            Some(value(b"old", 10)),
            None,
            Some(value(b"new", 30)),
            Some(value(b"mid", 20)),
        ];

        assert_eq!(resolve(&values), Some(value(b"new", 30)));
        assert_eq!(resolve(&[None, None]), None);
        assert_eq!(resolve(&[]), None);
    }

    #[test]
    fn resolution_ties_keep_the_first_response() {
        let values = vec![Some(value(b"first", 10)), Some(value(b"second", 10))];

        assert_eq!(resolve(&values), Some(value(b"first", 10)));
    }

    #[test]
    fn repairs_target_divergent_replicas() {
        let store = MemoryStore::new();

        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        let n3 = Uuid::new_v4();

        let mut results = HashMap::new();
        results.insert(n1, Some(value(b"new", 30)));
        results.insert(n2, Some(value(b"old", 10)));
        results.insert(n3, None);

        let repairs = store.retrieval_repairs(RetrievalKind::Get, "k", &results);

        assert!(!repairs.contains_key(&n1));

        for node in [n2, n3] {
            let mutations = &repairs[&node];
            assert_eq!(mutations.len(), 1);
            assert_eq!(
                mutations[0],
                Mutation::set("k", Bytes::from_static(b"new"), 30)
            );
        }
    }

    #[test]
    fn tombstone_repairs_are_deletes() {
        let store = MemoryStore::new();

        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();

        let mut results = HashMap::new();
        results.insert(n1, Some(Value::tombstone(30)));
        results.insert(n2, Some(value(b"stale", 10)));

        let repairs = store.retrieval_repairs(RetrievalKind::Get, "k", &results);

        assert_eq!(repairs[&n2], vec![Mutation::delete("k", 30)]);
        assert!(!repairs.contains_key(&n1));
    }

    #[test]
    fn all_missing_needs_no_repairs() {
        let store = MemoryStore::new();

        let mut results = HashMap::new();
        results.insert(Uuid::new_v4(), None);
        results.insert(Uuid::new_v4(), None);

        assert!(store
            .retrieval_repairs(RetrievalKind::Get, "k", &results)
            .is_empty());
    }
}
