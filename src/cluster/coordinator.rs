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
use std::time::Duration;

use bytes::Bytes;

use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};

use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::{TesseraError, TesseraResult};
use crate::node::Node;
use crate::store::{
    now_micros, Mutation, MutationKind, RetrievalKind, SharedStore, Timestamp, Value,
};

/// Time allowed for each replica reply before the gather loop and the
/// background reconciler give up on it.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// How many replica acknowledgements a request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    One,
    Quorum,
    All,
}

impl ConsistencyLevel {
    /// Replies required out of `replicas` responses.
    pub fn replies_required(&self, replicas: usize) -> usize {
        match self {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => replicas / 2 + 1,
            ConsistencyLevel::All => replicas,
        }
    }
}

pub const DEFAULT_READ_CONSISTENCY: ConsistencyLevel = ConsistencyLevel::Quorum;
pub const DEFAULT_WRITE_CONSISTENCY: ConsistencyLevel = ConsistencyLevel::Quorum;

type ReadReply = (Uuid, TesseraResult<Option<Value>>);
type WriteReply = (Uuid, TesseraResult<bool>);

impl Cluster {
    /// Executes a read against every replica of the key and returns the
    /// resolved payload once enough replies are in.
    ///
    /// A task per replica pushes its result into a channel; the gather
    /// loop waits for the consistency level's reply count, resolves the
    /// canonical value, and leaves a background task to drain the rest
    /// and repair divergent replicas. `synchronous` waits for that
    /// repair pass too.
    ///
    /// A sub-request that targets the local node fails while this node
    /// is initializing or streaming; the quorum can still be met by the
    /// other replicas.
    pub async fn execute_retrieval(
        &self,
        instruction: RetrievalKind,
        key: &str,
        consistency: Option<ConsistencyLevel>,
        synchronous: bool,
    ) -> TesseraResult<Option<Bytes>> {
        let nodes = self.owners_of_key(key);

        if nodes.is_empty() {
            return Err(TesseraError::Unsupported(
                "no nodes own this key".to_string(),
            ));
        }

        let consistency = consistency.unwrap_or(DEFAULT_READ_CONSISTENCY);
        let required = consistency.replies_required(nodes.len());
        let local_blocked = self.is_initializing() || self.is_streaming();

        let (tx, mut rx) = mpsc::channel::<ReadReply>(nodes.len());

        for node in &nodes {
            let tx = tx.clone();
            let node = node.clone();
            let key = key.to_string();
            let blocked = local_blocked && node.is_local();

            tokio::spawn(async move {
                let result = if blocked {
                    Err(TesseraError::Unsupported(
                        "queries against initializing nodes are not supported".to_string(),
                    ))
                } else {
                    node.execute_retrieval(instruction, &key).await
                };

                let _ = tx.send((node.node_id(), result)).await;
            });
        }

        drop(tx);

        let mut collected: Vec<ReadReply> = Vec::with_capacity(nodes.len());
        let mut replies: Vec<Option<Value>> = Vec::new();

        while replies.len() < required {
            match timeout(RESPONSE_TIMEOUT, rx.recv()).await {
                Ok(Some((node_id, result))) => {
                    match &result {
                        Ok(value) => replies.push(value.clone()),
                        Err(e) => debug!("Replica read failed (node = {}): {}", node_id, e),
                    }

                    collected.push((node_id, result));
                }
                Ok(None) | Err(_) => {
                    return Err(TesseraError::QuorumTimeout {
                        required,
                        received: replies.len(),
                    });
                }
            }
        }

        let canonical = self.store().resolve_retrieval(instruction, key, &replies);

        let reconciler = tokio::spawn(finalize_retrieval(
            self.store().clone(),
            nodes,
            instruction,
            key.to_string(),
            collected,
            rx,
        ));

        if synchronous {
            let _ = reconciler.await;
        }

        Ok(canonical.and_then(|value| value.data))
    }

    /// Executes a write against every replica of the key.
    ///
    /// The timestamp defaults to now; replicas apply last-writer-wins
    /// locally, so a stale coordinator write converges to a no-op.
    /// Returns whether any replica actually applied the write.
    pub async fn execute_mutation(
        &self,
        instruction: MutationKind,
        key: &str,
        value: Option<Bytes>,
        timestamp: Option<Timestamp>,
        consistency: Option<ConsistencyLevel>,
        synchronous: bool,
    ) -> TesseraResult<bool> {
        let mutation = Mutation {
            kind: instruction,
            key: key.to_string(),
            value,
            timestamp: timestamp.unwrap_or_else(now_micros),
        };

        let nodes = self.owners_of_key(key);

        if nodes.is_empty() {
            return Err(TesseraError::Unsupported(
                "no nodes own this key".to_string(),
            ));
        }

        let consistency = consistency.unwrap_or(DEFAULT_WRITE_CONSISTENCY);
        let required = consistency.replies_required(nodes.len());
        let local_blocked = self.is_initializing() || self.is_streaming();

        let (tx, mut rx) = mpsc::channel::<WriteReply>(nodes.len());

        for node in &nodes {
            let tx = tx.clone();
            let node = node.clone();
            let mutation = mutation.clone();
            let blocked = local_blocked && node.is_local();

            tokio::spawn(async move {
                let result = if blocked {
                    Err(TesseraError::Unsupported(
                        "queries against initializing nodes are not supported".to_string(),
                    ))
                } else {
                    node.execute_mutation(&mutation).await
                };

                let _ = tx.send((node.node_id(), result)).await;
            });
        }

        drop(tx);

        let total = nodes.len();
        let mut received = 0usize;
        let mut acks: Vec<bool> = Vec::new();

        while acks.len() < required {
            match timeout(RESPONSE_TIMEOUT, rx.recv()).await {
                Ok(Some((node_id, result))) => {
                    received += 1;

                    match result {
                        Ok(applied) => acks.push(applied),
                        Err(e) => debug!("Replica write failed (node = {}): {}", node_id, e),
                    }
                }
                Ok(None) | Err(_) => {
                    return Err(TesseraError::QuorumTimeout {
                        required,
                        received: acks.len(),
                    });
                }
            }
        }

        let applied = acks.iter().any(|a| *a);

        // hint distribution for unresponsive replicas would hang off
        // this task; for now it only drains the stragglers
        let reconciler = tokio::spawn(finalize_mutation(total, received, rx));

        if synchronous {
            let _ = reconciler.await;
        }

        Ok(applied)
    }
}

/// Drains the replies the gather loop did not wait for, then writes the
/// canonical value back to every divergent or silent replica.
///
/// Failures here are logged and dropped; repair is an optimization, not
/// a correctness requirement.
async fn finalize_retrieval(
    store: SharedStore,
    nodes: Vec<Node>,
    instruction: RetrievalKind,
    key: String,
    mut collected: Vec<ReadReply>,
    mut rx: mpsc::Receiver<ReadReply>,
) {
    let deadline = Instant::now() + RESPONSE_TIMEOUT;

    while collected.len() < nodes.len() {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(reply)) => collected.push(reply),
            Ok(None) | Err(_) => break,
        }
    }

    let mut results: HashMap<Uuid, Option<Value>> = HashMap::new();

    for node in &nodes {
        results.insert(node.node_id(), None);
    }

    for (node_id, result) in collected {
        results.insert(node_id, result.ok().flatten());
    }

    let repairs = store.retrieval_repairs(instruction, &key, &results);

    for (node_id, mutations) in repairs {
        let node = match nodes.iter().find(|n| n.node_id() == node_id) {
            Some(node) => node,
            None => continue,
        };

        for mutation in mutations {
            match node.execute_mutation(&mutation).await {
                Ok(_) => debug!("Read repair applied (node = {}) (key = {})", node_id, key),
                Err(e) => warn!(
                    "Read repair failed (node = {}) (key = {}): {}",
                    node_id, key, e
                ),
            }
        }
    }
}

/// Waits out the write replies the gather loop left behind.
async fn finalize_mutation(total: usize, mut received: usize, mut rx: mpsc::Receiver<WriteReply>) {
    let deadline = Instant::now() + RESPONSE_TIMEOUT;

    while received < total {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((node_id, result))) => {
                received += 1;

                if let Err(e) = result {
                    debug!("Late replica write failed (node = {}): {}", node_id, e);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}
