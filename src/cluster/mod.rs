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

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{TesseraError, TesseraResult};
use crate::node::{LocalNode, Node, RemoteNode};
use crate::partitioner::{Partitioner, Token};
use crate::protocol::{Body, Message, PeerInfo};
use crate::ring::Ring;
use crate::store::{SharedStore, Value};

mod coordinator;

pub use coordinator::{ConsistencyLevel, DEFAULT_READ_CONSISTENCY, DEFAULT_WRITE_CONSISTENCY};

/// Where the node is in its lifecycle.
///
/// `Initializing` is only enterable at construction: a brand-new node
/// that must stream its share of the data before serving. `Streaming`
/// covers any later inbound streams caused by topology changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Initializing,
    Streaming,
    Normal,
}

/// The local view of the cluster: the node map, the ring built from it,
/// and the coordination logic for membership changes and streaming.
///
/// A replication factor of 0 mirrors all data to all nodes.
pub struct Cluster {
    local: Arc<LocalNode>,
    partitioner: Arc<dyn Partitioner>,
    seeds: Vec<SocketAddr>,
    replication_factor: usize,

    nodes: RwLock<HashMap<Uuid, Node>>,
    ring: RwLock<Arc<Ring>>,

    /// The pre-join ring, retained while initializing so reads can still
    /// be routed via the previous owners.
    previous_ring: RwLock<Option<Arc<Ring>>>,

    status: RwLock<ClusterStatus>,

    /// Peers currently streaming data to this node.
    streaming_nodes: Mutex<HashSet<Uuid>>,

    is_online: AtomicBool,
}

impl Cluster {
    pub fn new(
        local: Arc<LocalNode>,
        partitioner: Arc<dyn Partitioner>,
        seeds: Vec<SocketAddr>,
        replication_factor: usize,
        status: ClusterStatus,
    ) -> Cluster {
        let mut nodes = HashMap::new();
        nodes.insert(local.node_id(), Node::Local(local.clone()));

        let ring = Arc::new(Ring::new(
            nodes.values().cloned().collect(),
            replication_factor,
        ));

        Cluster {
            local,
            partitioner,
            seeds,
            replication_factor,
            nodes: RwLock::new(nodes),
            ring: RwLock::new(ring),
            previous_ring: RwLock::new(None),
            status: RwLock::new(status),
            streaming_nodes: Mutex::new(HashSet::new()),
            is_online: AtomicBool::new(false),
        }
    }

    // ------------- accessors -------------

    pub fn node_id(&self) -> Uuid {
        self.local.node_id()
    }

    pub fn token(&self) -> Token {
        self.local.token()
    }

    pub fn name(&self) -> Option<String> {
        self.local.name()
    }

    pub fn store(&self) -> &SharedStore {
        self.local.store()
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.partitioner
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn status(&self) -> ClusterStatus {
        *self.status.read()
    }

    pub fn is_initializing(&self) -> bool {
        self.status() == ClusterStatus::Initializing
    }

    pub fn is_streaming(&self) -> bool {
        self.status() == ClusterStatus::Streaming
    }

    pub fn is_normal(&self) -> bool {
        self.status() == ClusterStatus::Normal
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn contains(&self, node_id: Uuid) -> bool {
        self.nodes.read().contains_key(&node_id)
    }

    pub fn get_node(&self, node_id: Uuid) -> Option<Node> {
        self.nodes.read().get(&node_id).cloned()
    }

    /// Every known node except the local one.
    pub fn get_peers(&self) -> Vec<Arc<RemoteNode>> {
        self.nodes
            .read()
            .values()
            .filter_map(|n| n.as_remote().cloned())
            .collect()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.get_peers().iter().map(|p| p.peer_info()).collect()
    }

    pub fn ring(&self) -> Arc<Ring> {
        self.ring.read().clone()
    }

    pub fn previous_ring(&self) -> Option<Arc<Ring>> {
        self.previous_ring.read().clone()
    }

    /// Peers currently streaming data to this node.
    pub fn streaming_from(&self) -> HashSet<Uuid> {
        self.streaming_nodes.lock().clone()
    }

    // ------------- start/stop -------------

    /// Brings the cluster view online: meets the seeds (or re-discovers
    /// known peers), rebuilds the ring, and bootstraps data if this node
    /// is brand new.
    pub async fn start(&self) -> TesseraResult<()> {
        if self.get_peers().is_empty() {
            self.connect_to_seeds().await;
        } else {
            self.discover_peers(None).await;
        }

        self.is_online.store(true, Ordering::SeqCst);
        self.refresh_ring();

        if self.is_initializing() {
            self.join_cluster().await?;
        }

        Ok(())
    }

    pub fn stop(&self) {
        self.is_online.store(false, Ordering::SeqCst);

        for peer in self.get_peers() {
            peer.stop();
        }
    }

    // ------------- membership -------------

    /// Tries each seed in order until one handshake succeeds, then leans
    /// on discovery to meet the rest of the cluster.
    async fn connect_to_seeds(&self) {
        for &address in &self.seeds {
            match self.handshake_seed(address).await {
                Ok(node_id) => {
                    info!("Connected to seed (addr = {}) (id = {})", address, node_id);
                    return;
                }
                Err(e) => {
                    warn!("Seed unreachable (addr = {}): {}", address, e);
                }
            }
        }
    }

    async fn handshake_seed(&self, address: SocketAddr) -> TesseraResult<Uuid> {
        let mut conn = Connection::connect(address).await?;

        let request = Message::new(
            self.node_id(),
            Body::ConnectionRequest {
                address: self.local.address(),
                token: self.local.token(),
                name: self.local.name(),
            },
        );

        let response = conn.request(request).await?;
        let kind = response.kind();
        let sender = response.sender;

        match response.body {
            Body::ConnectionAccepted { token, name } => {
                let node = self.add_node(sender, address, token, name).await?;

                if let Some(remote) = node.as_remote() {
                    remote.add_conn(conn);
                }

                Ok(sender)
            }
            Body::ConnectionRefused { reason } => Err(TesseraError::ConnectionRefused(reason)),
            _ => Err(TesseraError::UnexpectedMessage(kind)),
        }
    }

    /// Registers a remote node and transitively discovers its peers.
    ///
    /// Insertion is set-once: concurrent callers racing on the same id
    /// both observe the instance that won.
    pub async fn add_node(
        &self,
        node_id: Uuid,
        address: SocketAddr,
        token: Token,
        name: Option<String>,
    ) -> TesseraResult<Node> {
        if node_id == self.node_id() {
            return Ok(Node::Local(self.local.clone()));
        }

        if let Some(remote) = self.insert_remote(node_id, address, token, name).await {
            self.discover_peers(Some(vec![remote.node_id()])).await;
        }

        self.get_node(node_id)
            .ok_or(TesseraError::UnknownNode(node_id))
    }

    /// Inserts the node if absent and connects to it. Returns the new
    /// remote only when this call actually inserted it.
    async fn insert_remote(
        &self,
        node_id: Uuid,
        address: SocketAddr,
        token: Token,
        name: Option<String>,
    ) -> Option<Arc<RemoteNode>> {
        if node_id == self.node_id() {
            return None;
        }

        let inserted = {
            let mut nodes = self.nodes.write();

            match nodes.get(&node_id) {
                Some(_) => None,
                None => {
                    let remote = Arc::new(RemoteNode::new(
                        address,
                        token,
                        node_id,
                        name,
                        self.local.clone(),
                    ));

                    nodes.insert(node_id, Node::Remote(remote.clone()));

                    Some(remote)
                }
            }
        };

        let remote = inserted?;

        info!(
            "Added node (id = {}) (addr = {}) (token = {})",
            node_id, address, token
        );

        if let Err(e) = remote.connect().await {
            warn!("Unable to connect to peer (id = {}): {}", node_id, e);
        }

        self.refresh_ring();

        Some(remote)
    }

    /// Finds the other nodes in the cluster.
    ///
    /// Every queried peer is asked for its peer list; unknown entries are
    /// registered and queried in turn, until no new peers surface. When
    /// `only` is given, the sweep starts from those nodes instead of
    /// everything known.
    pub async fn discover_peers(&self, only: Option<Vec<Uuid>>) {
        let mut pending: Vec<Arc<RemoteNode>> = match only {
            Some(ids) => ids
                .into_iter()
                .filter_map(|id| self.get_node(id))
                .filter_map(|n| n.as_remote().cloned())
                .collect(),
            None => self.get_peers(),
        };

        let mut queried = HashSet::new();

        while let Some(peer) = pending.pop() {
            if !queried.insert(peer.node_id()) {
                continue;
            }

            let response = match peer.send(Body::DiscoverPeersRequest).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Peer discovery failed (id = {}): {}", peer.node_id(), e);
                    continue;
                }
            };

            let peers = match response.body {
                Body::DiscoverPeersResponse { peers } => peers,
                _ => {
                    warn!(
                        "Unexpected discovery reply (id = {}) (kind = {})",
                        peer.node_id(),
                        response.body.kind()
                    );
                    continue;
                }
            };

            for info in peers {
                if info.node_id == self.node_id() || self.contains(info.node_id) {
                    continue;
                }

                if let Some(remote) = self
                    .insert_remote(info.node_id, info.address, info.token, info.name)
                    .await
                {
                    pending.push(remote);
                }
            }
        }
    }

    /// Rebuilds the ring snapshot from the node map.
    ///
    /// A lone initializing node has nobody to stream from and goes
    /// straight to normal; an initializing node with peers keeps a
    /// snapshot of the pre-join ring.
    pub(crate) fn refresh_ring(&self) {
        let nodes: Vec<Node> = self.nodes.read().values().cloned().collect();

        *self.ring.write() = Arc::new(Ring::new(nodes.clone(), self.replication_factor));

        if self.is_initializing() {
            if nodes.len() == 1 {
                *self.status.write() = ClusterStatus::Normal;
                *self.previous_ring.write() = None;

                info!("No peers to stream from, going normal");
                return;
            }

            let remotes: Vec<Node> = nodes.into_iter().filter(|n| !n.is_local()).collect();

            *self.previous_ring.write() =
                Some(Arc::new(Ring::new(remotes, self.replication_factor)));
        } else {
            *self.previous_ring.write() = None;
        }
    }

    /// The token range this node owns or replicates.
    pub fn owned_range(&self) -> Option<(Token, Token)> {
        self.ring()
            .owned_range(self.node_id(), self.partitioner.max_token())
    }

    /// Streams this node's share of the data from the node to its left,
    /// which owned the range before this node joined.
    async fn join_cluster(&self) -> TesseraResult<()> {
        let ring = self.ring();

        let (left, _) = match ring.neighbors(self.node_id()) {
            Some(neighbors) => neighbors,
            None => return Ok(()),
        };

        info!("Joining cluster (streaming from = {})", left.node_id());

        self.request_streamed_data(&left).await
    }

    /// Moves a node to a new ring position and streams from whichever
    /// neighbours changed.
    ///
    /// The stream source is told about the move and its acknowledgement
    /// awaited before the stream request goes out; a source streaming
    /// under its old ring view would send the wrong keys.
    pub async fn change_token(
        &self,
        token: Token,
        node_id: Option<Uuid>,
        alert_cluster: bool,
    ) -> TesseraResult<()> {
        let target_id = node_id.unwrap_or_else(|| self.node_id());

        let target = self
            .get_node(target_id)
            .ok_or(TesseraError::UnknownNode(target_id))?;

        if target.token() == token {
            return Ok(());
        }

        let old_ids = self.ring().node_ids();
        target.set_token(token);
        self.refresh_ring();
        let new_ids = self.ring().node_ids();

        info!("Token changed (node = {}) (token = {})", target_id, token);

        if alert_cluster {
            for peer in self.get_peers() {
                if let Err(e) = peer
                    .send(Body::ChangedTokenRequest {
                        node: target_id,
                        token,
                    })
                    .await
                {
                    warn!(
                        "Unable to announce token change (to = {}): {}",
                        peer.node_id(),
                        e
                    );
                }
            }
        }

        let announce = Body::ChangedTokenRequest {
            node: target_id,
            token,
        };

        for offset in &[-1isize, 1] {
            if let Some(source) = self.changed_neighbor(&old_ids, &new_ids, *offset) {
                self.stream_after_ack(source, announce.clone()).await?;
            }
        }

        Ok(())
    }

    /// Drops a node from the ring.
    ///
    /// Only the right neighbour may need to stream afterwards: the left
    /// side was already replicating the removed node's range.
    pub async fn remove_node(
        &self,
        node_id: Option<Uuid>,
        alert_cluster: bool,
    ) -> TesseraResult<()> {
        let target_id = node_id.unwrap_or_else(|| self.node_id());

        if target_id == self.node_id() {
            if alert_cluster {
                for peer in self.get_peers() {
                    if let Err(e) = peer.send(Body::RemoveNodeRequest { node: target_id }).await {
                        warn!(
                            "Unable to announce removal (to = {}): {}",
                            peer.node_id(),
                            e
                        );
                    }
                }
            }

            return Ok(());
        }

        let old_ids = self.ring().node_ids();

        let target = match self.nodes.write().remove(&target_id) {
            Some(node) => node,
            None => return Ok(()),
        };

        self.refresh_ring();
        let new_ids = self.ring().node_ids();

        if let Some(remote) = target.as_remote() {
            remote.stop();
        }

        info!("Removed node (id = {})", target_id);

        if alert_cluster {
            for peer in self.get_peers() {
                if let Err(e) = peer.send(Body::RemoveNodeRequest { node: target_id }).await {
                    warn!(
                        "Unable to announce removal (to = {}): {}",
                        peer.node_id(),
                        e
                    );
                }
            }
        }

        if let Some(source) = self.changed_neighbor(&old_ids, &new_ids, 1) {
            self.stream_after_ack(source, Body::RemoveNodeRequest { node: target_id })
                .await?;
        }

        Ok(())
    }

    /// The node now sitting at `offset` from this node, if it differs
    /// from whoever was there before the ring changed.
    fn changed_neighbor(&self, old_ids: &[Uuid], new_ids: &[Uuid], offset: isize) -> Option<Uuid> {
        let old_idx = old_ids.iter().position(|id| *id == self.node_id())?;
        let new_idx = new_ids.iter().position(|id| *id == self.node_id())?;

        let old_neighbor = ring_offset(old_ids, old_idx, offset);
        let new_neighbor = ring_offset(new_ids, new_idx, offset);

        if old_neighbor == new_neighbor {
            None
        } else {
            Some(new_neighbor)
        }
    }

    /// Waits for the source to acknowledge the topology change, then asks
    /// it to stream.
    async fn stream_after_ack(&self, source_id: Uuid, announce: Body) -> TesseraResult<()> {
        let node = match self.get_node(source_id) {
            Some(node) => node,
            None => return Ok(()),
        };

        let remote = match node.as_remote() {
            Some(remote) => remote.clone(),
            None => return Ok(()),
        };

        let response = remote.send(announce).await?;

        match response.body {
            Body::ChangedTokenResponse | Body::RemoveNodeResponse => {}
            _ => return Err(TesseraError::UnexpectedMessage(response.body.kind())),
        }

        self.request_streamed_data(&node).await
    }

    // ------------- streaming -------------

    /// Receiver side: registers the source and asks it to start
    /// streaming. The response is an early ack; data arrives as separate
    /// stream-data requests.
    async fn request_streamed_data(&self, node: &Node) -> TesseraResult<()> {
        if node.node_id() == self.node_id() {
            return Ok(());
        }

        let remote = match node.as_remote() {
            Some(remote) => remote.clone(),
            None => return Ok(()),
        };

        self.streaming_nodes.lock().insert(remote.node_id());
        *self.status.write() = ClusterStatus::Streaming;

        info!("Requesting stream (from = {})", remote.node_id());

        let response = remote.send(Body::StreamRequest).await?;

        match response.body {
            Body::StreamResponse => Ok(()),
            _ => Err(TesseraError::UnexpectedMessage(response.body.kind())),
        }
    }

    /// Source side: walks the local keys and sends the requesting node
    /// every record it replicates under the current ring, then signals
    /// completion. Each batch is acknowledged before the next goes out.
    pub async fn stream_to_node(&self, node_id: Uuid) -> TesseraResult<()> {
        let node = self
            .get_node(node_id)
            .ok_or(TesseraError::UnknownNode(node_id))?;

        let remote = node
            .as_remote()
            .cloned()
            .ok_or_else(|| TesseraError::Unsupported("cannot stream to self".to_string()))?;

        let keys = self.store().all_keys().await;
        let mut sent = 0usize;

        for key in keys {
            let replicated = self
                .owners_of_key(&key)
                .iter()
                .any(|n| n.node_id() == node_id);

            if !replicated {
                continue;
            }

            let value = match self.store().get_raw_value(&key).await {
                Some(value) => value,
                None => continue,
            };

            let response = remote
                .send(Body::StreamDataRequest {
                    entries: vec![(key, value)],
                })
                .await?;

            if !matches!(response.body, Body::StreamDataResponse) {
                return Err(TesseraError::UnexpectedMessage(response.body.kind()));
            }

            sent += 1;
        }

        info!("Streamed keys (to = {}) (keys = {})", node_id, sent);

        let response = remote.send(Body::StreamCompleteRequest).await?;

        match response.body {
            Body::StreamCompleteResponse => Ok(()),
            _ => Err(TesseraError::UnexpectedMessage(response.body.kind())),
        }
    }

    /// Receiver side: merges one batch of streamed records.
    pub async fn receive_streamed_values(&self, entries: Vec<(String, Value)>) {
        for (key, value) in entries {
            self.store().set_and_reconcile_raw_value(&key, value).await;
        }
    }

    /// Receiver side: the source finished; once the last stream drains
    /// the node goes back to normal.
    pub fn end_streaming(&self, node_id: Uuid) {
        let drained = {
            let mut streaming = self.streaming_nodes.lock();
            streaming.remove(&node_id);
            streaming.is_empty()
        };

        if drained {
            *self.status.write() = ClusterStatus::Normal;
            info!("All streams drained, back to normal");
        }
    }

    // ------------- key routing -------------

    pub fn owners_of_token(&self, token: Token) -> Vec<Node> {
        self.ring().owners_of(token)
    }

    /// The owner and replicas for a key; with a replication factor of 0
    /// every node holds every key.
    pub fn owners_of_key(&self, key: &str) -> Vec<Node> {
        if self.replication_factor == 0 {
            return self.nodes.read().values().cloned().collect();
        }

        self.owners_of_token(self.partitioner.token_of(key))
    }

    pub fn replicates_key(&self, key: &str) -> bool {
        self.owners_of_key(key)
            .iter()
            .any(|n| n.node_id() == self.node_id())
    }
}

fn ring_offset(ids: &[Uuid], idx: usize, offset: isize) -> Uuid {
    let n = ids.len() as isize;
    let pos = (idx as isize + offset % n + n) % n;

    ids[pos as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::Md5Partitioner;
    use crate::store::MemoryStore;

    fn cluster(status: ClusterStatus) -> Cluster {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let local = Arc::new(LocalNode::new(
            store,
            "127.0.0.1:4379".parse().unwrap(),
            None,
            None,
            0,
        ));

        Cluster::new(local, Arc::new(Md5Partitioner), Vec::new(), 3, status)
    }

    #[test]
    fn lone_initializing_node_goes_normal() {
        let cluster = cluster(ClusterStatus::Initializing);

        cluster.refresh_ring();

        assert!(cluster.is_normal());
        assert!(cluster.previous_ring().is_none());
    }

    #[test]
    fn normal_nodes_keep_no_previous_ring() {
        let cluster = cluster(ClusterStatus::Normal);

        cluster.refresh_ring();

        assert!(cluster.is_normal());
        assert!(cluster.previous_ring().is_none());
    }

    #[test]
    fn stream_completion_restores_normal_status() {
        let cluster = cluster(ClusterStatus::Normal);
        let source_a = Uuid::new_v4();
        let source_b = Uuid::new_v4();

        cluster.streaming_nodes.lock().insert(source_a);
        cluster.streaming_nodes.lock().insert(source_b);
        *cluster.status.write() = ClusterStatus::Streaming;

        cluster.end_streaming(source_a);
        assert!(cluster.is_streaming());

        cluster.end_streaming(source_b);
        assert!(cluster.is_normal());
    }

    #[test]
    fn ring_offsets_wrap_in_both_directions() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        assert_eq!(ring_offset(&ids, 0, -1), ids[3]);
        assert_eq!(ring_offset(&ids, 3, 1), ids[0]);
        assert_eq!(ring_offset(&ids, 2, 1), ids[3]);
    }
}
