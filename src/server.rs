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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use uuid::Uuid;

use crate::cluster::{Cluster, ClusterStatus};
use crate::config::Config;
use crate::error::TesseraResult;
use crate::node::LocalNode;
use crate::partitioner::{Md5Partitioner, Partitioner, Token};
use crate::peer_server::PeerServer;
use crate::store::{MemoryStore, SharedStore};

/// Everything needed to bring one node up.
pub struct ServerOptions {
    /// Address the peer server binds; port 0 picks one and advertises it.
    pub peer_address: SocketAddr,

    pub node_id: Option<Uuid>,
    pub name: Option<String>,

    /// Ring position; a random token is drawn when absent.
    pub token: Option<Token>,

    /// Peers tried in order when this node knows nobody yet.
    pub seeds: Vec<SocketAddr>,

    pub replication_factor: usize,

    /// `Initializing` streams this node's share of the data from the
    /// cluster before it serves; `Normal` starts serving immediately.
    pub status: ClusterStatus,

    pub partitioner: Arc<dyn Partitioner>,

    /// Backing store; in-memory when absent.
    pub store: Option<SharedStore>,
}

impl ServerOptions {
    pub fn new(peer_address: SocketAddr) -> ServerOptions {
        ServerOptions {
            peer_address,
            node_id: None,
            name: None,
            token: None,
            seeds: Vec::new(),
            replication_factor: 3,
            status: ClusterStatus::Initializing,
            partitioner: Arc::new(Md5Partitioner),
            store: None,
        }
    }

    pub fn from_config(config: Config) -> TesseraResult<ServerOptions> {
        let mut options = ServerOptions::new(config.node.bind_address.parse()?);

        options.name = config.node.name;

        if let Some(token) = config.node.token {
            options.token = Some(token.parse::<u128>()?);
        }

        for seed in config.cluster.seeds {
            options.seeds.push(seed.parse()?);
        }

        options.replication_factor = config.cluster.replication_factor;

        if !config.cluster.bootstrap {
            options.status = ClusterStatus::Normal;
        }

        Ok(options)
    }
}

/// One tessera node: the store, the local identity, the cluster view,
/// and the peer server, wired together under a single owner.
pub struct Server {
    local: Arc<LocalNode>,
    cluster: Arc<Cluster>,
    peer_server: PeerServer,
}

impl Server {
    /// Binds the peer listener up front so the advertised address is
    /// final before anything else sees it.
    pub async fn new(options: ServerOptions) -> TesseraResult<Server> {
        let store: SharedStore = match options.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };

        let listener = TcpListener::bind(options.peer_address).await?;
        let advertised = listener.local_addr()?;

        let token = match options.token {
            Some(token) => token,
            None => options.partitioner.random_token(),
        };

        let local = Arc::new(LocalNode::new(
            store,
            advertised,
            options.node_id,
            options.name,
            token,
        ));

        let cluster = Arc::new(Cluster::new(
            local.clone(),
            options.partitioner,
            options.seeds,
            options.replication_factor,
            options.status,
        ));

        let peer_server = PeerServer::new(listener, cluster.clone())?;

        Ok(Server {
            local,
            cluster,
            peer_server,
        })
    }

    pub fn node_id(&self) -> Uuid {
        self.local.node_id()
    }

    pub fn token(&self) -> Token {
        self.local.token()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_server.local_addr()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn store(&self) -> SharedStore {
        self.local.store().clone()
    }

    pub fn replicates_key(&self, key: &str) -> bool {
        self.cluster.replicates_key(key)
    }

    /// Brings the peer server up before joining the cluster, so peers
    /// can call back during the handshake.
    pub async fn start(&self) -> TesseraResult<()> {
        self.peer_server.start()?;
        self.cluster.start().await
    }

    pub fn stop(&self) {
        self.peer_server.stop();
        self.cluster.stop();
    }
}
