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

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;

use tokio::time::{sleep, Duration, Instant};

use tessera::cluster::ClusterStatus;
use tessera::partitioner::{Md5Partitioner, Partitioner, Token};
use tessera::server::{Server, ServerOptions};
use tessera::store::MutationKind;

/// Maps stringified integers straight onto the ring, so tests can place
/// keys deterministically. Keys must parse as integers.
pub struct LiteralPartitioner;

impl Partitioner for LiteralPartitioner {
    fn max_token(&self) -> Token {
        10_000
    }

    fn token_of(&self, key: &str) -> Token {
        key.parse().unwrap_or(0)
    }
}

/// A handful of real nodes on loopback TCP, plus the bookkeeping the
/// scenarios need.
pub struct TestCluster {
    pub servers: Vec<Server>,
}

impl TestCluster {
    pub fn new() -> TestCluster {
        TestCluster {
            servers: Vec::new(),
        }
    }

    /// Creates (but does not start) a node on an ephemeral port, seeded
    /// with the first node's address.
    pub async fn create_node(
        &mut self,
        token: Option<Token>,
        status: ClusterStatus,
        partitioner: Arc<dyn Partitioner>,
    ) -> usize {
        let mut options = ServerOptions::new("127.0.0.1:0".parse().unwrap());

        options.token = token;
        options.status = status;
        options.partitioner = partitioner;
        options.name = Some(format!("N{}", self.servers.len()));

        if let Some(first) = self.servers.first() {
            options.seeds.push(first.peer_addr());
        }

        let server = Server::new(options).await.unwrap();
        self.servers.push(server);

        self.servers.len() - 1
    }

    /// A ring of already-normal nodes; literal tokens when given, random
    /// MD5 tokens otherwise.
    pub async fn create_nodes(&mut self, count: usize, tokens: Option<Vec<Token>>) {
        if let Some(tokens) = &tokens {
            assert_eq!(tokens.len(), count);
        }

        for i in 0..count {
            let token = tokens.as_ref().map(|t| t[i]);

            let partitioner: Arc<dyn Partitioner> = if tokens.is_some() {
                Arc::new(LiteralPartitioner)
            } else {
                Arc::new(Md5Partitioner)
            };

            self.create_node(token, ClusterStatus::Normal, partitioner)
                .await;
        }
    }

    /// Starts every node and waits until they have all met each other.
    pub async fn start_all(&self) {
        for server in &self.servers {
            server.start().await.unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);

        loop {
            let all_known = self.servers.iter().all(|server| {
                self.servers
                    .iter()
                    .all(|peer| server.cluster().contains(peer.node_id()))
            });

            if all_known {
                break;
            }

            if Instant::now() > deadline {
                panic!("peers never discovered each other");
            }

            sleep(Duration::from_millis(25)).await;
        }
    }

    /// Writes `key = i * 20, value = i` for `i` in `0..count`, round-robin
    /// through the nodes, waiting out reconciliation on every write.
    pub async fn populate(&self, count: usize) -> HashMap<String, String> {
        let mut data = HashMap::new();

        for i in 0..count {
            let server = &self.servers[i % self.servers.len()];
            let key = (i * 20).to_string();
            let value = i.to_string();

            server
                .cluster()
                .execute_mutation(
                    MutationKind::Set,
                    &key,
                    Some(Bytes::from(value.clone())),
                    None,
                    None,
                    true,
                )
                .await
                .unwrap();

            data.insert(key, value);
        }

        data
    }

    /// Integer keys currently held by a node, tombstones included.
    pub async fn store_keys(&self, idx: usize) -> HashSet<u32> {
        self.servers[idx]
            .store()
            .all_keys()
            .await
            .iter()
            .map(|k| k.parse().unwrap())
            .collect()
    }

    /// Waits until every node (minus `skip`) reports the given status.
    pub async fn wait_for_status(&self, status: ClusterStatus, skip: &[usize]) {
        let deadline = Instant::now() + Duration::from_secs(10);

        loop {
            let settled = self
                .servers
                .iter()
                .enumerate()
                .filter(|(i, _)| !skip.contains(i))
                .all(|(_, server)| server.cluster().status() == status);

            if settled {
                return;
            }

            if Instant::now() > deadline {
                let statuses: Vec<ClusterStatus> = self
                    .servers
                    .iter()
                    .map(|server| server.cluster().status())
                    .collect();

                panic!("cluster never settled, statuses: {:?}", statuses);
            }

            sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn stop_all(&self) {
        for server in &self.servers {
            server.stop();
        }
    }
}

/// The 10-node fixture the topology-change scenarios start from: tokens
/// 0, 1000, .. 9000 and 500 keys spread over the ring.
pub async fn populated_ring() -> (TestCluster, HashMap<String, String>) {
    let mut cluster = TestCluster::new();

    let tokens: Vec<Token> = (0..10).map(|i| i as u128 * 1000).collect();
    cluster.create_nodes(10, Some(tokens)).await;
    cluster.start_all().await;

    let data = cluster.populate(500).await;

    (cluster, data)
}

/// The subset of `data` whose integer keys fall in `[from, to)`.
pub fn keys_in_range(data: &HashMap<String, String>, from: u32, to: u32) -> HashSet<u32> {
    data.keys()
        .map(|k| k.parse().unwrap())
        .filter(|k| (from..to).contains(k))
        .collect()
}
