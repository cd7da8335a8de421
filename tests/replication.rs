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

mod common;

use common::TestCluster;

use bytes::Bytes;

use tessera::cluster::ConsistencyLevel;
use tessera::partitioner::Token;
use tessera::store::{MutationKind, RetrievalKind};

async fn five_node_ring() -> TestCluster {
    let mut cluster = TestCluster::new();

    let tokens: Vec<Token> = (0..5).map(|i| i as u128 * 2000).collect();
    cluster.create_nodes(5, Some(tokens)).await;
    cluster.start_all().await;

    cluster
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_all_is_readable_from_every_node() {
    let cluster = five_node_ring().await;

    cluster.servers[0]
        .cluster()
        .execute_mutation(
            MutationKind::Set,
            "2500",
            Some(Bytes::from_static(b"everywhere")),
            None,
            Some(ConsistencyLevel::All),
            true,
        )
        .await
        .unwrap();

    for server in &cluster.servers {
        let value = server
            .cluster()
            .execute_retrieval(
                RetrievalKind::Get,
                "2500",
                Some(ConsistencyLevel::All),
                false,
            )
            .await
            .unwrap();

        assert_eq!(value, Some(Bytes::from_static(b"everywhere")));
    }

    cluster.stop_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_keys_read_as_nothing() {
    let cluster = five_node_ring().await;

    let value = cluster.servers[4]
        .cluster()
        .execute_retrieval(
            RetrievalKind::Get,
            "7777",
            Some(ConsistencyLevel::All),
            false,
        )
        .await
        .unwrap();

    assert_eq!(value, None);

    cluster.stop_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_repair_converges_divergent_replicas() {
    let cluster = five_node_ring().await;

    // "2500" lives on the nodes at 2000, 4000 and 6000
    cluster.servers[0]
        .cluster()
        .execute_mutation(
            MutationKind::Set,
            "2500",
            Some(Bytes::from_static(b"v1")),
            Some(100),
            Some(ConsistencyLevel::All),
            true,
        )
        .await
        .unwrap();

    // one replica quietly got a newer write
    cluster.servers[2]
        .store()
        .set("2500", Bytes::from_static(b"v2"), 200)
        .await;

    // a fully synchronous read resolves to the newest value and repairs
    // the stale replicas before returning
    let value = cluster.servers[0]
        .cluster()
        .execute_retrieval(RetrievalKind::Get, "2500", Some(ConsistencyLevel::All), true)
        .await
        .unwrap();

    assert_eq!(value, Some(Bytes::from_static(b"v2")));

    for idx in [1, 2, 3] {
        let stored = cluster.servers[idx].store().get("2500").await.unwrap();

        assert_eq!(stored.data, Some(Bytes::from_static(b"v2")));
        assert_eq!(stored.timestamp, 200);
    }

    cluster.stop_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_writes_lose_everywhere() {
    let cluster = five_node_ring().await;

    let applied = cluster.servers[0]
        .cluster()
        .execute_mutation(
            MutationKind::Set,
            "2500",
            Some(Bytes::from_static(b"new")),
            Some(200),
            Some(ConsistencyLevel::All),
            true,
        )
        .await
        .unwrap();

    assert!(applied);

    let applied = cluster.servers[1]
        .cluster()
        .execute_mutation(
            MutationKind::Set,
            "2500",
            Some(Bytes::from_static(b"old")),
            Some(100),
            Some(ConsistencyLevel::All),
            true,
        )
        .await
        .unwrap();

    assert!(!applied);

    let value = cluster.servers[3]
        .cluster()
        .execute_retrieval(
            RetrievalKind::Get,
            "2500",
            Some(ConsistencyLevel::All),
            false,
        )
        .await
        .unwrap();

    assert_eq!(value, Some(Bytes::from_static(b"new")));

    cluster.stop_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deletes_tombstone_every_replica() {
    let cluster = five_node_ring().await;

    cluster.servers[0]
        .cluster()
        .execute_mutation(
            MutationKind::Set,
            "2500",
            Some(Bytes::from_static(b"doomed")),
            Some(100),
            Some(ConsistencyLevel::All),
            true,
        )
        .await
        .unwrap();

    cluster.servers[0]
        .cluster()
        .execute_mutation(
            MutationKind::Delete,
            "2500",
            None,
            Some(200),
            Some(ConsistencyLevel::All),
            true,
        )
        .await
        .unwrap();

    // reads see nothing, stores keep the tombstone
    let value = cluster.servers[2]
        .cluster()
        .execute_retrieval(
            RetrievalKind::Get,
            "2500",
            Some(ConsistencyLevel::All),
            false,
        )
        .await
        .unwrap();

    assert_eq!(value, None);

    for idx in [1, 2, 3] {
        let stored = cluster.servers[idx].store().get("2500").await.unwrap();

        assert!(stored.is_tombstone());
        assert_eq!(stored.timestamp, 200);
    }

    cluster.stop_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_writes_survive_quorum_reads() {
    let cluster = five_node_ring().await;

    cluster.servers[3]
        .cluster()
        .execute_mutation(
            MutationKind::Set,
            "4500",
            Some(Bytes::from_static(b"quorum")),
            None,
            Some(ConsistencyLevel::Quorum),
            true,
        )
        .await
        .unwrap();

    let value = cluster.servers[1]
        .cluster()
        .execute_retrieval(
            RetrievalKind::Get,
            "4500",
            Some(ConsistencyLevel::Quorum),
            true,
        )
        .await
        .unwrap();

    assert_eq!(value, Some(Bytes::from_static(b"quorum")));

    cluster.stop_all();
}
