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

use common::{keys_in_range, populated_ring};

use tessera::cluster::ClusterStatus;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removing_a_node_redistributes_its_range() {
    let (cluster, data) = populated_ring().await;

    let removed = cluster.servers[1].node_id();

    // node 1 announces its own departure
    cluster.servers[1]
        .cluster()
        .remove_node(None, true)
        .await
        .unwrap();

    // the departing node keeps its own view; everyone else settles
    cluster.wait_for_status(ClusterStatus::Normal, &[1]).await;

    for (i, server) in cluster.servers.iter().enumerate() {
        if i == 1 {
            continue;
        }

        assert!(
            !server.cluster().contains(removed),
            "node {} still knows the removed node",
            i
        );
        assert_eq!(server.cluster().len(), 9);
    }

    // node 0 owns the removed node's 1000-1999 now and must have
    // streamed it from its new right neighbour
    let n0_keys = cluster.store_keys(0).await;
    for key in keys_in_range(&data, 1000, 2000) {
        assert!(n0_keys.contains(&key), "node 0 is missing key {}", key);
    }

    cluster.stop_all();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removing_an_unknown_node_is_ignored() {
    let (cluster, _) = populated_ring().await;

    cluster.servers[0]
        .cluster()
        .remove_node(Some(uuid::Uuid::new_v4()), true)
        .await
        .unwrap();

    assert_eq!(cluster.servers[0].cluster().len(), 10);
    assert_eq!(cluster.servers[0].cluster().status(), ClusterStatus::Normal);

    cluster.stop_all();
}
