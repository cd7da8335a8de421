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

use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(rename(deserialize = "Node"))]
    pub node: Node,

    #[serde(rename(deserialize = "Cluster"))]
    pub cluster: Cluster,
}

#[derive(Deserialize, Debug)]
pub struct Node {
    /// Address the peer server binds and advertises.
    pub bind_address: String,

    /// Optional human-readable node name.
    pub name: Option<String>,

    /// Ring position as a decimal integer.
    /// A random token is drawn when absent.
    pub token: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Cluster {
    /// Peers tried in order when this node knows nobody yet.
    pub seeds: Vec<String>,

    /// Nodes that must hold any given key.
    /// 0 mirrors all data to all nodes.
    pub replication_factor: usize,

    /// Whether this node should stream its share of existing data from
    /// the cluster before serving.
    pub bootstrap: bool,
}
