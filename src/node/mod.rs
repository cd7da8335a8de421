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

use uuid::Uuid;

use crate::error::TesseraResult;
use crate::partitioner::Token;
use crate::protocol::PeerInfo;
use crate::store::{Mutation, RetrievalKind, Value};

mod local;
mod remote;

pub use local::LocalNode;
pub use remote::{PeerStatus, RemoteNode, SEND_RETRIES};

/// A member of the cluster: either this process, which executes against
/// its own store, or a peer reached over the wire.
#[derive(Clone)]
pub enum Node {
    Local(Arc<LocalNode>),
    Remote(Arc<RemoteNode>),
}

impl Node {
    pub fn node_id(&self) -> Uuid {
        match self {
            Node::Local(node) => node.node_id(),
            Node::Remote(node) => node.node_id(),
        }
    }

    pub fn token(&self) -> Token {
        match self {
            Node::Local(node) => node.token(),
            Node::Remote(node) => node.token(),
        }
    }

    pub fn set_token(&self, token: Token) {
        match self {
            Node::Local(node) => node.set_token(token),
            Node::Remote(node) => node.set_token(token),
        }
    }

    pub fn address(&self) -> SocketAddr {
        match self {
            Node::Local(node) => node.address(),
            Node::Remote(node) => node.address(),
        }
    }

    pub fn name(&self) -> Option<String> {
        match self {
            Node::Local(node) => node.name(),
            Node::Remote(node) => node.name(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Node::Local(_))
    }

    pub fn as_remote(&self) -> Option<&Arc<RemoteNode>> {
        match self {
            Node::Remote(node) => Some(node),
            Node::Local(_) => None,
        }
    }

    /// Coordinates advertised to other nodes during discovery.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            address: self.address(),
            node_id: self.node_id(),
            token: self.token(),
            name: self.name(),
        }
    }

    pub async fn execute_retrieval(
        &self,
        instruction: RetrievalKind,
        key: &str,
    ) -> TesseraResult<Option<Value>> {
        match self {
            Node::Local(node) => node.execute_retrieval(instruction, key).await,
            Node::Remote(node) => node.execute_retrieval(instruction, key).await,
        }
    }

    pub async fn execute_mutation(&self, mutation: &Mutation) -> TesseraResult<bool> {
        match self {
            Node::Local(node) => node.execute_mutation(mutation).await,
            Node::Remote(node) => node.execute_mutation(mutation).await,
        }
    }
}
