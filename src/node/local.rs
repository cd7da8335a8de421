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

use parking_lot::RwLock;

use uuid::Uuid;

use crate::error::TesseraResult;
use crate::partitioner::Token;
use crate::store::{Mutation, RetrievalKind, SharedStore, Value};

/// The node this process runs: identity plus the store it executes
/// against directly.
pub struct LocalNode {
    node_id: Uuid,
    name: Option<String>,
    address: SocketAddr,
    token: RwLock<Token>,
    store: SharedStore,
}

impl LocalNode {
    pub fn new(
        store: SharedStore,
        address: SocketAddr,
        node_id: Option<Uuid>,
        name: Option<String>,
        token: Token,
    ) -> LocalNode {
        LocalNode {
            node_id: node_id.unwrap_or_else(Uuid::new_v4),
            name,
            address,
            token: RwLock::new(token),
            store,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn name(&self) -> Option<String> {
        self.name.clone()
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn token(&self) -> Token {
        *self.token.read()
    }

    pub fn set_token(&self, token: Token) {
        *self.token.write() = token;
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn execute_retrieval(
        &self,
        instruction: RetrievalKind,
        key: &str,
    ) -> TesseraResult<Option<Value>> {
        match instruction {
            RetrievalKind::Get => Ok(self.store.get(key).await),
        }
    }

    pub async fn execute_mutation(&self, mutation: &Mutation) -> TesseraResult<bool> {
        self.store.apply(mutation).await
    }
}
