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

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{TesseraError, TesseraResult};
use crate::node::LocalNode;
use crate::partitioner::Token;
use crate::protocol::{Body, Message, PeerInfo};
use crate::store::{now_micros, Mutation, RetrievalKind, Timestamp, Value};

/// Send attempts before a peer is declared down.
pub const SEND_RETRIES: usize = 3;

/// Lifecycle of a peer as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Known but never spoken to.
    Initialized,
    Up,
    /// Exhausted its send retries; revived by the next successful send.
    Down,
    /// Shut down locally, pool drained.
    Closed,
    /// The peer rejected our handshake; not retried.
    Refused,
}

/// Client side of a peer node: an unbounded pool of framed connections
/// to its server, plus status and liveness bookkeeping.
///
/// Connections are created on demand and handshaken before first use.
/// They return to the pool only while the peer is up; a stopping or
/// down peer lets leased connections drop as their requests finish.
pub struct RemoteNode {
    node_id: Uuid,
    name: Option<String>,
    address: SocketAddr,
    token: RwLock<Token>,

    /// Identity record sent in every handshake.
    local: Arc<LocalNode>,

    pool: Mutex<Vec<Connection>>,
    status: Mutex<PeerStatus>,

    /// Undeliverable messages kept for later replay (hinted handoff,
    /// not replayed yet).
    saved: Mutex<VecDeque<Message>>,

    last_ping: Mutex<Option<Timestamp>>,
    ping_time: Mutex<Option<Duration>>,
}

impl RemoteNode {
    pub fn new(
        address: SocketAddr,
        token: Token,
        node_id: Uuid,
        name: Option<String>,
        local: Arc<LocalNode>,
    ) -> RemoteNode {
        RemoteNode {
            node_id,
            name,
            address,
            token: RwLock::new(token),
            local,
            pool: Mutex::new(Vec::new()),
            status: Mutex::new(PeerStatus::Initialized),
            saved: Mutex::new(VecDeque::new()),
            last_ping: Mutex::new(None),
            ping_time: Mutex::new(None),
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

    pub fn status(&self) -> PeerStatus {
        *self.status.lock()
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            address: self.address,
            node_id: self.node_id,
            token: self.token(),
            name: self.name.clone(),
        }
    }

    /// Messages queued while the peer was unreachable.
    pub fn saved_messages(&self) -> usize {
        self.saved.lock().len()
    }

    pub fn last_ping(&self) -> Option<Timestamp> {
        *self.last_ping.lock()
    }

    pub fn ping_time(&self) -> Option<Duration> {
        *self.ping_time.lock()
    }

    /// Dials the peer and performs the mandatory handshake.
    async fn dial(&self) -> TesseraResult<Connection> {
        let mut conn = Connection::connect(self.address).await?;

        let request = Message::new(
            self.local.node_id(),
            Body::ConnectionRequest {
                address: self.local.address(),
                token: self.local.token(),
                name: self.local.name(),
            },
        );

        let response = conn.request(request).await?;
        let kind = response.kind();

        match response.body {
            Body::ConnectionAccepted { .. } => Ok(conn),
            Body::ConnectionRefused { reason } => {
                *self.status.lock() = PeerStatus::Refused;

                warn!(
                    "Peer refused connection (id = {}) (reason = {})",
                    self.node_id, reason
                );

                Err(TesseraError::ConnectionRefused(reason))
            }
            _ => Err(TesseraError::UnexpectedMessage(kind)),
        }
    }

    fn checkout_pooled(&self) -> Option<Connection> {
        self.pool.lock().pop()
    }

    async fn checkout(&self) -> TesseraResult<Connection> {
        match self.checkout_pooled() {
            Some(conn) => Ok(conn),
            None => self.dial().await,
        }
    }

    fn checkin(&self, conn: Connection) {
        if *self.status.lock() == PeerStatus::Up {
            self.pool.lock().push(conn);
        }
    }

    /// Establishes and pools a connection, marking the peer up.
    pub async fn connect(&self) -> TesseraResult<()> {
        let conn = self.checkout().await?;

        *self.status.lock() = PeerStatus::Up;
        self.checkin(conn);

        Ok(())
    }

    /// Adopts an already-handshaken connection (seed bootstrap).
    pub fn add_conn(&self, conn: Connection) {
        *self.status.lock() = PeerStatus::Up;
        self.pool.lock().push(conn);
    }

    /// Sends a message and returns the typed reply.
    ///
    /// Each attempt leases a pooled connection and performs one
    /// request/response exchange. A closed connection is replaced and the
    /// send retried; once `retries` attempts are spent the peer is marked
    /// down and, if `save` is set, the message is queued for later.
    pub async fn send_message(
        &self,
        body: Body,
        save: bool,
        retries: usize,
    ) -> TesseraResult<Message> {
        let message = Message::new(self.local.node_id(), body);

        for attempt in 1..=retries {
            let mut conn = match self.checkout().await {
                Ok(conn) => conn,
                Err(e @ TesseraError::ConnectionRefused(_)) => return Err(e),
                Err(e) => {
                    debug!(
                        "Dial failed (peer = {}) (attempt = {}): {}",
                        self.node_id, attempt, e
                    );
                    continue;
                }
            };

            match conn.request(message.clone()).await {
                Ok(response) => {
                    *self.status.lock() = PeerStatus::Up;
                    self.checkin(conn);

                    return match response.body {
                        Body::Error { reason } => Err(TesseraError::PeerError(reason)),
                        _ => Ok(response),
                    };
                }
                Err(e) => {
                    // the connection is dropped here; a fresh one is
                    // dialed on the next attempt
                    debug!(
                        "Request failed (peer = {}) (attempt = {}): {}",
                        self.node_id, attempt, e
                    );
                }
            }
        }

        *self.status.lock() = PeerStatus::Down;

        if save {
            self.saved.lock().push_back(message);
            warn!("Peer down, message saved for replay (id = {})", self.node_id);
        } else {
            warn!("Peer down (id = {})", self.node_id);
        }

        Err(TesseraError::ConnectionClosed)
    }

    pub async fn send(&self, body: Body) -> TesseraResult<Message> {
        self.send_message(body, false, SEND_RETRIES).await
    }

    /// Closes every pooled connection; leased connections drop as their
    /// requests finish.
    pub fn stop(&self) {
        self.pool.lock().clear();
        *self.status.lock() = PeerStatus::Closed;
    }

    /// Measures a request round trip against the peer.
    pub async fn ping(&self) -> TesseraResult<Duration> {
        *self.last_ping.lock() = Some(now_micros());
        let started = Instant::now();

        let result = self.send(Body::PingRequest).await;

        let elapsed = started.elapsed();
        *self.ping_time.lock() = Some(elapsed);

        match result {
            Ok(response) => match response.body {
                Body::PingResponse => Ok(elapsed),
                _ => Err(TesseraError::UnexpectedMessage(response.kind())),
            },
            Err(e) => Err(e),
        }
    }

    pub async fn execute_retrieval(
        &self,
        instruction: RetrievalKind,
        key: &str,
    ) -> TesseraResult<Option<Value>> {
        let response = self
            .send(Body::RetrievalValueRequest {
                instruction,
                key: key.to_string(),
            })
            .await?;

        let kind = response.kind();

        match response.body {
            Body::RetrievalValueResponse { value } => Ok(Some(value)),
            Body::UnknownKey => Ok(None),
            _ => Err(TesseraError::UnexpectedMessage(kind)),
        }
    }

    pub async fn execute_mutation(&self, mutation: &Mutation) -> TesseraResult<bool> {
        let response = self
            .send(Body::MutationOperationRequest {
                instruction: mutation.kind,
                key: mutation.key.clone(),
                value: mutation.value.clone(),
                timestamp: mutation.timestamp,
            })
            .await?;

        let kind = response.kind();

        match response.body {
            Body::MutationOperationResponse { applied } => Ok(applied),
            _ => Err(TesseraError::UnexpectedMessage(kind)),
        }
    }
}
