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

use futures::sink::SinkExt;

use parking_lot::Mutex;

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::cluster::Cluster;
use crate::connection::MessageCodec;
use crate::error::{TesseraError, TesseraResult};
use crate::protocol::{Body, Message};
use crate::store::{Mutation, RetrievalKind};

/// Port the peer server binds when the configuration does not say
/// otherwise.
pub const DEFAULT_PEER_PORT: u16 = 4379;

/// Handles incoming requests from the other nodes in the cluster.
///
/// Every accepted connection must open with a connection request; after
/// the handshake, requests are answered in order on the connection.
pub struct PeerServer {
    local_addr: SocketAddr,
    cluster: Arc<Cluster>,

    /// Consumed by `start`.
    listener: Mutex<Option<TcpListener>>,

    /// Flipping this tells the accept loop and every connection task to
    /// wind down.
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PeerServer {
    pub fn new(listener: TcpListener, cluster: Arc<Cluster>) -> TesseraResult<PeerServer> {
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        Ok(PeerServer {
            local_addr,
            cluster,
            listener: Mutex::new(Some(listener)),
            shutdown,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop and returns immediately.
    pub fn start(&self) -> TesseraResult<()> {
        let listener = self.listener.lock().take().ok_or_else(|| {
            TesseraError::Unsupported("peer server already started".to_string())
        })?;

        let cluster = self.cluster.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let addr = self.local_addr;

        tokio::spawn(async move {
            info!("Accepting peer connections (addr = {})", addr);

            loop {
                select! {
                    _ = shutdown.changed() => {
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                debug!("Peer connected (addr = {})", peer_addr);

                                tokio::spawn(handle_connection(
                                    cluster.clone(),
                                    stream,
                                    peer_addr,
                                    shutdown.clone(),
                                ));
                            }
                            Err(e) => {
                                error!("Unable to accept connection: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            info!("Peer server stopped (addr = {})", addr);
        });

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Drives one inbound connection: handshake first, then a strict
/// request/response loop until the peer hangs up or shutdown is signaled.
async fn handle_connection(
    cluster: Arc<Cluster>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut frame = Framed::new(stream, MessageCodec);

    let hello = match frame.next().await {
        Some(Ok(message)) => message,
        _ => return,
    };

    match hello.body {
        Body::ConnectionRequest {
            address,
            token,
            name,
        } => {
            let accept = Message::new(
                cluster.node_id(),
                Body::ConnectionAccepted {
                    token: cluster.token(),
                    name: cluster.name(),
                },
            );

            if frame.send(accept).await.is_err() {
                return;
            }

            // register the caller and make sure we can reach it back
            match cluster.add_node(hello.sender, address, token, name).await {
                Ok(node) => {
                    if let Some(remote) = node.as_remote() {
                        if let Err(e) = remote.connect().await {
                            warn!("Unable to call peer back (id = {}): {}", hello.sender, e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Unable to register peer (id = {}): {}", hello.sender, e);
                }
            }
        }
        _ => {
            warn!(
                "Refusing connection (addr = {}) (first message = {})",
                addr,
                hello.kind()
            );

            let refuse = Message::new(
                cluster.node_id(),
                Body::ConnectionRefused {
                    reason: "first message must be a connection request".to_string(),
                },
            );

            let _ = frame.send(refuse).await;
            return;
        }
    }

    loop {
        select! {
            _ = shutdown.changed() => {
                break;
            }
            next = frame.next() => {
                match next {
                    None => break,
                    Some(Ok(request)) => {
                        debug!(
                            "Received peer request (kind = {}) (addr = {})",
                            request.kind(),
                            addr
                        );

                        let body = dispatch(&cluster, &request).await;
                        let response = Message::new(cluster.node_id(), body);

                        if frame.send(response).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(TesseraError::InvalidInstruction(code))) => {
                        // the frame was consumed whole; answer and keep
                        // the connection
                        let response = Message::new(
                            cluster.node_id(),
                            Body::Error {
                                reason: format!("{} is not a valid instruction", code),
                            },
                        );

                        if frame.send(response).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Protocol violation (addr = {}): {}", addr, e);

                        let response = Message::new(
                            cluster.node_id(),
                            Body::Error {
                                reason: e.to_string(),
                            },
                        );

                        let _ = frame.send(response).await;
                        break;
                    }
                }
            }
        }
    }

    debug!("Peer disconnected (addr = {})", addr);
}

/// Maps one request to its response body.
async fn dispatch(cluster: &Arc<Cluster>, request: &Message) -> Body {
    match &request.body {
        Body::Noop => Body::Noop,

        Body::PingRequest => Body::PingResponse,

        Body::DiscoverPeersRequest => Body::DiscoverPeersResponse {
            peers: cluster.peer_infos(),
        },

        Body::RetrievalValueRequest { instruction, key } => match instruction {
            RetrievalKind::Get => match cluster.store().get(key).await {
                Some(value) => Body::RetrievalValueResponse { value },
                None => Body::UnknownKey,
            },
        },

        Body::MutationOperationRequest {
            instruction,
            key,
            value,
            timestamp,
        } => {
            let mutation = Mutation {
                kind: *instruction,
                key: key.clone(),
                value: value.clone(),
                timestamp: *timestamp,
            };

            match cluster.store().apply(&mutation).await {
                Ok(applied) => Body::MutationOperationResponse { applied },
                Err(e) => Body::Error {
                    reason: format!("error processing request: {}", e),
                },
            }
        }

        Body::ChangedTokenRequest { node, token } => {
            match cluster.change_token(*token, Some(*node), false).await {
                Ok(()) => Body::ChangedTokenResponse,
                Err(e) => Body::Error {
                    reason: e.to_string(),
                },
            }
        }

        Body::RemoveNodeRequest { node } => {
            match cluster.remove_node(Some(*node), false).await {
                Ok(()) => Body::RemoveNodeResponse,
                Err(e) => Body::Error {
                    reason: e.to_string(),
                },
            }
        }

        Body::StreamRequest => {
            // early ack: the data flows over our own client connections
            // to the requester while it carries on
            let cluster = cluster.clone();
            let requester = request.sender;

            tokio::spawn(async move {
                if let Err(e) = cluster.stream_to_node(requester).await {
                    warn!("Streaming failed (to = {}): {}", requester, e);
                }
            });

            Body::StreamResponse
        }

        Body::StreamDataRequest { entries } => {
            cluster.receive_streamed_values(entries.clone()).await;

            Body::StreamDataResponse
        }

        Body::StreamCompleteRequest => {
            cluster.end_streaming(request.sender);

            Body::StreamCompleteResponse
        }

        other => Body::Error {
            reason: format!("unexpected {} message", other.kind()),
        },
    }
}
