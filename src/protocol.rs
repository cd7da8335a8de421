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

use std::convert::TryFrom;
use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use nom::bytes::complete::take;
use nom::combinator::{map, map_res};
use nom::multi::{count, length_data};
use nom::number::complete::{be_u128, be_u32, be_u64, be_u8};
use nom::IResult;

use uuid::Uuid;

use crate::error::{TesseraError, TesseraResult};
use crate::partitioner::Token;
use crate::store::{MutationKind, RetrievalKind, Timestamp, Value};

/// Message kinds understood by the peer protocol.
///
/// The numeric codes are part of the wire format and must remain stable.
/// Every frame is `[u32 kind][u32 body length][body]`, big-endian.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Kind {
    /// Heartbeat, echoed back verbatim.
    Noop = 0,

    /// Mandatory first message on every connection.
    ConnectionRequest = 101,
    ConnectionAccepted = 102,
    ConnectionRefused = 103,

    /// Asks a peer for every node it knows about.
    DiscoverPeersRequest = 201,
    DiscoverPeersResponse = 202,

    PingRequest = 210,
    PingResponse = 211,

    /// Remote read of a single key.
    RetrievalValueRequest = 303,
    RetrievalValueResponse = 304,

    /// Read miss, treated as a null value during resolution.
    UnknownKey = 305,

    /// Remote write of a single key.
    MutationOperationRequest = 306,
    MutationOperationResponse = 307,

    /// "Please stream the keys I replicate to me."
    StreamRequest = 705,
    StreamResponse = 706,

    /// A batch of key/value records belonging to an active stream.
    StreamDataRequest = 707,
    StreamDataResponse = 708,

    StreamCompleteRequest = 709,
    StreamCompleteResponse = 710,

    /// Announces that a node moved to a new ring position.
    ChangedTokenRequest = 805,
    ChangedTokenResponse = 806,

    /// Announces that a node left the ring.
    RemoveNodeRequest = 807,
    RemoveNodeResponse = 808,

    /// Textual failure reason.
    Error = 999,
}

impl TryFrom<u32> for Kind {
    type Error = TesseraError;

    fn try_from(value: u32) -> Result<Self, TesseraError> {
        match value {
            0 => Ok(Kind::Noop),
            101 => Ok(Kind::ConnectionRequest),
            102 => Ok(Kind::ConnectionAccepted),
            103 => Ok(Kind::ConnectionRefused),
            201 => Ok(Kind::DiscoverPeersRequest),
            202 => Ok(Kind::DiscoverPeersResponse),
            210 => Ok(Kind::PingRequest),
            211 => Ok(Kind::PingResponse),
            303 => Ok(Kind::RetrievalValueRequest),
            304 => Ok(Kind::RetrievalValueResponse),
            305 => Ok(Kind::UnknownKey),
            306 => Ok(Kind::MutationOperationRequest),
            307 => Ok(Kind::MutationOperationResponse),
            705 => Ok(Kind::StreamRequest),
            706 => Ok(Kind::StreamResponse),
            707 => Ok(Kind::StreamDataRequest),
            708 => Ok(Kind::StreamDataResponse),
            709 => Ok(Kind::StreamCompleteRequest),
            710 => Ok(Kind::StreamCompleteResponse),
            805 => Ok(Kind::ChangedTokenRequest),
            806 => Ok(Kind::ChangedTokenResponse),
            807 => Ok(Kind::RemoveNodeRequest),
            808 => Ok(Kind::RemoveNodeResponse),
            999 => Ok(Kind::Error),
            x => Err(TesseraError::InvalidMessageKind(x)),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Peer coordinates exchanged during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub node_id: Uuid,
    pub token: Token,
    pub name: Option<String>,
}

/// The per-kind payload of a message.
///
/// Bodies are positional tuples; the field order below is the wire order.
/// Strings and byte payloads are length-prefixed with a `u32`, options
/// carry a one byte presence tag, lists a `u32` element count.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Noop,
    ConnectionRequest {
        address: SocketAddr,
        token: Token,
        name: Option<String>,
    },
    ConnectionAccepted {
        token: Token,
        name: Option<String>,
    },
    ConnectionRefused {
        reason: String,
    },
    DiscoverPeersRequest,
    DiscoverPeersResponse {
        peers: Vec<PeerInfo>,
    },
    PingRequest,
    PingResponse,
    RetrievalValueRequest {
        instruction: RetrievalKind,
        key: String,
    },
    RetrievalValueResponse {
        value: Value,
    },
    UnknownKey,
    MutationOperationRequest {
        instruction: MutationKind,
        key: String,
        value: Option<Bytes>,
        timestamp: Timestamp,
    },
    MutationOperationResponse {
        applied: bool,
    },
    StreamRequest,
    StreamResponse,
    StreamDataRequest {
        entries: Vec<(String, Value)>,
    },
    StreamDataResponse,
    StreamCompleteRequest,
    StreamCompleteResponse,
    ChangedTokenRequest {
        node: Uuid,
        token: Token,
    },
    ChangedTokenResponse,
    RemoveNodeRequest {
        node: Uuid,
    },
    RemoveNodeResponse,
    Error {
        reason: String,
    },
}

impl Body {
    pub fn kind(&self) -> Kind {
        match self {
            Body::Noop => Kind::Noop,
            Body::ConnectionRequest { .. } => Kind::ConnectionRequest,
            Body::ConnectionAccepted { .. } => Kind::ConnectionAccepted,
            Body::ConnectionRefused { .. } => Kind::ConnectionRefused,
            Body::DiscoverPeersRequest => Kind::DiscoverPeersRequest,
            Body::DiscoverPeersResponse { .. } => Kind::DiscoverPeersResponse,
            Body::PingRequest => Kind::PingRequest,
            Body::PingResponse => Kind::PingResponse,
            Body::RetrievalValueRequest { .. } => Kind::RetrievalValueRequest,
            Body::RetrievalValueResponse { .. } => Kind::RetrievalValueResponse,
            Body::UnknownKey => Kind::UnknownKey,
            Body::MutationOperationRequest { .. } => Kind::MutationOperationRequest,
            Body::MutationOperationResponse { .. } => Kind::MutationOperationResponse,
            Body::StreamRequest => Kind::StreamRequest,
            Body::StreamResponse => Kind::StreamResponse,
            Body::StreamDataRequest { .. } => Kind::StreamDataRequest,
            Body::StreamDataResponse => Kind::StreamDataResponse,
            Body::StreamCompleteRequest => Kind::StreamCompleteRequest,
            Body::StreamCompleteResponse => Kind::StreamCompleteResponse,
            Body::ChangedTokenRequest { .. } => Kind::ChangedTokenRequest,
            Body::ChangedTokenResponse => Kind::ChangedTokenResponse,
            Body::RemoveNodeRequest { .. } => Kind::RemoveNodeRequest,
            Body::RemoveNodeResponse => Kind::RemoveNodeResponse,
            Body::Error { .. } => Kind::Error,
        }
    }
}

/// A single framed peer message.
///
/// Every message carries the sender's node id and a unique message id.
/// Responses are not correlated by message id; request/response pairs are
/// strictly sequential on a single connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: Uuid,
    pub id: Uuid,
    pub body: Body,
}

impl Message {
    pub fn new(sender: Uuid, body: Body) -> Self {
        Self {
            sender,
            id: Uuid::new_v4(),
            body,
        }
    }

    pub fn kind(&self) -> Kind {
        self.body.kind()
    }

    /// Serializes the message into a complete frame, header included.
    pub fn to_bytes(&self) -> Bytes {
        let mut body = BytesMut::new();

        put_uuid(&mut body, &self.sender);
        put_uuid(&mut body, &self.id);
        self.body.write(&mut body);

        let mut buf = BytesMut::with_capacity(body.len() + 8);

        buf.put_u32(self.kind() as u32);
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);

        buf.freeze()
    }

    /// Parses a message body for the given kind.
    ///
    /// An unknown instruction byte surfaces as `InvalidInstruction` so the
    /// server can answer it without tearing the connection down; every
    /// other parse failure is a `MalformedPayload`.
    pub fn parse(kind: Kind, input: &[u8]) -> TesseraResult<Message> {
        let (input, sender) = parse_uuid(input).map_err(|_| TesseraError::MalformedPayload)?;
        let (input, id) = parse_uuid(input).map_err(|_| TesseraError::MalformedPayload)?;

        let body = match kind {
            Kind::Noop => Body::Noop,
            Kind::ConnectionRequest => {
                let (input, address) =
                    parse_address(input).map_err(|_| TesseraError::MalformedPayload)?;
                let (input, token) =
                    parse_token(input).map_err(|_| TesseraError::MalformedPayload)?;
                let (_, name) = parse_optional(parse_string)(input)
                    .map_err(|_| TesseraError::MalformedPayload)?;

                Body::ConnectionRequest {
                    address,
                    token,
                    name,
                }
            }
            Kind::ConnectionAccepted => {
                let (input, token) =
                    parse_token(input).map_err(|_| TesseraError::MalformedPayload)?;
                let (_, name) = parse_optional(parse_string)(input)
                    .map_err(|_| TesseraError::MalformedPayload)?;

                Body::ConnectionAccepted { token, name }
            }
            Kind::ConnectionRefused => {
                let (_, reason) = parse_string(input).map_err(|_| TesseraError::MalformedPayload)?;

                Body::ConnectionRefused { reason }
            }
            Kind::DiscoverPeersRequest => Body::DiscoverPeersRequest,
            Kind::DiscoverPeersResponse => {
                let (input, n) = parse_u32(input).map_err(|_| TesseraError::MalformedPayload)?;
                let (_, peers) = count(parse_peer_info, n as usize)(input)
                    .map_err(|_| TesseraError::MalformedPayload)?;

                Body::DiscoverPeersResponse { peers }
            }
            Kind::PingRequest => Body::PingRequest,
            Kind::PingResponse => Body::PingResponse,
            Kind::RetrievalValueRequest => {
                let (input, code) = parse_u8(input).map_err(|_| TesseraError::MalformedPayload)?;
                let instruction = RetrievalKind::try_from(code)?;
                let (_, key) = parse_string(input).map_err(|_| TesseraError::MalformedPayload)?;

                Body::RetrievalValueRequest { instruction, key }
            }
            Kind::RetrievalValueResponse => {
                let (_, value) = parse_value(input).map_err(|_| TesseraError::MalformedPayload)?;

                Body::RetrievalValueResponse { value }
            }
            Kind::UnknownKey => Body::UnknownKey,
            Kind::MutationOperationRequest => {
                let (input, code) = parse_u8(input).map_err(|_| TesseraError::MalformedPayload)?;
                let instruction = MutationKind::try_from(code)?;
                let (input, key) =
                    parse_string(input).map_err(|_| TesseraError::MalformedPayload)?;
                let (input, value) = parse_optional(parse_bytes)(input)
                    .map_err(|_| TesseraError::MalformedPayload)?;
                let (_, timestamp) = parse_u64(input).map_err(|_| TesseraError::MalformedPayload)?;

                Body::MutationOperationRequest {
                    instruction,
                    key,
                    value,
                    timestamp,
                }
            }
            Kind::MutationOperationResponse => {
                let (_, applied) = parse_u8(input).map_err(|_| TesseraError::MalformedPayload)?;

                Body::MutationOperationResponse {
                    applied: applied != 0,
                }
            }
            Kind::StreamRequest => Body::StreamRequest,
            Kind::StreamResponse => Body::StreamResponse,
            Kind::StreamDataRequest => {
                let (input, n) = parse_u32(input).map_err(|_| TesseraError::MalformedPayload)?;
                let (_, entries) = count(parse_stream_entry, n as usize)(input)
                    .map_err(|_| TesseraError::MalformedPayload)?;

                Body::StreamDataRequest { entries }
            }
            Kind::StreamDataResponse => Body::StreamDataResponse,
            Kind::StreamCompleteRequest => Body::StreamCompleteRequest,
            Kind::StreamCompleteResponse => Body::StreamCompleteResponse,
            Kind::ChangedTokenRequest => {
                let (input, node) =
                    parse_uuid(input).map_err(|_| TesseraError::MalformedPayload)?;
                let (_, token) = parse_token(input).map_err(|_| TesseraError::MalformedPayload)?;

                Body::ChangedTokenRequest { node, token }
            }
            Kind::ChangedTokenResponse => Body::ChangedTokenResponse,
            Kind::RemoveNodeRequest => {
                let (_, node) = parse_uuid(input).map_err(|_| TesseraError::MalformedPayload)?;

                Body::RemoveNodeRequest { node }
            }
            Kind::RemoveNodeResponse => Body::RemoveNodeResponse,
            Kind::Error => {
                let (_, reason) = parse_string(input).map_err(|_| TesseraError::MalformedPayload)?;

                Body::Error { reason }
            }
        };

        Ok(Message { sender, id, body })
    }
}

impl Body {
    fn write(&self, buf: &mut BytesMut) {
        match self {
            Body::Noop
            | Body::DiscoverPeersRequest
            | Body::PingRequest
            | Body::PingResponse
            | Body::UnknownKey
            | Body::StreamRequest
            | Body::StreamResponse
            | Body::StreamDataResponse
            | Body::StreamCompleteRequest
            | Body::StreamCompleteResponse
            | Body::ChangedTokenResponse
            | Body::RemoveNodeResponse => {}
            Body::ConnectionRequest {
                address,
                token,
                name,
            } => {
                put_string(buf, &address.to_string());
                buf.put_u128(*token);
                put_optional_string(buf, name);
            }
            Body::ConnectionAccepted { token, name } => {
                buf.put_u128(*token);
                put_optional_string(buf, name);
            }
            Body::ConnectionRefused { reason } => {
                put_string(buf, reason);
            }
            Body::DiscoverPeersResponse { peers } => {
                buf.put_u32(peers.len() as u32);
                for peer in peers {
                    put_peer_info(buf, peer);
                }
            }
            Body::RetrievalValueRequest { instruction, key } => {
                buf.put_u8(*instruction as u8);
                put_string(buf, key);
            }
            Body::RetrievalValueResponse { value } => {
                put_value(buf, value);
            }
            Body::MutationOperationRequest {
                instruction,
                key,
                value,
                timestamp,
            } => {
                buf.put_u8(*instruction as u8);
                put_string(buf, key);
                put_optional_bytes(buf, value);
                buf.put_u64(*timestamp);
            }
            Body::MutationOperationResponse { applied } => {
                buf.put_u8(*applied as u8);
            }
            Body::StreamDataRequest { entries } => {
                buf.put_u32(entries.len() as u32);
                for (key, value) in entries {
                    put_string(buf, key);
                    put_value(buf, value);
                }
            }
            Body::ChangedTokenRequest { node, token } => {
                put_uuid(buf, node);
                buf.put_u128(*token);
            }
            Body::RemoveNodeRequest { node } => {
                put_uuid(buf, node);
            }
            Body::Error { reason } => {
                put_string(buf, reason);
            }
        }
    }
}

// ----------- field writers -----------

fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn put_optional_string(buf: &mut BytesMut, s: &Option<String>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_optional_bytes(buf: &mut BytesMut, b: &Option<Bytes>) {
    match b {
        Some(b) => {
            buf.put_u8(1);
            put_bytes(buf, b);
        }
        None => buf.put_u8(0),
    }
}

fn put_value(buf: &mut BytesMut, value: &Value) {
    put_optional_bytes(buf, &value.data);
    buf.put_u64(value.timestamp);
}

fn put_peer_info(buf: &mut BytesMut, peer: &PeerInfo) {
    put_string(buf, &peer.address.to_string());
    put_uuid(buf, &peer.node_id);
    buf.put_u128(peer.token);
    put_optional_string(buf, &peer.name);
}

// ----------- field parsers -----------

// The number parsers are generic over the error type; these concrete
// wrappers pin it down so call sites infer cleanly.

fn parse_u8(input: &[u8]) -> IResult<&[u8], u8> {
    be_u8(input)
}

fn parse_u32(input: &[u8]) -> IResult<&[u8], u32> {
    be_u32(input)
}

fn parse_u64(input: &[u8]) -> IResult<&[u8], u64> {
    be_u64(input)
}

fn parse_uuid(input: &[u8]) -> IResult<&[u8], Uuid> {
    map_res(take(16usize), Uuid::from_slice)(input)
}

fn parse_token(input: &[u8]) -> IResult<&[u8], Token> {
    be_u128(input)
}

fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    map_res(length_data(be_u32), |b: &[u8]| {
        std::str::from_utf8(b).map(str::to_string)
    })(input)
}

fn parse_bytes(input: &[u8]) -> IResult<&[u8], Bytes> {
    map(length_data(be_u32), Bytes::copy_from_slice)(input)
}

fn parse_address(input: &[u8]) -> IResult<&[u8], SocketAddr> {
    map_res(parse_string, |s: String| s.parse::<SocketAddr>())(input)
}

fn parse_optional<'a, T, F>(inner: F) -> impl Fn(&'a [u8]) -> IResult<&'a [u8], Option<T>>
where
    F: Fn(&'a [u8]) -> IResult<&'a [u8], T>,
{
    move |input| {
        let (input, tag) = be_u8(input)?;
        if tag == 0 {
            Ok((input, None))
        } else {
            let (input, value) = inner(input)?;
            Ok((input, Some(value)))
        }
    }
}

fn parse_value(input: &[u8]) -> IResult<&[u8], Value> {
    let (input, data) = parse_optional(parse_bytes)(input)?;
    let (input, timestamp) = be_u64(input)?;

    Ok((input, Value { data, timestamp }))
}

fn parse_stream_entry(input: &[u8]) -> IResult<&[u8], (String, Value)> {
    let (input, key) = parse_string(input)?;
    let (input, value) = parse_value(input)?;

    Ok((input, (key, value)))
}

fn parse_peer_info(input: &[u8]) -> IResult<&[u8], PeerInfo> {
    let (input, address) = parse_address(input)?;
    let (input, node_id) = parse_uuid(input)?;
    let (input, token) = parse_token(input)?;
    let (input, name) = parse_optional(parse_string)(input)?;

    Ok((
        input,
        PeerInfo {
            address,
            node_id,
            token,
            name,
        },
    ))
}
