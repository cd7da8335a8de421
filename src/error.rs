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

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::Kind;

#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Received {received} of {required} required replies")]
    QuorumTimeout { required: usize, received: usize },

    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Invalid message kind {0}")]
    InvalidMessageKind(u32),

    #[error("Invalid instruction {0}")]
    InvalidInstruction(u8),

    #[error("Unexpected {0} message")]
    UnexpectedMessage(Kind),

    #[error("Unknown node {0}")]
    UnknownNode(Uuid),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Peer error: {0}")]
    PeerError(String),

    #[error("Invalid net address {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("Unable to parse int {0}")]
    InvalidInt(#[from] std::num::ParseIntError),
}

pub type TesseraResult<T> = std::result::Result<T, TesseraError>;
