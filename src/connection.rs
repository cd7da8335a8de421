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
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};

use futures::sink::SinkExt;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{TesseraError, TesseraResult};
use crate::protocol::{Kind, Message};

/// Time allowed for a dial to complete.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for a peer to answer a single request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames `[u32 kind][u32 body length][body]` messages on a byte stream.
///
/// A whole frame is consumed before its body is parsed, so a decode
/// failure leaves the buffer positioned at the next frame.
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TesseraError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TesseraError> {
        if src.len() < 8 {
            return Ok(None);
        }

        let mut header = &src[..8];
        let kind_code = header.get_u32();
        let body_len = header.get_u32() as usize;

        if src.len() < 8 + body_len {
            src.reserve(8 + body_len - src.len());
            return Ok(None);
        }

        src.advance(8);
        let body = src.split_to(body_len);

        let kind = Kind::try_from(kind_code)?;
        let message = Message::parse(kind, &body)?;

        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = TesseraError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), TesseraError> {
        dst.extend_from_slice(&item.to_bytes());

        Ok(())
    }
}

/// A framed TCP stream to one peer.
///
/// Requests and responses are strictly sequential on a connection; any
/// IO failure or response timeout surfaces as `ConnectionClosed` and the
/// connection must be discarded.
pub struct Connection {
    frame: Framed<TcpStream, MessageCodec>,
    response_timeout: Duration,
}

impl Connection {
    pub async fn connect(address: SocketAddr) -> TesseraResult<Connection> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| TesseraError::ConnectionClosed)??;

        Ok(Connection {
            frame: Framed::new(stream, MessageCodec),
            response_timeout: RESPONSE_TIMEOUT,
        })
    }

    pub fn set_response_timeout(&mut self, dur: Duration) {
        self.response_timeout = dur;
    }

    pub async fn send(&mut self, message: Message) -> TesseraResult<()> {
        self.frame
            .send(message)
            .await
            .map_err(|_| TesseraError::ConnectionClosed)
    }

    pub async fn recv(&mut self) -> TesseraResult<Message> {
        match timeout(self.response_timeout, self.frame.next()).await {
            Ok(Some(Ok(message))) => Ok(message),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(TesseraError::ConnectionClosed),
            Err(_) => Err(TesseraError::ConnectionClosed),
        }
    }

    /// One request/response exchange.
    pub async fn request(&mut self, message: Message) -> TesseraResult<Message> {
        self.send(message).await?;
        self.recv().await
    }
}
