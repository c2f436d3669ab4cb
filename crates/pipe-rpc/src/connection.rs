//! One live channel endpoint.
//!
//! Writes go through a single async lock so concurrent senders never
//! interleave partial frames. Reads belong to the connection's one listen
//! loop and need no lock. Closing the connection cancels a shared token that
//! unblocks both sides.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, EnvelopeCodec};
use crate::bridge::protocol::{Envelope, uuid_id};
use crate::bridge::transport::{BoxedReader, BoxedWriter, PipeStream};
use crate::error::{Result, RpcError};

uuid_id! {
    /// Identity of one accepted or established connection.
    ConnectionId
}

pub struct Connection {
    id: ConnectionId,
    writer: Mutex<FramedWrite<BoxedWriter, EnvelopeCodec>>,
    closed: CancellationToken,
}

/// Read half of a [`Connection`], owned by its listen loop.
pub struct ConnectionReader {
    id: ConnectionId,
    frames: FramedRead<BoxedReader, EnvelopeCodec>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(stream: PipeStream) -> (Arc<Self>, ConnectionReader) {
        Self::with_token(stream, CancellationToken::new())
    }

    /// Like [`Connection::new`], but closing is tied to `parent`: cancelling
    /// it closes this connection too.
    pub fn with_parent(
        stream: PipeStream,
        parent: &CancellationToken,
    ) -> (Arc<Self>, ConnectionReader) {
        Self::with_token(stream, parent.child_token())
    }

    fn with_token(stream: PipeStream, closed: CancellationToken) -> (Arc<Self>, ConnectionReader) {
        let id = ConnectionId::new();
        let (reader, writer) = stream.into_split();
        let connection = Arc::new(Self {
            id,
            writer: Mutex::new(FramedWrite::new(writer, EnvelopeCodec::new())),
            closed: closed.clone(),
        });
        let reader = ConnectionReader {
            id,
            frames: FramedRead::new(reader, EnvelopeCodec::new()),
            closed,
        };
        (connection, reader)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Write one envelope as a whole frame.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RpcError::connection_lost(format!(
                "connection {} is closed",
                self.id
            )));
        }

        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(RpcError::connection_lost(format!(
                "connection {} closed while sending",
                self.id
            ))),
            result = writer.send(envelope) => {
                result.map_err(|e| {
                    tracing::debug!(connection = %self.id, error = %e, "Send failed, closing connection");
                    self.closed.cancel();
                    RpcError::from(e)
                })
            }
        }
    }

    /// Mark the connection closed. Pending sends and the listen loop return.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Close and flush the write half so the peer sees end-of-stream.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            tracing::trace!(connection = %self.id, error = %e, "Error closing write half");
        }
    }

    /// Token that fires when this connection closes. Cancelling it does not
    /// close the connection.
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.child_token()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed from either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl ConnectionReader {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next inbound envelope. `None` on clean end-of-stream or after close.
    pub async fn next(&mut self) -> Option<std::result::Result<Envelope, CodecError>> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = self.frames.next() => frame,
        }
    }
}
