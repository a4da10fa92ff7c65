use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// One inbound unit from a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    /// Liveness signal (ping/pong, or the `{}` heartbeat on the WebSocket
    /// transport); never handed to message handlers
    KeepAlive,
}

/// Opens connections to a streaming endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the handshake fails
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// An open streaming connection
#[async_trait]
pub trait Connection: Send {
    /// # Errors
    ///
    /// Returns an error if the frame could not be written
    async fn send(&mut self, payload: Bytes) -> Result<()>;

    /// Next inbound frame. `None` means the remote side closed the stream.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    /// Transport-level keep-alive
    ///
    /// # Errors
    ///
    /// Returns an error if the ping could not be written
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the close handshake fails
    async fn close(&mut self) -> Result<()>;
}
