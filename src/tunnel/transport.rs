//! Seam between the lifecycle state machine and the relay wire protocol.

use async_trait::async_trait;

use super::{ServerInfo, TunnelInfo, TunnelType};
use crate::error::Result;

/// A bidirectional async byte stream.
///
/// Trait objects can only have a single non-auto "principal" trait, so
/// `AsyncRead + AsyncWrite` is wrapped into one.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

/// A public connection accepted through the tunnel.
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Dials the relay and performs handshakes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fresh handshake: the relay allocates a new tunnel identity.
    async fn connect(
        &self,
        server: &ServerInfo,
        kind: TunnelType,
    ) -> Result<(TunnelInfo, Box<dyn Session>)>;

    /// Re-attach to `tunnel` using its previously issued id and token.
    async fn reconnect(
        &self,
        server: &ServerInfo,
        kind: TunnelType,
        tunnel: &TunnelInfo,
    ) -> Result<(TunnelInfo, Box<dyn Session>)>;
}

/// A live control connection to the relay.
#[async_trait]
pub trait Session: Send {
    /// Waits for the next public connection. An error means the underlying
    /// connection is gone and the session is unusable.
    async fn accept(&mut self) -> Result<BoxedStream>;
}
