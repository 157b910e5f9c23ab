//! WebSocket relay transport.
//!
//! One control WebSocket per session carries JSON messages; public
//! connections are multiplexed over it as `conn_*` messages and surface
//! locally as in-memory duplex streams.

mod conn;
mod session;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};

use crate::error::{Result, TunnelError};
use crate::protocol::{IncomingMessage, OutgoingMessage};
use crate::tunnel::{ServerInfo, Session, Transport, TunnelInfo, TunnelType};

pub use session::RelaySession;

pub(crate) type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLIENT_VERSION_HEADER: &str = "x-tunl-version";

#[derive(Debug, Clone)]
pub struct RelayTransport {
    /// Bound on dialing plus the handshake exchange
    pub handshake_timeout: Duration,
}

impl Default for RelayTransport {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayTransport {
    async fn open_session(
        &self,
        server: &ServerInfo,
        hello: OutgoingMessage,
    ) -> Result<(TunnelInfo, Box<dyn Session>)> {
        let handshake = async {
            let mut ws = dial(server).await?;
            ws.send(Message::Text(hello.to_json()?)).await?;
            let info = await_ready(&mut ws).await?;
            Ok::<_, TunnelError>((info, ws))
        };

        let (info, ws) = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                TunnelError::Connect(format!(
                    "timed out after {:?} waiting for {}",
                    self.handshake_timeout, server.control_url
                ))
            })??;

        Ok((info, Box::new(RelaySession::start(ws))))
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn connect(
        &self,
        server: &ServerInfo,
        kind: TunnelType,
    ) -> Result<(TunnelInfo, Box<dyn Session>)> {
        self.open_session(server, OutgoingMessage::hello(kind)).await
    }

    async fn reconnect(
        &self,
        server: &ServerInfo,
        _kind: TunnelType,
        tunnel: &TunnelInfo,
    ) -> Result<(TunnelInfo, Box<dyn Session>)> {
        self.open_session(server, OutgoingMessage::resume(&tunnel.id, &tunnel.token))
            .await
    }
}

async fn dial(server: &ServerInfo) -> Result<ControlStream> {
    let mut request = server.control_url.as_str().into_client_request()?;
    request.headers_mut().insert(
        CLIENT_VERSION_HEADER,
        http::HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );

    info!("Connecting to {}...", server.control_url);
    let (ws, _) = connect_async(request)
        .await
        .map_err(|e| TunnelError::Connect(format!("{}: {}", server.control_url, e)))?;
    Ok(ws)
}

/// Reads until the relay accepts or refuses the handshake.
async fn await_ready(ws: &mut ControlStream) -> Result<TunnelInfo> {
    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Ping(data) => {
                ws.send(Message::Pong(data)).await?;
                continue;
            }
            Message::Close(frame) => {
                return Err(TunnelError::Handshake(format!(
                    "relay closed connection: {:?}",
                    frame.map(|f| f.reason.to_string())
                )))
            }
            _ => continue,
        };

        match IncomingMessage::from_json(&text)? {
            IncomingMessage::Ready {
                tunnel_id,
                token,
                address,
                version,
            } => {
                return Ok(TunnelInfo {
                    id: tunnel_id,
                    token,
                    address,
                    version: TunnelInfo::parse_version(version.as_deref()),
                })
            }
            IncomingMessage::Rejected { code, message } => {
                return Err(TunnelError::Rejected { code, message })
            }
            IncomingMessage::Error { code, message } => {
                return Err(TunnelError::Handshake(format!("{} - {}", code, message)))
            }
            IncomingMessage::Ping { timestamp } => {
                let pong = OutgoingMessage::Pong { timestamp };
                ws.send(Message::Text(pong.to_json()?)).await?;
            }
            other => debug!("Ignoring {:?} before handshake completed", other),
        }
    }

    Err(TunnelError::Handshake(
        "relay closed connection during handshake".to_string(),
    ))
}
