use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::conn::{ConnTable, Delivery};
use super::ControlStream;
use crate::error::{Result, TunnelError};
use crate::protocol::{decode_data, IncomingMessage, OutgoingMessage};
use crate::tunnel::{BoxedStream, Session};

/// Public connections the relay may open ahead of the consumer. Beyond
/// this they are refused with `conn_close`.
const ACCEPT_BACKLOG: usize = 1;

/// Established control channel. Dropping it closes the WebSocket.
pub struct RelaySession {
    accepted: mpsc::Receiver<BoxedStream>,
    ended: Option<oneshot::Receiver<TunnelError>>,
    shutdown: CancellationToken,
}

impl RelaySession {
    pub(crate) fn start(ws: ControlStream) -> Self {
        let (mut write, read) = ws.split();
        let shutdown = CancellationToken::new();

        // Raw WebSocket messages, including pongs and per-connection data
        let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(256);
        let (accepted_tx, accepted_rx) = mpsc::channel::<BoxedStream>(ACCEPT_BACKLOG);
        let (ended_tx, ended_rx) = oneshot::channel();

        // This task exclusively owns the write half - no locks needed
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    msg = ws_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(msg).await {
                            debug!("Send error (connection closing): {}", e);
                            break;
                        }
                    }
                }
            }
            writer_shutdown.cancel();
        });

        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let reason = read_loop(read, ws_tx, accepted_tx, &reader_shutdown).await;
            debug!("Control channel ended: {}", reason);
            reader_shutdown.cancel();
            let _ = ended_tx.send(reason);
        });

        Self {
            accepted: accepted_rx,
            ended: Some(ended_rx),
            shutdown,
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Session for RelaySession {
    async fn accept(&mut self) -> Result<BoxedStream> {
        if let Some(conn) = self.accepted.recv().await {
            return Ok(conn);
        }

        let reason = match self.ended.take() {
            Some(ended) => ended.await.ok(),
            None => None,
        };
        Err(reason.unwrap_or_else(|| TunnelError::ConnectionLost("control channel closed".to_string())))
    }
}

/// Demultiplexes relay messages until the control channel dies, returning
/// why it died. Never waits on a consumer, so pings keep flowing while a
/// connection sits unread.
async fn read_loop(
    mut read: futures_util::stream::SplitStream<ControlStream>,
    ws_tx: mpsc::Sender<Message>,
    accepted_tx: mpsc::Sender<BoxedStream>,
    shutdown: &CancellationToken,
) -> TunnelError {
    // Dropped with the loop, which tears down every connection of the session.
    let mut conns = ConnTable::new(ws_tx.clone());

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                return TunnelError::ConnectionLost("control channel shut down".to_string())
            }
            conn_id = conns.reaped() => {
                debug!("Connection {} released ({} open)", conn_id, conns.len());
                continue;
            }
            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                let _ = ws_tx.send(Message::Pong(data)).await;
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                info!("Relay closed connection: {:?}", reason);
                return TunnelError::ConnectionLost(format!("closed by relay: {}", reason));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("WebSocket read error: {}", e);
                return TunnelError::WebSocket(e);
            }
            None => return TunnelError::ConnectionLost("control channel closed".to_string()),
        };

        let msg = match IncomingMessage::from_json(&text) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Error handling message: {}", e);
                continue;
            }
        };

        match msg {
            IncomingMessage::ConnOpen {
                conn_id,
                remote_addr,
            } => {
                debug!(
                    "Public connection {} from {}",
                    conn_id,
                    remote_addr.as_deref().unwrap_or("<unknown>")
                );

                let permit = match accepted_tx.try_reserve() {
                    Ok(permit) => permit,
                    Err(mpsc::error::TrySendError::Full(())) => {
                        warn!("Accept backlog full, refusing connection {}", conn_id);
                        conns.refuse(&conn_id, "accept backlog full").await;
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(())) => {
                        return TunnelError::ConnectionLost("session dropped".to_string());
                    }
                };

                permit.send(Box::new(conns.open(conn_id)));
            }
            IncomingMessage::ConnData { conn_id, data } => {
                let Some(decoded) = decode_data(&data) else {
                    warn!("Undecodable data for connection {}", conn_id);
                    continue;
                };
                if let Delivery::Unknown = conns.deliver(&conn_id, decoded).await {
                    debug!("Data for unknown connection: {}", conn_id);
                }
            }
            IncomingMessage::ConnClose { conn_id, reason } => {
                conns.close(&conn_id);
                debug!(
                    "Connection {} closed by relay: {}",
                    conn_id,
                    reason.as_deref().unwrap_or("closed")
                );
            }
            IncomingMessage::Ping { timestamp } => {
                if let Ok(json) = (OutgoingMessage::Pong { timestamp }).to_json() {
                    let _ = ws_tx.send(Message::Text(json)).await;
                }
            }
            IncomingMessage::Rejected { code, message } => {
                return TunnelError::Rejected { code, message };
            }
            IncomingMessage::Error { code, message } => {
                error!("Relay error: {} - {}", code, message);
            }
            IncomingMessage::Ready { .. } => {
                warn!("Unexpected ready message on an established session");
            }
        }
    }
}
