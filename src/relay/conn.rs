use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::protocol::{ConnId, OutgoingMessage};

/// In-memory buffer between the consumer and the relay side of a connection
pub(crate) const DUPLEX_BUFFER: usize = 64 * 1024;

/// Relay payloads queued per connection before it is reset
pub(crate) const CONN_QUEUE: usize = 64;

const READ_CHUNK: usize = 8192;

pub(crate) enum Delivery {
    Queued,
    Unknown,
    /// The consumer fell too far behind; the connection was torn down.
    Reset,
}

struct OpenConn {
    data: mpsc::Sender<Vec<u8>>,
    pump: AbortHandle,
}

/// Live public connections of one session and the tasks pumping them.
///
/// Dropping the table aborts every pump, which the consumer sees as EOF.
pub(crate) struct ConnTable {
    open: HashMap<ConnId, OpenConn>,
    pumps: JoinSet<ConnId>,
    ws_tx: mpsc::Sender<Message>,
}

impl ConnTable {
    pub(crate) fn new(ws_tx: mpsc::Sender<Message>) -> Self {
        Self {
            open: HashMap::new(),
            pumps: JoinSet::new(),
            ws_tx,
        }
    }

    /// Starts pumping `conn_id` and returns the consumer's end.
    pub(crate) fn open(&mut self, conn_id: ConnId) -> DuplexStream {
        let (public, relayed) = tokio::io::duplex(DUPLEX_BUFFER);
        let (data_tx, data_rx) = mpsc::channel(CONN_QUEUE);
        let handle = self
            .pumps
            .spawn(pump(relayed, conn_id.clone(), self.ws_tx.clone(), data_rx));
        self.open.insert(
            conn_id,
            OpenConn {
                data: data_tx,
                pump: handle,
            },
        );
        public
    }

    /// Queues relay data for `conn_id` without waiting on the consumer.
    pub(crate) async fn deliver(&mut self, conn_id: &ConnId, data: Vec<u8>) -> Delivery {
        let Some(conn) = self.open.get(conn_id) else {
            return Delivery::Unknown;
        };

        match conn.data.try_send(data) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Connection {} is not being read, resetting it", conn_id);
                if let Some(conn) = self.open.remove(conn_id) {
                    conn.pump.abort();
                }
                self.refuse(conn_id, "receive buffer full").await;
                Delivery::Reset
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.open.remove(conn_id);
                Delivery::Unknown
            }
        }
    }

    /// The relay closed `conn_id`: the consumer reads EOF once the queued
    /// data is drained.
    pub(crate) fn close(&mut self, conn_id: &ConnId) {
        self.open.remove(conn_id);
    }

    /// Tells the relay `conn_id` is gone.
    pub(crate) async fn refuse(&self, conn_id: &ConnId, reason: &str) {
        send(&self.ws_tx, OutgoingMessage::conn_close(conn_id, reason)).await;
    }

    /// Waits for a pump to finish and forgets its connection. Pending while
    /// nothing is open.
    pub(crate) async fn reaped(&mut self) -> ConnId {
        loop {
            match self.pumps.join_next().await {
                Some(Ok(conn_id)) => {
                    self.open.remove(&conn_id);
                    return conn_id;
                }
                // Aborted after a reset, already forgotten.
                Some(Err(_)) => continue,
                None => std::future::pending().await,
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.open.len()
    }
}

/// Shuttles bytes between the relay side of a public connection and the
/// control channel.
///
/// Finishes when the consumer closes its end, or when the relay has closed
/// its direction and the consumer is done writing.
async fn pump(
    stream: DuplexStream,
    conn_id: ConnId,
    ws_tx: mpsc::Sender<Message>,
    mut incoming: mpsc::Receiver<Vec<u8>>,
) -> ConnId {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // Consumer -> relay
    let outbound = async {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let msg = match read_half.read(&mut buf).await {
                Ok(0) => {
                    send(&ws_tx, OutgoingMessage::conn_close(&conn_id, "closed")).await;
                    break;
                }
                Ok(n) => OutgoingMessage::conn_data(&conn_id, &buf[..n]),
                Err(e) => {
                    debug!("Read error on {}: {}", conn_id, e);
                    send(&ws_tx, OutgoingMessage::conn_close(&conn_id, &e.to_string())).await;
                    break;
                }
            };
            if !send(&ws_tx, msg).await {
                break;
            }
        }
    };

    // Relay -> consumer
    let inbound = async {
        while let Some(data) = incoming.recv().await {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::pin!(outbound);
    let consumer_closed = tokio::select! {
        _ = &mut outbound => true,
        _ = inbound => false,
    };
    if !consumer_closed {
        outbound.await;
    }

    debug!("Connection {} finished", conn_id);
    conn_id.clone()
}

async fn send(ws_tx: &mpsc::Sender<Message>, msg: OutgoingMessage) -> bool {
    match msg.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    }
}
