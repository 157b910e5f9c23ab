//! Tunnel lifecycle and the listener-shaped facade over it.
//!
//! [`open`] performs the first handshake synchronously, then hands the
//! state machine to a background driver task. Consumers only ever see a
//! [`Tunnel`]: they call [`Tunnel::accept`] in a loop, exactly like a
//! listener, and never notice reconnects happening underneath.

mod backoff;
mod handoff;
mod info;
mod notify;
mod state;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use backoff::ReconnectPolicy;
pub use info::{ServerInfo, TunnelInfo, TunnelType};
pub use notify::{Announcements, Notifications, Notifier};
pub use state::{Connect, Disconnected, Reconnect, Running, State, TunnelContext};
pub use transport::{AsyncStream, BoxedStream, Session, Transport};

use semver::Version;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};
use url::Url;

use crate::error::{Result, TunnelError};
use crate::relay::RelayTransport;
use self::handoff::{handoff, Taker};

const STATUS_CAPACITY: usize = 10;
const VERSION_WAIT: Duration = Duration::from_secs(1);

/// Knobs for [`open_with`].
#[derive(Clone, Default)]
pub struct TunnelOptions {
    pub policy: ReconnectPolicy,
    /// Defaults to the WebSocket relay transport
    pub transport: Option<Arc<dyn Transport>>,
}

/// Termination state shared by the driver and every facade handle.
#[derive(Default)]
struct Shared {
    terminal: OnceLock<Arc<TunnelError>>,
    done: CancellationToken,
    close_requested: AtomicBool,
}

impl Shared {
    fn fail(&self, err: TunnelError) {
        let _ = self.terminal.set(Arc::new(err));
        self.done.cancel();
    }

    fn terminal_error(&self) -> Arc<TunnelError> {
        self.terminal
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(TunnelError::Closed))
    }
}

/// A public address that behaves like a local listener.
///
/// Cheap to clone; all clones share the same underlying tunnel, so
/// `accept` may be called from several tasks at once. Each connection is
/// delivered to exactly one caller.
#[derive(Clone)]
pub struct Tunnel {
    kind: TunnelType,
    accepted: Taker<BoxedStream>,
    info: watch::Receiver<TunnelInfo>,
    changes: Notifications<String>,
    versions: Announcements<Version>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Waits for the next public connection.
    ///
    /// The tunnel only pulls a connection off the relay once a caller is
    /// waiting here. Once the tunnel has terminated every call returns the
    /// same [`TunnelError::Terminated`] error.
    pub async fn accept(&self) -> Result<BoxedStream> {
        tokio::select! {
            biased;
            _ = self.shared.done.cancelled() => {}
            conn = self.accepted.take() => {
                if let Some(conn) = conn {
                    return Ok(conn);
                }
                // Bridge closed; the driver publishes its error right after.
                self.shared.done.cancelled().await;
            }
        }

        Err(TunnelError::Terminated(self.shared.terminal_error()))
    }

    /// Stops the tunnel: the driver aborts its current phase, drops the
    /// relay connection and every pending or future `accept` fails with
    /// [`TunnelError::Closed`]. Idempotent.
    pub fn close(&self) {
        self.shared.close_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Most recently assigned public address.
    pub fn address(&self) -> String {
        self.info.borrow().address.clone()
    }

    /// Tunnel identifier issued by the relay. Stable across reconnects.
    pub fn id(&self) -> String {
        self.info.borrow().id.to_string()
    }

    pub fn kind(&self) -> TunnelType {
        self.kind
    }

    /// Human readable phase labels. Lossy under backpressure.
    pub fn state_changes(&self) -> Notifications<String> {
        self.changes.clone()
    }

    /// Protocol versions announced by the relay. An announcement that no
    /// observer is waiting for within a second is dropped.
    pub fn new_versions(&self) -> Announcements<Version> {
        self.versions.clone()
    }

    /// The error that terminated the tunnel, if it has terminated.
    pub fn terminal_error(&self) -> Option<Arc<TunnelError>> {
        self.shared.terminal.get().cloned()
    }

    /// Resolves once the tunnel has terminated.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("kind", &self.kind)
            .field("address", &self.address())
            .field("terminated", &self.shared.done.is_cancelled())
            .finish()
    }
}

pub async fn open_tcp(cancel: &CancellationToken, host: &Url) -> Result<Tunnel> {
    open(cancel, host, TunnelType::Tcp).await
}

pub async fn open_http(cancel: &CancellationToken, host: &Url) -> Result<Tunnel> {
    open(cancel, host, TunnelType::Http).await
}

pub async fn open(cancel: &CancellationToken, host: &Url, kind: TunnelType) -> Result<Tunnel> {
    open_with(cancel, host, kind, TunnelOptions::default()).await
}

/// Opens a tunnel of `kind` on the relay at `host`.
///
/// The first handshake runs before this returns; its failure is returned
/// directly and no background task is left behind. Afterwards the tunnel
/// reconnects on its own until it fails fatally, `cancel` fires or
/// [`Tunnel::close`] is called. The driver logs inside a `tunnel` span
/// parented to the caller's current span.
pub async fn open_with(
    cancel: &CancellationToken,
    host: &Url,
    kind: TunnelType,
    options: TunnelOptions,
) -> Result<Tunnel> {
    let server = ServerInfo::from_host_url(host)?;
    let transport = options
        .transport
        .unwrap_or_else(|| Arc::new(RelayTransport::default()));

    let span = info_span!("tunnel", kind = %kind, host = %server.hostname);

    let (bridge_tx, bridge_rx) = handoff();
    let (info_tx, info_rx) = watch::channel(TunnelInfo::default());
    let (notifier, changes, versions) = Notifier::channels(STATUS_CAPACITY, VERSION_WAIT);

    let ctx = Arc::new(TunnelContext {
        transport,
        server,
        kind,
        policy: options.policy,
        bridge: bridge_tx,
        info: info_tx,
        notifier: notifier.clone(),
    });

    let cancel = cancel.child_token();
    let state = State::Connect(Connect::new(ctx))
        .run(&cancel)
        .instrument(span.clone())
        .await?;

    let shared = Arc::new(Shared::default());
    tokio::spawn(
        drive(state, shared.clone(), notifier, cancel.clone()).instrument(span),
    );

    Ok(Tunnel {
        kind,
        accepted: bridge_rx,
        info: info_rx,
        changes,
        versions,
        shared,
        cancel,
    })
}

/// Advances the state machine until a phase fails fatally.
async fn drive(
    mut state: State,
    shared: Arc<Shared>,
    notifier: Notifier,
    cancel: CancellationToken,
) {
    loop {
        match state.run(&cancel).await {
            Ok(next) => {
                state = next;
                debug!("Tunnel state: {}", state);
                notifier.publish_status(&state.to_string());
            }
            Err(e) => {
                let e = match e {
                    TunnelError::Cancelled if shared.close_requested.load(Ordering::SeqCst) => {
                        TunnelError::Closed
                    }
                    e => e,
                };
                error!("Tunnel terminated: {}", e);
                shared.fail(e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedTransport, Step};
    use super::*;
    use crate::error::is_closed;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::assert_ok;

    fn fast_options(transport: &ScriptedTransport) -> TunnelOptions {
        TunnelOptions {
            policy: ReconnectPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                max_attempts: None,
            },
            transport: Some(Arc::new(transport.clone())),
        }
    }

    fn host() -> Url {
        Url::parse("https://_.tunl.test").unwrap()
    }

    async fn open_scripted(transport: &ScriptedTransport) -> Tunnel {
        open_with(
            &CancellationToken::new(),
            &host(),
            TunnelType::Http,
            fast_options(transport),
        )
        .await
        .unwrap()
    }

    async fn wait_for_status(tunnel: &Tunnel, prefix: &str) {
        let changes = tunnel.state_changes();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(status) = changes.recv().await {
                if status.starts_with(prefix) {
                    return;
                }
            }
            panic!("status stream ended before {:?}", prefix);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_address_available_after_open() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));

        let tunnel = open_scripted(&transport).await;

        assert_eq!(tunnel.address(), "https://t1.tunl.test");
        assert_eq!(tunnel.id(), "t1");
        assert_eq!(tunnel.kind(), TunnelType::Http);
        assert!(tunnel.terminal_error().is_none());
    }

    #[tokio::test]
    async fn test_setup_error_is_synchronous() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::fail(TunnelError::Connect("refused".into())));

        let result = open_with(
            &CancellationToken::new(),
            &host(),
            TunnelType::Tcp,
            fast_options(&transport),
        )
        .await;

        assert!(matches!(result, Err(TunnelError::Connect(_))));
        assert_eq!(transport.connect_calls(), 1);
        assert!(transport.reconnect_calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_hostname_fails_before_network() {
        let transport = ScriptedTransport::new();
        let host = Url::parse("unix:/run/relay.sock").unwrap();

        let result = open_with(
            &CancellationToken::new(),
            &host,
            TunnelType::Http,
            fast_options(&transport),
        )
        .await;

        assert!(matches!(result, Err(TunnelError::InvalidHost(_))));
        assert_eq!(transport.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_accept_delivers_public_connections() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let tunnel = open_scripted(&transport).await;
        let feed = transport.next_feed().await;

        let (mut public, tunneled) = tokio::io::duplex(64);
        feed.send(Ok(Box::new(tunneled))).await.unwrap();

        let mut conn = assert_ok!(tunnel.accept().await);
        public.write_all(b"GET /").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");
    }

    #[tokio::test]
    async fn test_remote_close_reconnects_without_accept_error() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        transport.push_reconnect(Step::fail(TunnelError::Connect("refused".into())));
        transport.push_reconnect(Step::fail(TunnelError::Connect("refused".into())));
        transport.push_reconnect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let tunnel = open_scripted(&transport).await;

        // Relay drops the first session.
        drop(transport.next_feed().await);
        let feed = transport.next_feed().await;

        let (_public, tunneled) = tokio::io::duplex(64);
        feed.send(Ok(Box::new(tunneled))).await.unwrap();
        assert_ok!(tunnel.accept().await);

        let calls = transport.reconnect_calls();
        assert_eq!(calls.len(), 3);
        for call in calls {
            assert_eq!(call.id.to_string(), "t1");
            assert_eq!(call.token, "tok");
        }
        assert!(tunnel.terminal_error().is_none());
    }

    #[tokio::test]
    async fn test_status_labels_follow_transitions() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        transport.push_reconnect(Step::fail(TunnelError::Connect("refused".into())));
        transport.push_reconnect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let tunnel = open_scripted(&transport).await;

        drop(transport.next_feed().await);
        let _feed = transport.next_feed().await;

        let changes = tunnel.state_changes();
        let mut seen = Vec::new();
        while seen.len() < 4 {
            let status = tokio::time::timeout(Duration::from_secs(5), changes.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(status);
        }

        assert!(seen[0].starts_with("disconnected"));
        assert_eq!(seen[1], "reconnecting (attempt 1)");
        assert_eq!(seen[2], "reconnecting (attempt 2)");
        assert_eq!(seen[3], "connected");
    }

    #[tokio::test]
    async fn test_attempts_restart_after_recovery() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        transport.push_reconnect(Step::fail(TunnelError::Connect("refused".into())));
        transport.push_reconnect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        transport.push_reconnect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let tunnel = open_scripted(&transport).await;

        drop(transport.next_feed().await);
        drop(transport.next_feed().await);
        let _feed = transport.next_feed().await;

        let changes = tunnel.state_changes();
        let mut seen = Vec::new();
        while seen.len() < 7 {
            let status = tokio::time::timeout(Duration::from_secs(5), changes.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(status);
        }

        assert!(seen[0].starts_with("disconnected"));
        assert_eq!(seen[1], "reconnecting (attempt 1)");
        assert_eq!(seen[2], "reconnecting (attempt 2)");
        assert_eq!(seen[3], "connected");
        assert!(seen[4].starts_with("disconnected"));
        assert_eq!(seen[5], "reconnecting (attempt 1)");
        assert_eq!(seen[6], "connected");
    }

    #[tokio::test]
    async fn test_unaccepted_connection_holds_off_reconnect() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        transport.push_reconnect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let tunnel = open_scripted(&transport).await;

        // One public connection arrives, then the relay drops the session.
        let feed = transport.next_feed().await;
        let (mut public, tunneled) = tokio::io::duplex(64);
        feed.send(Ok(Box::new(tunneled))).await.unwrap();
        drop(feed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.reconnect_calls().is_empty());

        let mut conn = assert_ok!(tunnel.accept().await);
        public.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        wait_for_status(&tunnel, "connected").await;
        assert_eq!(transport.reconnect_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_late_version_observer_sees_nothing_stale() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready_with_version(
            "t1",
            "tok",
            "https://t1.tunl.test",
            Version::new(1, 0, 0),
        ));
        transport.push_reconnect(Step::ready_with_version(
            "t1",
            "tok",
            "https://t1.tunl.test",
            Version::new(2, 0, 0),
        ));
        let tunnel = open_scripted(&transport).await;
        let feed = transport.next_feed().await;

        // Nobody listens while the announcement window passes.
        tokio::time::sleep(VERSION_WAIT + Duration::from_millis(200)).await;
        let versions = tunnel.new_versions();
        let late = tokio::time::timeout(Duration::from_millis(100), versions.recv()).await;
        assert!(late.is_err());

        let observer = tokio::spawn(async move {
            tokio::time::timeout(Duration::from_secs(5), versions.recv()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(feed);

        assert_eq!(observer.await.unwrap().unwrap(), Some(Version::new(2, 0, 0)));
    }

    #[tokio::test]
    async fn test_unread_status_channel_never_stalls() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        // Far more transitions than the status channel can hold.
        for _ in 0..(STATUS_CAPACITY * 3) {
            transport.push_reconnect(Step::fail(TunnelError::Connect("refused".into())));
        }
        transport.push_reconnect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let options = TunnelOptions {
            policy: ReconnectPolicy {
                initial_backoff: Duration::from_micros(1),
                max_backoff: Duration::from_micros(10),
                max_attempts: None,
            },
            transport: Some(Arc::new(transport.clone())),
        };
        let tunnel = open_with(&CancellationToken::new(), &host(), TunnelType::Http, options)
            .await
            .unwrap();

        drop(transport.next_feed().await);
        let feed = transport.next_feed().await;

        let (_public, tunneled) = tokio::io::duplex(64);
        feed.send(Ok(Box::new(tunneled))).await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(5), tunnel.accept()).await;
        assert_ok!(accepted.unwrap());
    }

    #[tokio::test]
    async fn test_fatal_error_is_repeated() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        transport.push_reconnect(Step::fail(TunnelError::Rejected {
            code: "expired".into(),
            message: "token expired".into(),
        }));
        let tunnel = open_scripted(&transport).await;

        drop(transport.next_feed().await);

        let first = tokio::time::timeout(Duration::from_secs(5), tunnel.accept())
            .await
            .unwrap();
        let first = match first {
            Err(TunnelError::Terminated(inner)) => inner,
            other => panic!("expected terminated, got {:?}", other.map(|_| ())),
        };
        assert!(matches!(*first, TunnelError::Rejected { .. }));

        for _ in 0..3 {
            match tunnel.accept().await {
                Err(TunnelError::Terminated(again)) => assert!(Arc::ptr_eq(&first, &again)),
                other => panic!("expected terminated, got {:?}", other.map(|_| ())),
            }
        }
        assert!(tunnel.terminal_error().is_some());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let tunnel = open_scripted(&transport).await;
        let _feed = transport.next_feed().await;

        let waiter = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tunnel.close();
        tunnel.close();

        match waiter.await.unwrap() {
            Err(e) => assert!(is_closed(&e)),
            Ok(_) => panic!("accept succeeded after close"),
        }
        match tunnel.accept().await {
            Err(e) => assert!(is_closed(&e)),
            Ok(_) => panic!("accept succeeded after close"),
        }
    }

    #[tokio::test]
    async fn test_parent_cancel_terminates() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let parent = CancellationToken::new();
        let tunnel = open_with(&parent, &host(), TunnelType::Tcp, fast_options(&transport))
            .await
            .unwrap();
        let _feed = transport.next_feed().await;

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
            .await
            .unwrap();

        match tunnel.accept().await {
            Err(TunnelError::Terminated(inner)) => {
                assert!(matches!(*inner, TunnelError::Cancelled))
            }
            other => panic!("expected terminated, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_concurrent_accepts_get_distinct_connections() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let tunnel = open_scripted(&transport).await;
        let feed = transport.next_feed().await;

        let spawn_accept = |tunnel: Tunnel| {
            tokio::spawn(async move {
                let mut conn = tunnel.accept().await.unwrap();
                let mut tag = [0u8; 1];
                conn.read_exact(&mut tag).await.unwrap();
                tag[0]
            })
        };
        let a = spawn_accept(tunnel.clone());
        let b = spawn_accept(tunnel.clone());

        let mut publics = Vec::new();
        for tag in [b'a', b'b'] {
            let (mut public, tunneled) = tokio::io::duplex(64);
            public.write_all(&[tag]).await.unwrap();
            publics.push(public);
            feed.send(Ok(Box::new(tunneled))).await.unwrap();
        }

        let mut tags = vec![a.await.unwrap(), b.await.unwrap()];
        tags.sort();
        assert_eq!(tags, vec![b'a', b'b']);
    }

    #[tokio::test]
    async fn test_version_announced_on_connect() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready_with_version(
            "t1",
            "tok",
            "https://t1.tunl.test",
            Version::new(1, 4, 0),
        ));
        let tunnel = open_scripted(&transport).await;

        let version = tokio::time::timeout(Duration::from_secs(2), tunnel.new_versions().recv())
            .await
            .unwrap();
        assert_eq!(version, Some(Version::new(1, 4, 0)));
    }

    #[tokio::test]
    async fn test_status_reports_reconnect() {
        let transport = ScriptedTransport::new();
        transport.push_connect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        transport.push_reconnect(Step::ready("t1", "tok", "https://t1.tunl.test"));
        let tunnel = open_scripted(&transport).await;

        drop(transport.next_feed().await);
        wait_for_status(&tunnel, "connected").await;
    }
}
