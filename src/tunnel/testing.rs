//! In-memory transport driven by a script, for exercising the lifecycle
//! without a relay.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::backoff::ReconnectPolicy;
use super::handoff::{handoff, Taker};
use super::notify::Notifier;
use super::state::TunnelContext;
use super::transport::{BoxedStream, Session, Transport};
use super::{ServerInfo, TunnelInfo, TunnelType};
use crate::error::{Result, TunnelError};

/// Sending `Err` (or dropping the feed) ends the session like a remote close.
pub(crate) type Feed = mpsc::Sender<Result<BoxedStream>>;

pub(crate) enum Step {
    Ready(TunnelInfo),
    Fail(TunnelError),
}

impl Step {
    pub(crate) fn ready(id: &str, token: &str, address: &str) -> Self {
        Step::Ready(TunnelInfo {
            id: id.into(),
            token: token.to_string(),
            address: address.to_string(),
            version: None,
        })
    }

    pub(crate) fn ready_with_version(
        id: &str,
        token: &str,
        address: &str,
        version: semver::Version,
    ) -> Self {
        match Step::ready(id, token, address) {
            Step::Ready(info) => Step::Ready(TunnelInfo {
                version: Some(version),
                ..info
            }),
            step => step,
        }
    }

    pub(crate) fn fail(err: TunnelError) -> Self {
        Step::Fail(err)
    }
}

#[derive(Default)]
struct Script {
    connects: VecDeque<Step>,
    reconnects: VecDeque<Step>,
    reconnect_calls: Vec<TunnelInfo>,
    connect_calls: usize,
}

#[derive(Clone)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    feeds_tx: mpsc::UnboundedSender<Feed>,
    feeds_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Feed>>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        let (feeds_tx, feeds_rx) = mpsc::unbounded_channel();
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            feeds_tx,
            feeds_rx: Arc::new(tokio::sync::Mutex::new(feeds_rx)),
        }
    }

    pub(crate) fn push_connect(&self, step: Step) {
        self.script.lock().unwrap().connects.push_back(step);
    }

    pub(crate) fn push_reconnect(&self, step: Step) {
        self.script.lock().unwrap().reconnects.push_back(step);
    }

    pub(crate) fn reconnect_calls(&self) -> Vec<TunnelInfo> {
        self.script.lock().unwrap().reconnect_calls.clone()
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.script.lock().unwrap().connect_calls
    }

    /// A standalone session plus the feed that controls it.
    pub(crate) fn session(&self) -> (Box<dyn Session>, Feed) {
        let (tx, rx) = mpsc::channel(8);
        (Box::new(ScriptedSession { rx }), tx)
    }

    /// Feed of the next session handed out by a successful handshake.
    pub(crate) async fn next_feed(&self) -> Feed {
        let mut feeds = self.feeds_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), feeds.recv())
            .await
            .expect("no session was established")
            .expect("feed channel closed")
    }

    fn play(&self, step: Option<Step>) -> Result<(TunnelInfo, Box<dyn Session>)> {
        match step {
            Some(Step::Ready(info)) => {
                let (session, feed) = self.session();
                let _ = self.feeds_tx.send(feed);
                Ok((info, session))
            }
            Some(Step::Fail(err)) => Err(err),
            None => Err(TunnelError::Connect("relay unreachable".to_string())),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        _server: &ServerInfo,
        _kind: TunnelType,
    ) -> Result<(TunnelInfo, Box<dyn Session>)> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.connect_calls += 1;
            script.connects.pop_front()
        };
        self.play(step)
    }

    async fn reconnect(
        &self,
        _server: &ServerInfo,
        _kind: TunnelType,
        tunnel: &TunnelInfo,
    ) -> Result<(TunnelInfo, Box<dyn Session>)> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.reconnect_calls.push(tunnel.clone());
            script.reconnects.pop_front()
        };
        self.play(step)
    }
}

struct ScriptedSession {
    rx: mpsc::Receiver<Result<BoxedStream>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn accept(&mut self) -> Result<BoxedStream> {
        match self.rx.recv().await {
            Some(next) => next,
            None => Err(TunnelError::ConnectionLost("closed by relay".to_string())),
        }
    }
}

pub(crate) fn context(
    transport: ScriptedTransport,
    policy: ReconnectPolicy,
) -> (
    Arc<TunnelContext>,
    Taker<BoxedStream>,
    watch::Receiver<TunnelInfo>,
) {
    let (bridge_tx, bridge_rx) = handoff();
    let (info_tx, info_rx) = watch::channel(TunnelInfo::default());
    let (notifier, _changes, _versions) = Notifier::channels(10, Duration::from_millis(10));

    let ctx = Arc::new(TunnelContext {
        transport: Arc::new(transport),
        server: ServerInfo::parse("http://relay.test").unwrap(),
        kind: TunnelType::Http,
        policy,
        bridge: bridge_tx,
        info: info_tx,
        notifier,
    });
    (ctx, bridge_rx, info_rx)
}
