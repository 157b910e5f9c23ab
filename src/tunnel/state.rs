//! Tunnel lifecycle phases.
//!
//! Each phase owns what it needs to run and yields the next phase or a
//! fatal error. The chain never ends successfully: it runs until a phase
//! fails fatally.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::handoff::Giver;
use super::notify::Notifier;
use super::transport::{BoxedStream, Session, Transport};
use super::{ServerInfo, TunnelInfo, TunnelType};
use crate::error::{Result, TunnelError};

/// Everything the phases share: the relay they talk to, the bridge they
/// feed and the slot they publish handshake results to.
pub struct TunnelContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) server: ServerInfo,
    pub(crate) kind: TunnelType,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) bridge: Giver<BoxedStream>,
    pub(crate) info: watch::Sender<TunnelInfo>,
    pub(crate) notifier: Notifier,
}

impl TunnelContext {
    pub fn set_tunnel_info(&self, info: TunnelInfo) {
        let version = info.version.clone();
        self.info.send_replace(info);

        if let Some(version) = version {
            self.notifier.announce_version(version);
        }
    }
}

pub enum State {
    Connect(Connect),
    Running(Running),
    Disconnected(Disconnected),
    Reconnect(Reconnect),
}

impl State {
    pub async fn run(self, cancel: &CancellationToken) -> Result<State> {
        match self {
            State::Connect(s) => s.run(cancel).await,
            State::Running(s) => s.run(cancel).await,
            State::Disconnected(s) => s.run(cancel).await,
            State::Reconnect(s) => s.run(cancel).await,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Connect(_) => write!(f, "connecting"),
            State::Running(_) => write!(f, "connected"),
            State::Disconnected(s) => write!(f, "disconnected: {}", s.last_error),
            State::Reconnect(s) => write!(f, "reconnecting (attempt {})", s.attempt + 1),
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State({})", self)
    }
}

/// Initial handshake. Its failure aborts tunnel creation.
pub struct Connect {
    ctx: Arc<TunnelContext>,
}

impl Connect {
    pub fn new(ctx: Arc<TunnelContext>) -> Self {
        Self { ctx }
    }

    async fn run(self, cancel: &CancellationToken) -> Result<State> {
        let ctx = self.ctx;
        debug!("Connecting to {}", ctx.server.control_url);

        let (info, session) = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            result = ctx.transport.connect(&ctx.server, ctx.kind) => result?,
        };

        info!("Tunnel {} ready at {}", info.id, info.address);
        ctx.set_tunnel_info(info.clone());

        Ok(State::Running(Running::new(session, info, ctx)))
    }
}

/// Healthy tunnel: hands every accepted public connection to the bridge.
pub struct Running {
    session: Box<dyn Session>,
    tunnel: TunnelInfo,
    ctx: Arc<TunnelContext>,
}

impl Running {
    pub fn new(session: Box<dyn Session>, tunnel: TunnelInfo, ctx: Arc<TunnelContext>) -> Self {
        Self {
            session,
            tunnel,
            ctx,
        }
    }

    async fn run(mut self, cancel: &CancellationToken) -> Result<State> {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                accepted = self.session.accept() => accepted,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Connection to relay lost: {}", e);
                    return Ok(State::Disconnected(Disconnected::new(
                        e,
                        self.tunnel,
                        self.ctx,
                    )));
                }
            };

            // The session is not read again until a consumer calls accept.
            tokio::select! {
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                given = self.ctx.bridge.give(conn) => {
                    if given.is_err() {
                        return Err(TunnelError::Closed);
                    }
                }
            }
        }
    }
}

/// Gap between a dropped connection and the first reconnect attempt.
pub struct Disconnected {
    last_error: TunnelError,
    tunnel: TunnelInfo,
    ctx: Arc<TunnelContext>,
}

impl Disconnected {
    pub fn new(last_error: TunnelError, tunnel: TunnelInfo, ctx: Arc<TunnelContext>) -> Self {
        Self {
            last_error,
            tunnel,
            ctx,
        }
    }

    async fn run(self, _cancel: &CancellationToken) -> Result<State> {
        Ok(State::Reconnect(Reconnect::new(
            self.ctx,
            self.tunnel,
            0,
            Some(Arc::new(self.last_error)),
        )))
    }
}

/// Re-attaches to the relay with the identity issued by the first handshake.
pub struct Reconnect {
    ctx: Arc<TunnelContext>,
    tunnel: TunnelInfo,
    attempt: u32,
    last_error: Option<Arc<TunnelError>>,
}

impl Reconnect {
    pub fn new(
        ctx: Arc<TunnelContext>,
        tunnel: TunnelInfo,
        attempt: u32,
        last_error: Option<Arc<TunnelError>>,
    ) -> Self {
        Self {
            ctx,
            tunnel,
            attempt,
            last_error,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn tunnel(&self) -> &TunnelInfo {
        &self.tunnel
    }

    pub fn last_error(&self) -> Option<&TunnelError> {
        self.last_error.as_deref()
    }

    async fn run(self, cancel: &CancellationToken) -> Result<State> {
        let policy = &self.ctx.policy;
        if policy.exhausted(self.attempt) {
            return Err(TunnelError::ReconnectExhausted {
                attempts: self.attempt,
            });
        }

        let delay = policy.delay(self.attempt);
        if !delay.is_zero() {
            debug!(
                "Waiting {:?} before reconnect attempt {}",
                delay,
                self.attempt + 1
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let ctx = &self.ctx;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            result = ctx.transport.reconnect(&ctx.server, ctx.kind, &self.tunnel) => result,
        };

        match result {
            Ok((info, session)) => {
                info!(
                    "Reconnected tunnel {} after {} attempt(s)",
                    self.tunnel.id,
                    self.attempt + 1
                );
                // The identity is never renegotiated, only the address and
                // version may move.
                let address = if info.address.is_empty() {
                    self.tunnel.address.clone()
                } else {
                    info.address
                };
                let current = TunnelInfo {
                    id: self.tunnel.id.clone(),
                    token: self.tunnel.token.clone(),
                    address,
                    version: info.version,
                };
                ctx.set_tunnel_info(current.clone());
                Ok(State::Running(Running::new(session, current, self.ctx)))
            }
            Err(e) if e.is_fatal_on_reconnect() => Err(e),
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", self.attempt + 1, e);
                Ok(State::Reconnect(Reconnect {
                    attempt: self.attempt + 1,
                    last_error: Some(Arc::new(e)),
                    ..self
                }))
            }
        }
    }
}
