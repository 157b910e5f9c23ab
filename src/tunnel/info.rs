//! Descriptors exchanged while setting up a tunnel.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::{Result, TunnelError};
use crate::protocol::TunnelId;

/// Kind of public endpoint the relay allocates. Fixed for the tunnel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Tcp,
    Http,
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::Tcp => write!(f, "tcp"),
            TunnelType::Http => write!(f, "http"),
        }
    }
}

/// Connection parameters for the relay, resolved once from the host URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub hostname: String,
    pub port: u16,
    pub secure: bool,
    pub control_url: Url,
}

impl ServerInfo {
    pub fn parse(host: &str) -> Result<Self> {
        let url = Url::parse(host)?;
        Self::from_host_url(&url)
    }

    /// Resolves a relay host URL such as `https://_.tunl.es`.
    ///
    /// `http`/`ws` map to a plain WebSocket control channel, `https`/`wss`
    /// to a TLS one. Fails without touching the network when the hostname
    /// is empty or the scheme is unknown.
    pub fn from_host_url(host: &Url) -> Result<Self> {
        let hostname = host.host_str().unwrap_or_default();
        if hostname.is_empty() {
            return Err(TunnelError::InvalidHost(format!(
                "hostname cannot be empty: {}",
                host
            )));
        }

        let secure = match host.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            other => {
                return Err(TunnelError::InvalidHost(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };

        let port = host
            .port()
            .unwrap_or(if secure { 443 } else { 80 });
        let scheme = if secure { "wss" } else { "ws" };
        let control_url = Url::parse(&format!("{}://{}:{}/tunnel/ws", scheme, hostname, port))?;

        Ok(Self {
            hostname: hostname.to_string(),
            port,
            secure,
            control_url,
        })
    }
}

/// What the relay hands back after a successful handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: TunnelId,
    pub token: String,
    pub address: String,
    pub version: Option<Version>,
}

impl TunnelInfo {
    /// Parses a relay-reported version, ignoring anything that isn't semver.
    pub fn parse_version(raw: Option<&str>) -> Option<Version> {
        let raw = raw?.trim();
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        match Version::parse(raw) {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::warn!("Ignoring unparsable relay version {:?}: {}", raw, e);
                None
            }
        }
    }
}
