//! Type-safe ID wrappers for protocol identifiers.
//!
//! These newtypes keep a tunnel identity from being passed where a
//! per-connection id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a tunnel allocated by the relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(pub String);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TunnelId {
    fn from(s: String) -> Self {
        TunnelId(s)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        TunnelId(s.to_string())
    }
}

/// Identifier of one public connection multiplexed over the control channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub String);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnId {
    fn from(s: String) -> Self {
        ConnId(s)
    }
}

impl From<&str> for ConnId {
    fn from(s: &str) -> Self {
        ConnId(s.to_string())
    }
}
