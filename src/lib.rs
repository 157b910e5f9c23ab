//! tunl client library
//!
//! Opens a tunnel on a tunl relay and exposes it as a listener: the relay
//! allocates a public address and every connection made to it shows up
//! through [`Tunnel::accept`]. Reconnects after connection loss happen in
//! the background, preserving the tunnel's identity.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod config;
pub mod error;
pub mod forward;
pub mod protocol;
pub mod relay;
pub mod tunnel;

pub use error::{is_closed, Result, TunnelError};
pub use tunnel::{
    open, open_http, open_tcp, open_with, BoxedStream, ReconnectPolicy, Tunnel, TunnelOptions,
    TunnelType,
};
