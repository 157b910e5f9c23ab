//! Listener-side consumer: forwards every public connection to a local
//! TCP address.

use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

use crate::error::{is_closed, Result, TunnelError};
use crate::tunnel::{BoxedStream, Tunnel};

/// Accepts from `tunnel` until it terminates, forwarding each connection to
/// `target` (`host:port`) on its own task.
///
/// Returns `Ok(())` when the tunnel was closed by its owner and the
/// terminal error otherwise.
pub async fn serve(tunnel: &Tunnel, target: &str) -> Result<()> {
    loop {
        let inbound = match tunnel.accept().await {
            Ok(conn) => conn,
            Err(e) if is_closed(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        let target = target.to_string();
        tokio::spawn(async move {
            match forward(inbound, &target).await {
                Ok((up, down)) => debug!("{}: {} bytes up, {} bytes down", target, up, down),
                Err(e) => warn!("Forwarding to {} failed: {}", target, e),
            }
        });
    }
}

async fn forward(mut inbound: BoxedStream, target: &str) -> std::io::Result<(u64, u64)> {
    let mut outbound = TcpStream::connect(target).await?;
    tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
}

/// Normalizes the `http` command's target: `8080` and `:8080` become
/// `http://localhost:8080`, a missing scheme defaults to `http://`.
pub fn normalize_http_target(target: &str) -> String {
    if target.contains("://") {
        return target.to_string();
    }
    let target = target.strip_prefix(':').unwrap_or(target);
    if target.parse::<u16>().is_ok() {
        format!("http://localhost:{}", target)
    } else {
        format!("http://{}", target)
    }
}

/// `host:port` to dial for an http(s) target URL.
pub fn http_target_addr(target: &str) -> Result<String> {
    let url = Url::parse(target)?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TunnelError::InvalidHost(format!("target has no host: {}", target)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TunnelError::InvalidHost(format!("target has no port: {}", target)))?;
    Ok(format!("{}:{}", host, port))
}

/// Normalizes the `tcp` command's target: a bare port means localhost.
pub fn normalize_tcp_target(target: &str) -> String {
    let target = target.strip_prefix(':').unwrap_or(target);
    if target.parse::<u16>().is_ok() {
        format!("localhost:{}", target)
    } else {
        target.to_string()
    }
}
