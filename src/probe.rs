use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

/// Outcome of the bare TCP reachability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Open,
    ClosedOrUnreachable,
}

/// Try a plain TCP connect bounded by `timeout`.
///
/// Refusal, timeout, resolution failure and any other OS error all count as
/// `ClosedOrUnreachable`. There is no retry. The socket is dropped right away.
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> ProbeStatus {
    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => ProbeStatus::Open,
        Ok(Err(e)) => {
            trace!(host, port, error = %e, "probe connect failed");
            ProbeStatus::ClosedOrUnreachable
        }
        Err(_) => {
            trace!(host, port, "probe connect timed out");
            ProbeStatus::ClosedOrUnreachable
        }
    }
}
