//! Socket-level keepalive tuning
//!
//! Device connections sit idle behind NAT for long stretches, so their
//! sockets get aggressive TCP keepalive: with idle 30s, interval 10s and
//! 3 probes a dead connection is detected in about a minute.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
#[cfg(target_os = "linux")]
use tracing::debug;

/// Configure TCP keepalive on a connection.
///
/// `idle` is the time before the first probe, `interval` the time between
/// probes and `count` the number of probes before the connection is
/// considered dead. On Linux, `TCP_USER_TIMEOUT` is additionally set to
/// `idle + interval * count` so unacknowledged writes fail in the same
/// window.
pub fn set_tcp_keepalive(
    stream: &TcpStream,
    idle: Duration,
    interval: Duration,
    count: u32,
) -> io::Result<()> {
    let sock_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new().with_time(idle);
    #[cfg(target_os = "linux")]
    let keepalive = keepalive.with_interval(interval).with_retries(count);

    sock_ref.set_tcp_keepalive(&keepalive)?;

    #[cfg(target_os = "linux")]
    {
        let user_timeout = idle + interval * count;
        if let Err(e) = sock_ref.set_tcp_user_timeout(Some(user_timeout)) {
            debug!("failed to set TCP_USER_TIMEOUT: {}", e);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (interval, count);

    Ok(())
}
