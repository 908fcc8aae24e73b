//! Bidirectional session bridge
//!
//! Two concurrent byte-copy loops plus a keepalive loop that injects a
//! Telnet NOP into whichever side has gone idle. The bridged bytes are
//! never interpreted.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{unix_now, Session};
use crate::constants::{buffer, telnet, timeout};
use crate::transport::Transport;

/// Bridges a session's two transports until one side goes away
pub struct Bridge {
    session: Arc<Session>,
}

impl Bridge {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        let now = unix_now();
        session.last_client_active.store(now, Ordering::Relaxed);
        session.last_device_active.store(now, Ordering::Relaxed);
        Self { session }
    }

    /// Run the bidirectional transfer. Blocks until one copy direction
    /// finishes or the session's completion signal fires, then closes both
    /// transports and joins every loop. Byte counters are final afterwards.
    pub async fn run(&self) {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

        let client_to_device = {
            let session = self.session.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                let n = copy_with_activity(&session, Direction::ClientToDevice).await;
                debug!("{}: client->device total: {} bytes", session.id(), n);
                let _ = done.send(()).await;
            })
        };

        let device_to_client = {
            let session = self.session.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                let n = copy_with_activity(&session, Direction::DeviceToClient).await;
                debug!("{}: device->client total: {} bytes", session.id(), n);
                let _ = done.send(()).await;
            })
        };
        drop(done_tx);

        let stop_keepalive = CancellationToken::new();
        let keepalive = {
            let session = self.session.clone();
            let stop = stop_keepalive.clone();
            tokio::spawn(async move { keepalive(&session, stop).await })
        };

        // Wait for either direction to finish or an explicit end
        tokio::select! {
            _ = done_rx.recv() => {}
            _ = self.session.done.cancelled() => {}
        }

        stop_keepalive.cancel();

        // Close both transports so any still-running copy loop unblocks
        self.session.client.close();
        self.session.device.close();

        let _ = client_to_device.await;
        let _ = device_to_client.await;
        let _ = keepalive.await;

        debug!(
            "{}: closed (in={}, out={})",
            self.session.id(),
            self.session.bytes_in(),
            self.session.bytes_out()
        );
    }
}

#[derive(Clone, Copy)]
enum Direction {
    ClientToDevice,
    DeviceToClient,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Self::ClientToDevice => "client->device",
            Self::DeviceToClient => "device->client",
        }
    }
}

/// Copy bytes from one side to the other, counting written bytes and
/// stamping the source side's activity. The source's read lock is held for
/// the whole loop so no other task can consume session bytes. A short
/// write before an error still counts the bytes that made it through.
async fn copy_with_activity(session: &Session, direction: Direction) -> u64 {
    let (src, dst, counter, last_active): (&Transport, &Transport, &AtomicU64, &AtomicI64) =
        match direction {
            Direction::ClientToDevice => (
                &*session.client,
                &*session.device,
                &session.bytes_in,
                &session.last_client_active,
            ),
            Direction::DeviceToClient => (
                &*session.device,
                &*session.client,
                &session.bytes_out,
                &session.last_device_active,
            ),
        };

    let mut buf = vec![0u8; buffer::BRIDGE_SIZE];
    let mut total: u64 = 0;
    let mut reader = src.lock_reader().await;

    loop {
        let n = tokio::select! {
            _ = src.closed() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("{} {}: read error: {}", session.id(), direction.label(), e);
                    break;
                }
            },
        };

        last_active.store(unix_now(), Ordering::Relaxed);

        if session.debug {
            debug!(
                "{} {}: {} bytes: {:02x?}",
                session.id(),
                direction.label(),
                n,
                &buf[..n]
            );
        }

        let mut offset = 0;
        let mut write_failed = false;
        while offset < n {
            match dst.write(&buf[offset..n]).await {
                Ok(0) => {
                    write_failed = true;
                    break;
                }
                Ok(written) => {
                    counter.fetch_add(written as u64, Ordering::Relaxed);
                    total += written as u64;
                    offset += written;
                }
                Err(e) => {
                    debug!("{} {}: write error: {}", session.id(), direction.label(), e);
                    write_failed = true;
                    break;
                }
            }
        }
        if write_failed {
            break;
        }
    }

    total
}

/// Tick at half the idle timeout; for each side independently, write a NOP
/// once it has been idle for the full timeout. NOP traffic does not update
/// the activity stamps, so a side only receiving NOPs still counts as idle.
async fn keepalive(session: &Session, stop: CancellationToken) {
    if session.idle_timeout.is_zero() {
        return;
    }

    let period = session.idle_timeout / 2;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let idle_secs = session.idle_timeout.as_secs() as i64;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                let now = unix_now();

                let client_idle = now - session.last_client_active.load(Ordering::Relaxed);
                if client_idle >= idle_secs {
                    if let Err(e) = session
                        .client
                        .write_all_timeout(telnet::NOP, timeout::NOP_WRITE)
                        .await
                    {
                        debug!("{}: client keepalive failed: {}", session.id(), e);
                        session.client.close();
                        return;
                    }
                    if session.debug {
                        debug!("{}: sent NOP to client (idle {}s)", session.id(), client_idle);
                    }
                }

                let device_idle = now - session.last_device_active.load(Ordering::Relaxed);
                if device_idle >= idle_secs {
                    if let Err(e) = session
                        .device
                        .write_all_timeout(telnet::NOP, timeout::NOP_WRITE)
                        .await
                    {
                        debug!("{}: device keepalive failed: {}", session.id(), e);
                        session.device.close();
                        return;
                    }
                    if session.debug {
                        debug!("{}: sent NOP to device (idle {}s)", session.id(), device_idle);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Manager;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    async fn transport_pair() -> (Arc<Transport>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let peer = TcpStream::connect(addr).await.expect("connect");
        let (stream, peer_addr) = listener.accept().await.expect("accept");
        let (read_half, write_half) = stream.into_split();
        (
            Arc::new(Transport::new(
                BufReader::new(read_half),
                write_half,
                peer_addr,
            )),
            peer,
        )
    }

    #[tokio::test]
    async fn test_bridge_copies_both_directions() {
        let manager = Manager::new(false, Duration::ZERO);
        let (client, mut client_peer) = transport_pair().await;
        let (device, mut device_peer) = transport_pair().await;
        let session = manager.create("dev1", client, device);

        let bridge_session = session.clone();
        let bridge = tokio::spawn(async move { Bridge::new(bridge_session).run().await });

        client_peer.write_all(b"Hello").await.expect("client write");
        let mut buf = [0u8; 5];
        device_peer.read_exact(&mut buf).await.expect("device read");
        assert_eq!(&buf, b"Hello");

        device_peer.write_all(b"World").await.expect("device write");
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.expect("client read");
        assert_eq!(&buf, b"World");

        // Closing the client side ends the whole session
        drop(client_peer);
        bridge.await.expect("bridge join");

        assert_eq!(session.bytes_in(), 5);
        assert_eq!(session.bytes_out(), 5);
    }

    #[tokio::test]
    async fn test_completion_signal_ends_bridge() {
        let manager = Manager::new(false, Duration::ZERO);
        let (client, _client_peer) = transport_pair().await;
        let (device, _device_peer) = transport_pair().await;
        let session = manager.create("dev1", client.clone(), device.clone());

        let bridge_session = session.clone();
        let bridge = tokio::spawn(async move { Bridge::new(bridge_session).run().await });

        manager.end(session.id());
        tokio::time::timeout(Duration::from_secs(2), bridge)
            .await
            .expect("bridge exits on completion signal")
            .expect("join");

        assert!(client.is_closed());
        assert!(device.is_closed());
    }

    #[tokio::test]
    async fn test_idle_keepalive_sends_nop_to_both_sides() {
        let manager = Manager::new(false, Duration::from_secs(1));
        let (client, mut client_peer) = transport_pair().await;
        let (device, mut device_peer) = transport_pair().await;
        let session = manager.create("dev1", client, device);

        let bridge_session = session.clone();
        let bridge = tokio::spawn(async move { Bridge::new(bridge_session).run().await });

        // No data flows; after the idle timeout both sides receive IAC NOP
        let mut buf = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(3), client_peer.read_exact(&mut buf))
            .await
            .expect("client NOP in time")
            .expect("client read");
        assert_eq!(&buf, &[0xFF, 0xF1]);

        tokio::time::timeout(Duration::from_secs(3), device_peer.read_exact(&mut buf))
            .await
            .expect("device NOP in time")
            .expect("device read");
        assert_eq!(&buf, &[0xFF, 0xF1]);

        // NOPs do not count as user traffic
        assert_eq!(session.bytes_in(), 0);
        assert_eq!(session.bytes_out(), 0);

        manager.end(session.id());
        let _ = bridge.await;
    }

    #[tokio::test]
    async fn test_terminate_forces_bridge_out() {
        let manager = Manager::new(false, Duration::ZERO);
        let (client, _client_peer) = transport_pair().await;
        let (device, _device_peer) = transport_pair().await;
        let session = manager.create("dev1", client, device);

        let bridge_session = session.clone();
        let bridge = tokio::spawn(async move { Bridge::new(bridge_session).run().await });

        assert!(manager.terminate(session.id()));
        tokio::time::timeout(Duration::from_secs(2), bridge)
            .await
            .expect("bridge exits on terminate")
            .expect("join");

        manager.end(session.id());
        assert!(!manager.terminate(session.id()));
    }
}
