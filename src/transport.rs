//! Shared connection transport
//!
//! A [`Transport`] wraps the two halves of an accepted TCP connection so
//! that several tasks can read, write and close it: the dispatcher owns it
//! first, then the registry entry (device side) or the bridge (both sides
//! during a session). Reads and writes are serialized through per-half
//! locks; a cancellation token makes `close` observable to every holder,
//! unblocking in-flight operations.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Buffered read half of a connection
pub type ConnReader = BufReader<OwnedReadHalf>;

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed")
}

fn timeout_err() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

/// A TCP connection shared between the dispatcher, the registry and the
/// bridge.
pub struct Transport {
    reader: Mutex<ConnReader>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: SocketAddr,
    closed: CancellationToken,
}

impl Transport {
    #[must_use]
    pub fn new(reader: ConnReader, writer: OwnedWriteHalf, peer_addr: SocketAddr) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer_addr,
            closed: CancellationToken::new(),
        }
    }

    /// Remote peer address (the upstream peer when PROXY protocol is in use)
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Mark the transport closed. Idempotent; wakes any blocked reads and
    /// writes, which fail from then on. The sockets are released when the
    /// last holder drops its reference.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the transport has been closed
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Read into `buf`, returning 0 at EOF. Fails once the transport is
    /// closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_err()),
            res = async {
                let mut reader = self.reader.lock().await;
                reader.read(buf).await
            } => res,
        }
    }

    /// Read with a deadline; expiry yields `ErrorKind::TimedOut`.
    pub async fn read_timeout(&self, buf: &mut [u8], deadline: Duration) -> io::Result<usize> {
        match tokio::time::timeout(deadline, self.read(buf)).await {
            Ok(res) => res,
            Err(_) => Err(timeout_err()),
        }
    }

    /// Single write call, which may be short. Returns the bytes accepted.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_err()),
            res = async {
                let mut writer = self.writer.lock().await;
                writer.write(buf).await
            } => res,
        }
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_err()),
            res = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(buf).await
            } => res,
        }
    }

    /// Write the whole buffer under a deadline; expiry yields
    /// `ErrorKind::TimedOut`.
    pub async fn write_all_timeout(&self, buf: &[u8], deadline: Duration) -> io::Result<()> {
        match tokio::time::timeout(deadline, self.write_all(buf)).await {
            Ok(res) => res,
            Err(_) => Err(timeout_err()),
        }
    }

    /// Take the reader lock. The bridge holds this for a session's lifetime
    /// so the device supervisory reader cannot consume session bytes.
    pub async fn lock_reader(&self) -> MutexGuard<'_, ConnReader> {
        self.reader.lock().await
    }

    /// Remove and return any bytes already buffered past what the codec
    /// consumed. Used to flush client bytes that arrived after the AT line.
    pub async fn drain_buffered(&self) -> Vec<u8> {
        let mut reader = self.reader.lock().await;
        let buffered = reader.buffer().to_vec();
        if !buffered.is_empty() {
            Pin::new(&mut *reader).consume(buffered.len());
        }
        buffered
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Maximum length of a PROXY protocol v1 header line
const PROXY_V1_MAX_LEN: usize = 107;

/// The 12-byte PROXY protocol v2 signature
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Consume a PROXY protocol v1/v2 header from the front of the stream and
/// return the upstream source address it reports. `Ok(None)` means the
/// header was valid but carried no usable address (v1 `UNKNOWN`, v2
/// `LOCAL`). Header parsing is delegated to the `ppp` crate; this function
/// only reads the exact number of header bytes off the wire.
pub async fn read_proxy_header(reader: &mut ConnReader) -> io::Result<Option<SocketAddr>> {
    use ppp::HeaderResult;

    let mut head = vec![0u8; PROXY_V2_SIGNATURE.len()];
    reader.read_exact(&mut head).await?;

    if head == PROXY_V2_SIGNATURE {
        // Fixed part: version/command, family, payload length
        let mut fixed = [0u8; 4];
        reader.read_exact(&mut fixed).await?;
        let payload_len = usize::from(u16::from_be_bytes([fixed[2], fixed[3]]));
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await?;

        head.extend_from_slice(&fixed);
        head.extend_from_slice(&payload);

        match HeaderResult::parse(&head) {
            HeaderResult::V2(Ok(header)) => Ok(v2_source_addr(&header)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed PROXY protocol v2 header",
            )),
        }
    } else if head.starts_with(b"PROXY ") {
        while !head.ends_with(b"\n") {
            if head.len() >= PROXY_V1_MAX_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "PROXY protocol v1 header too long",
                ));
            }
            head.push(reader.read_u8().await?);
        }

        match HeaderResult::parse(&head) {
            HeaderResult::V1(Ok(header)) => Ok(v1_source_addr(&header)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed PROXY protocol v1 header",
            )),
        }
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing PROXY protocol header",
        ))
    }
}

fn v1_source_addr(header: &ppp::v1::Header) -> Option<SocketAddr> {
    match &header.addresses {
        ppp::v1::Addresses::Tcp4(a) => Some(SocketAddr::from((a.source_address, a.source_port))),
        ppp::v1::Addresses::Tcp6(a) => Some(SocketAddr::from((a.source_address, a.source_port))),
        ppp::v1::Addresses::Unknown => None,
    }
}

fn v2_source_addr(header: &ppp::v2::Header) -> Option<SocketAddr> {
    match &header.addresses {
        ppp::v2::Addresses::IPv4(a) => Some(SocketAddr::from((a.source_address, a.source_port))),
        ppp::v2::Addresses::IPv6(a) => Some(SocketAddr::from((a.source_address, a.source_port))),
        ppp::v2::Addresses::Unix(_) | ppp::v2::Addresses::Unspecified => None,
    }
}
