//! Connection dispatcher
//!
//! One instance handles every accepted connection. The first AT command
//! decides whether the peer is a device (`AT+REG`) or a client
//! (`AT+CONNECT`); dial prefixes some legacy clients emit first are
//! answered with `OK` and the read deadline is extended for the real
//! command. Every rejecting path sends exactly one `ERROR` and closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{at, buffer, keepalive as ka, telnet, timeout};
use crate::error::ProtocolError;
use crate::network;
use crate::protocol::rfc2217::{self, Rfc2217Buffer};
use crate::protocol::usrvcom::{self, UsrVcomConfig};
use crate::protocol::{self, AtCommand, AtCommandKind};
use crate::registry::{Device, Registry};
use crate::session::{Bridge, Manager};
use crate::transport::{self, ConnReader, Transport};
use crate::types::ConnId;

/// Handles all connections, devices and clients alike
pub struct Handler {
    cfg: Arc<Config>,
    registry: Arc<Registry>,
    sessions: Arc<Manager>,
}

impl Handler {
    #[must_use]
    pub fn new(cfg: Arc<Config>, registry: Arc<Registry>, sessions: Arc<Manager>) -> Self {
        Self {
            cfg,
            registry,
            sessions,
        }
    }

    /// Process one accepted connection through the acceptance state
    /// machine and on into the device or client lifetime.
    pub async fn handle(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let conn_id = ConnId::new();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut peer_addr = peer_addr;
        if self.cfg.proxy_protocol {
            match transport::read_proxy_header(&mut reader).await {
                Ok(Some(source)) => {
                    debug!("{}: PROXY protocol source {}", conn_id, source);
                    peer_addr = source;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("{}: invalid PROXY protocol header: {}", conn_id, e);
                    return Ok(());
                }
            }
        }

        info!("{}: new connection from {}", conn_id, peer_addr);

        // A USR-VCOM frame can arrive before a tolerated dial command, so
        // track the config across the loop.
        let mut usrvcom_cfg: Option<UsrVcomConfig> = None;
        let mut deadline = self.cfg.init_timeout;

        loop {
            let mut cmd = match protocol::read_at_command(&mut reader, deadline).await {
                Ok(cmd) => cmd,
                Err(err) => {
                    match &err {
                        ProtocolError::Timeout => {
                            let buffered = reader.buffer();
                            if buffered.is_empty() {
                                info!(
                                    "{}: init timeout (no data received in {:?})",
                                    peer_addr, deadline
                                );
                            } else {
                                info!(
                                    "{}: init timeout, partial data: {:02x?}",
                                    peer_addr, buffered
                                );
                            }
                        }
                        other => info!("{}: read command: {}", peer_addr, other),
                    }
                    let _ = protocol::write_error(&mut writer).await;
                    return Ok(());
                }
            };

            if cmd.usrvcom.is_some() {
                usrvcom_cfg.clone_from(&cmd.usrvcom);
            }

            match &cmd.usrvcom {
                Some(cfg) => info!(
                    "{}: received command: {} param: {:?} (with USR-VCOM: {} baud {})",
                    peer_addr, cmd.kind, cmd.param, cfg.baud_rate, cfg.mode_string()
                ),
                None => info!(
                    "{}: received command: {} param: {:?}",
                    peer_addr, cmd.kind, cmd.param
                ),
            }

            match cmd.kind {
                AtCommandKind::DialTone | AtCommandKind::DialPulse => {
                    // Reply OK and wait for the real command with the
                    // longer post-connect deadline
                    if let Err(e) = protocol::write_ok(&mut writer).await {
                        debug!("{}: write OK: {}", peer_addr, e);
                        return Ok(());
                    }
                    deadline = self.cfg.post_connect_timeout;
                }
                AtCommandKind::Register => {
                    return self
                        .handle_device(reader, writer, peer_addr, &cmd.param, shutdown, conn_id)
                        .await;
                }
                AtCommandKind::Connect => {
                    // Preserve a USR-VCOM config seen before an earlier
                    // dial command
                    if cmd.usrvcom.is_none() {
                        cmd.usrvcom = usrvcom_cfg;
                    }
                    return self
                        .handle_client(reader, writer, peer_addr, cmd, conn_id)
                        .await;
                }
            }
        }
    }

    /// Split `<token>+<device-id>` according to the configured auth token.
    fn parse_device_id(&self, param: &str) -> Result<String, ProtocolError> {
        if param.is_empty() {
            return Err(ProtocolError::Auth("empty token".to_string()));
        }

        let device_id = if self.cfg.auth_token.is_empty() {
            param.to_string()
        } else {
            match param.split_once('+') {
                Some((token, id)) => {
                    if token != self.cfg.auth_token {
                        return Err(ProtocolError::Auth("invalid auth token".to_string()));
                    }
                    id.to_string()
                }
                None => {
                    return Err(ProtocolError::Auth(
                        "invalid token format (expected TOKEN+DEVICE_ID)".to_string(),
                    ));
                }
            }
        };

        if device_id.is_empty() {
            return Err(ProtocolError::Auth("empty device id".to_string()));
        }
        Ok(device_id)
    }

    /// Device registration and lifetime.
    async fn handle_device(
        &self,
        reader: ConnReader,
        mut writer: OwnedWriteHalf,
        peer_addr: SocketAddr,
        param: &str,
        shutdown: CancellationToken,
        conn_id: ConnId,
    ) -> Result<()> {
        let device_id = match self.parse_device_id(param) {
            Ok(id) => id,
            Err(e) => {
                warn!("{}: {}", peer_addr, e);
                let _ = protocol::write_error(&mut writer).await;
                return Ok(());
            }
        };

        // Takeover: a new registration for a live id evicts the old entry
        if let Some(existing) = self.registry.get(&device_id) {
            info!(
                "{}: device {} already registered, closing old connection",
                peer_addr, device_id
            );
            existing.stop_keepalive();
            existing.transport().close();
            self.registry.unregister(&device_id);
        }

        // Re-join the halves to reach the socket for keepalive tuning. Any
        // bytes the acceptance reader buffered past the REG line are
        // dropped here; a device has nothing to say before our OK.
        let buffered = reader.buffer().len();
        if buffered > 0 {
            debug!(
                "{}: discarding {} buffered bytes at registration",
                device_id, buffered
            );
        }
        let stream = reader
            .into_inner()
            .reunite(writer)
            .map_err(|e| anyhow!("reunite connection halves: {}", e))?;
        if let Err(e) =
            network::set_tcp_keepalive(&stream, self.cfg.keepalive, ka::INTERVAL, ka::PROBES)
        {
            warn!("{}: failed to set TCP keepalive: {}", peer_addr, e);
        }
        let (read_half, write_half) = stream.into_split();

        let transport = Arc::new(Transport::new(
            BufReader::new(read_half),
            write_half,
            peer_addr,
        ));
        let device = Arc::new(Device::new(device_id.clone(), transport.clone()));
        self.registry.register(device.clone());

        info!("{}: registered device {} ({})", peer_addr, device_id, conn_id);

        if let Err(e) = transport.write_all(at::RESP_OK).await {
            debug!("{}: write OK: {}", device_id, e);
            self.registry.unregister_entry(&device);
            return Ok(());
        }

        // Some devices follow registration with a dial command; answer it
        // and move on. Anything else within the window is ignored, and a
        // session claiming the device ends the window early so the bridge
        // owns the device's bytes.
        {
            let mut guard = transport.lock_reader().await;
            let followup = tokio::select! {
                _ = device.claimed() => None,
                res = protocol::read_at_command(&mut *guard, self.cfg.post_connect_timeout) => {
                    Some(res)
                }
            };
            drop(guard);
            if let Some(Ok(cmd)) = followup {
                if matches!(cmd.kind, AtCommandKind::DialTone | AtCommandKind::DialPulse) {
                    info!("{}: received {}{}", device_id, cmd.kind, cmd.param);
                    let _ = transport.write_all(at::RESP_OK).await;
                }
            }
        }

        // Supervisory tasks: a reader that notices the connection closing
        // and a periodic NOP keepalive
        let read_closed = CancellationToken::new();
        let reader_task = tokio::spawn(device_reader(device.clone(), read_closed.clone()));

        let keepalive_closed = CancellationToken::new();
        let keepalive_task = if self.cfg.idle_timeout > Duration::ZERO {
            Some(tokio::spawn(device_keepalive(
                transport.clone(),
                device_id.clone(),
                self.cfg.idle_timeout,
                device.stop_token().clone(),
                keepalive_closed.clone(),
            )))
        } else {
            None
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{}: shutting down", device_id);
            }
            _ = device.stop_token().cancelled() => {
                info!("{}: superseded by new registration", device_id);
            }
            _ = keepalive_closed.cancelled() => {
                info!("{}: connection closed by keepalive", device_id);
            }
            _ = read_closed.cancelled() => {
                info!("{}: connection closed by device", device_id);
            }
        }

        device.stop_keepalive();
        transport.close();
        self.registry.unregister_entry(&device);

        let _ = reader_task.await;
        if let Some(task) = keepalive_task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Client connection request and session lifetime.
    async fn handle_client(
        &self,
        reader: ConnReader,
        mut writer: OwnedWriteHalf,
        peer_addr: SocketAddr,
        cmd: AtCommand,
        conn_id: ConnId,
    ) -> Result<()> {
        let device_id = match self.parse_device_id(&cmd.param) {
            Ok(id) => id,
            Err(e) => {
                warn!("{}: {}", peer_addr, e);
                let _ = protocol::write_error(&mut writer).await;
                return Ok(());
            }
        };

        // Serial-port presets for the device. A USR-VCOM config parsed
        // before the AT command wins; otherwise the skipped bytes are
        // classified as a late USR-VCOM frame or RFC-2217 data.
        let mut presets: Option<Rfc2217Buffer> = None;
        if let Some(cfg) = cmd.usrvcom.as_ref().filter(|cfg| cfg.valid) {
            info!(
                "{}: USR-VCOM presets: {} baud, {}",
                peer_addr,
                cfg.baud_rate,
                cfg.mode_string()
            );
            presets = Some(Rfc2217Buffer {
                commands: cfg.to_rfc2217_commands(),
                raw: cfg.build_rfc2217_packet(),
            });
        }

        if presets.is_none() && !cmd.skipped.is_empty() {
            debug!(
                "{}: skipped data before AT ({} bytes): {:02x?}",
                peer_addr,
                cmd.skipped.len(),
                cmd.skipped
            );
            if usrvcom::is_usrvcom(&cmd.skipped) {
                if let Some(cfg) = usrvcom::parse_usrvcom(&cmd.skipped) {
                    info!("{}: late USR-VCOM presets: {}", peer_addr, cfg);
                    presets = Some(Rfc2217Buffer {
                        commands: cfg.to_rfc2217_commands(),
                        raw: cfg.build_rfc2217_packet(),
                    });
                }
            } else {
                presets = Some(rfc2217::parse_commands(&cmd.skipped));
            }
        }

        if let Some(buf) = presets.as_ref().filter(|buf| !buf.commands.is_empty()) {
            if buf.all_queries() {
                info!("{}: RFC-2217 queries (before AT):", peer_addr);
            } else {
                info!("{}: RFC-2217 port settings (before AT):", peer_addr);
            }
            for item in &buf.commands {
                info!("{}:   - {}", peer_addr, item);
            }
        }

        info!(
            "{}: requesting session with device {} ({})",
            peer_addr, device_id, conn_id
        );

        let Some(device) = self.registry.get(&device_id) else {
            warn!("{}: {}", peer_addr, ProtocolError::NotFound(device_id));
            let _ = protocol::write_error(&mut writer).await;
            return Ok(());
        };

        if device.is_in_session() {
            warn!("{}: {}", peer_addr, ProtocolError::Busy(device_id));
            let _ = protocol::write_error(&mut writer).await;
            return Ok(());
        }

        let client = Arc::new(Transport::new(reader, writer, peer_addr));
        let session = self
            .sessions
            .create(&device_id, client.clone(), device.transport().clone());
        device.set_session(session.id());

        info!(
            "{}: created session {} with device {}",
            peer_addr,
            session.id(),
            device_id
        );

        if let Err(e) = client.write_all(at::RESP_OK).await {
            debug!("{}: write OK error: {}", peer_addr, e);
            self.sessions.end(session.id());
            device.clear_session();
            return Ok(());
        }

        // Forward the presets to the device before any session data flows
        if let Some(buf) = presets.as_ref().filter(|buf| !buf.raw.is_empty()) {
            debug!(
                "{}: forwarding {} preset bytes to device: {:02x?}",
                peer_addr,
                buf.raw.len(),
                buf.raw
            );
            if let Err(e) = device.transport().write_all(&buf.raw).await {
                warn!("{}: preset forward error: {}", peer_addr, e);
            }
        }

        // Bytes the codec buffered past the AT line may hold more port
        // settings; classify and forward them best-effort.
        let buffered = client.drain_buffered().await;
        if !buffered.is_empty() {
            self.forward_buffered(&device, &buffered, peer_addr).await;
        }

        // Run the bridge; blocks until the session ends
        Bridge::new(session.clone()).run().await;

        self.sessions.end(session.id());
        device.clear_session();

        info!("{}: session {} ended", peer_addr, session.id());
        Ok(())
    }

    /// Classify bytes that arrived after the AT line and forward them to
    /// the device: translated when they parse as USR-VCOM, raw when they
    /// parse as RFC-2217, verbatim otherwise.
    async fn forward_buffered(&self, device: &Arc<Device>, buffered: &[u8], peer_addr: SocketAddr) {
        debug!(
            "{}: buffered data ({} bytes): {:02x?}",
            peer_addr,
            buffered.len(),
            buffered
        );

        let mut parsed: Option<Rfc2217Buffer> = None;
        if usrvcom::is_usrvcom(buffered) {
            if let Some(cfg) = usrvcom::parse_usrvcom(buffered) {
                info!("{}: buffered presets: {}", peer_addr, cfg);
                parsed = Some(Rfc2217Buffer {
                    commands: cfg.to_rfc2217_commands(),
                    raw: cfg.build_rfc2217_packet(),
                });
            }
        } else if buffered.len() >= 3
            && buffered[0] == rfc2217::IAC
            && buffered[1] == rfc2217::SB
            && buffered[2] == rfc2217::COM_PORT_OPTION
        {
            parsed = Some(rfc2217::parse_commands(buffered));
        }

        match parsed.filter(|buf| !buf.commands.is_empty()) {
            Some(buf) => {
                if buf.all_queries() {
                    info!(
                        "{}: received {} RFC-2217 queries (requesting current values):",
                        peer_addr,
                        buf.commands.len()
                    );
                } else {
                    info!(
                        "{}: received {} RFC-2217 port settings:",
                        peer_addr,
                        buf.commands.len()
                    );
                }
                for item in &buf.commands {
                    info!("{}:   - {}", peer_addr, item);
                }
                if let Err(e) = device.transport().write_all(&buf.raw).await {
                    warn!("{}: preset forward error: {}", peer_addr, e);
                }
            }
            None => {
                debug!(
                    "{}: forwarding {} buffered bytes to device: {:02x?}",
                    peer_addr,
                    buffered.len(),
                    buffered
                );
                if let Err(e) = device.transport().write_all(buffered).await {
                    warn!("{}: buffered forward error: {}", peer_addr, e);
                }
            }
        }
    }
}

/// Read and discard unsolicited device bytes so a closing connection is
/// noticed promptly. The deadline keeps the loop checking its stop signal.
/// While a session is active the bridge owns the device's bytes and this
/// loop only keeps polling for the stop signal.
async fn device_reader(device: Arc<Device>, closed: CancellationToken) {
    let transport = device.transport().clone();
    let device_id = device.id().to_string();
    let mut buf = [0u8; buffer::DEVICE_DISCARD_SIZE];
    // The claim arm is one-shot: armed until a session first takes the
    // device, then the loop falls back to plain polling.
    let mut claim_armed = true;
    loop {
        if device.is_in_session() {
            claim_armed = false;
            tokio::select! {
                _ = device.stop_token().cancelled() => return,
                _ = tokio::time::sleep(timeout::DEVICE_POLL) => {}
            }
            continue;
        }
        // The claim is checked first so a read racing a session start is
        // dropped before it can consume session bytes
        tokio::select! {
            biased;
            _ = device.stop_token().cancelled() => return,
            _ = device.claimed(), if claim_armed => {
                claim_armed = false;
            }
            res = transport.read_timeout(&mut buf, timeout::DEVICE_POLL) => match res {
                Ok(0) => {
                    debug!("{}: device closed connection", device_id);
                    closed.cancel();
                    return;
                }
                // Data outside a session is discarded
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    debug!("{}: read error: {}", device_id, e);
                    closed.cancel();
                    return;
                }
            },
        }
    }
}

/// Write a Telnet NOP every idle period so a dead device connection is
/// noticed even when the OS keepalive is slow to trip.
async fn device_keepalive(
    transport: Arc<Transport>,
    device_id: String,
    idle_timeout: Duration,
    stop: CancellationToken,
    closed: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + idle_timeout, idle_timeout);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = transport
                    .write_all_timeout(telnet::NOP, timeout::NOP_WRITE)
                    .await
                {
                    debug!("{}: keepalive failed: {}", device_id, e);
                    transport.close();
                    closed.cancel();
                    return;
                }
            }
        }
    }
}
