//! Protocol codec for the acceptance phase
//!
//! Finds the next AT command on a byte stream while tolerating the two
//! kinds of preamble some client implementations emit before the AT line:
//! USR-VCOM frames (accepted silently) and RFC-2217 subnegotiations
//! (collected and returned for forwarding).

pub mod rfc2217;
pub mod usrvcom;

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::constants::at;
use crate::error::ProtocolError;
use usrvcom::UsrVcomConfig;

/// AT command kinds recognized on the acceptance port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCommandKind {
    /// `AT+REG=<token>`
    Register,
    /// `AT+CONNECT=<token>`
    Connect,
    /// `ATDT[<number>]`
    DialTone,
    /// `ATDP[<number>]`
    DialPulse,
}

impl std::fmt::Display for AtCommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register => write!(f, "AT+REG"),
            Self::Connect => write!(f, "AT+CONNECT"),
            Self::DialTone => write!(f, "ATDT"),
            Self::DialPulse => write!(f, "ATDP"),
        }
    }
}

/// A parsed AT command
#[derive(Debug, Clone)]
pub struct AtCommand {
    pub kind: AtCommandKind,
    /// Parameter value after the matched prefix (may be empty for dials)
    pub param: String,
    /// Bytes received before the AT command (may contain RFC-2217 data)
    pub skipped: Vec<u8>,
    /// USR-VCOM configuration if a frame was received before the command
    pub usrvcom: Option<UsrVcomConfig>,
}

/// Read the next AT command, absorbing any USR-VCOM or RFC-2217 preamble.
///
/// USR-VCOM packets are accepted silently per the vendor specification and
/// the parsed configuration is attached to the returned command. RFC-2217
/// data is collected into `skipped`. After a USR-VCOM frame, non-AT input
/// is logged and discarded while waiting for the AT line; without one, an
/// unrecognized line is a parse error.
///
/// The deadline covers the whole wait. Expiry yields the distinct
/// [`ProtocolError::Timeout`] kind.
pub async fn read_at_command<R>(
    reader: &mut R,
    deadline: Duration,
) -> Result<AtCommand, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let start = Instant::now();
    let mut usrvcom_cfg: Option<UsrVcomConfig> = None;
    let mut all_skipped: Vec<u8> = Vec::new();

    loop {
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return Err(ProtocolError::Timeout);
        }
        let remaining = deadline - elapsed;

        let (line, skipped) =
            match tokio::time::timeout(remaining, read_line_with_skipped(reader)).await {
                Ok(Ok(parts)) => parts,
                Ok(Err(e)) => return Err(ProtocolError::Io(e)),
                Err(_) => {
                    if usrvcom_cfg.is_some() {
                        debug!("timeout after USR-VCOM, continuing...");
                        continue;
                    }
                    return Err(ProtocolError::Timeout);
                }
            };

        // Classify data that arrived before the AT command on this line
        if !skipped.is_empty() {
            if usrvcom::is_usrvcom(&skipped) {
                match usrvcom::parse_usrvcom(&skipped) {
                    Some(cfg) => {
                        debug!("{} accepted, waiting for AT command...", cfg);
                        usrvcom_cfg = Some(cfg);
                        // No response per the vendor specification
                    }
                    None => {
                        warn!("USR-VCOM parse failed: {:02x?}", skipped);
                    }
                }
            } else if is_rfc2217_data(&skipped) {
                debug!("RFC-2217 data before AT: {:02x?}", skipped);
                all_skipped.extend_from_slice(&skipped);
            } else {
                debug!("skipped {} bytes: {:02x?}", skipped.len(), skipped);
                all_skipped.extend_from_slice(&skipped);
            }
        }

        let cmd_line = String::from_utf8_lossy(&line);
        let cmd_line = cmd_line.trim();

        // Empty line: a preamble packet without an AT command on the same
        // framing, keep waiting
        if cmd_line.is_empty() {
            continue;
        }

        debug!("received: {:?}", cmd_line);

        if let Some((kind, param)) = parse_at_command(cmd_line) {
            return Ok(AtCommand {
                kind,
                param: param.to_string(),
                skipped: all_skipped,
                usrvcom: usrvcom_cfg,
            });
        }

        // Not an AT command. With a USR-VCOM frame already seen, tolerate
        // unknown data and keep waiting for the AT line.
        if usrvcom_cfg.is_some() {
            debug!("ignoring non-AT data after USR-VCOM: {:?}", cmd_line);
            continue;
        }

        return Err(ProtocolError::Parse(cmd_line.to_string()));
    }
}

/// Read bytes until CR/LF, separating pre-command bytes from the AT line.
///
/// A lone `A` only starts command collection when the following byte is
/// `T`, checked with a one-byte look-ahead that does not consume it.
async fn read_line_with_skipped<R>(reader: &mut R) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    let mut skipped: Vec<u8> = Vec::new();
    let mut in_command = false;

    loop {
        let b = next_byte(reader).await?;

        // Stop on CR or LF, folding CR LF into one terminator
        if b == b'\r' || b == b'\n' {
            if b == b'\r' && peek_byte(reader).await? == Some(b'\n') {
                let _ = next_byte(reader).await?;
            }
            return Ok((line, skipped));
        }

        if !in_command && b == b'A' && peek_byte(reader).await? == Some(b'T') {
            in_command = true;
            line.push(b);
            continue;
        }

        if in_command {
            line.push(b);
        } else {
            skipped.push(b);
        }
    }
}

async fn next_byte<R>(reader: &mut R) -> io::Result<u8>
where
    R: AsyncBufRead + Unpin,
{
    let available = reader.fill_buf().await?;
    match available.first().copied() {
        Some(b) => {
            reader.consume(1);
            Ok(b)
        }
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed",
        )),
    }
}

async fn peek_byte<R>(reader: &mut R) -> io::Result<Option<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let available = reader.fill_buf().await?;
    Ok(available.first().copied())
}

/// Classify an AT command line by prefix. Returns the kind and parameter.
fn parse_at_command(line: &str) -> Option<(AtCommandKind, &str)> {
    if let Some(param) = line.strip_prefix(at::REG_PREFIX) {
        return Some((AtCommandKind::Register, param));
    }
    if let Some(param) = line.strip_prefix(at::CONNECT_PREFIX) {
        return Some((AtCommandKind::Connect, param));
    }
    if let Some(param) = line.strip_prefix(at::DIAL_TONE_PREFIX) {
        return Some((AtCommandKind::DialTone, param));
    }
    if let Some(param) = line.strip_prefix(at::DIAL_PULSE_PREFIX) {
        return Some((AtCommandKind::DialPulse, param));
    }
    None
}

/// True if the data looks like Telnet negotiation (starts with IAC)
fn is_rfc2217_data(data: &[u8]) -> bool {
    data.len() >= 3
        && data[0] == 0xFF
        && (data[1] == 0xFA || data[1] == 0xFB || data[1] == 0xFC || data[1] == 0xFD)
}

/// Send the `OK` reply
pub async fn write_ok<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(at::RESP_OK).await
}

/// Send the `ERROR` reply
pub async fn write_error<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(at::RESP_ERROR).await
}
