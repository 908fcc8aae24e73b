//! USR-VCOM baud rate synchronization protocol
//!
//! Packet format (8 bytes): `55 AA 55 [baud_hi] [baud_mid] [baud_lo] [param]
//! [checksum]`. This is a fire-and-forget protocol: the proxy never replies
//! to these frames.

use std::fmt;

use tracing::warn;

use super::rfc2217::{
    Rfc2217Command, COM_PORT_OPTION, IAC, SB, SE, SET_BAUDRATE, SET_DATASIZE, SET_PARITY,
    SET_STOPSIZE,
};

pub const HEADER_LEN: usize = 3;
pub const PACKET_LEN: usize = 8;

pub const HEADER: [u8; 3] = [0x55, 0xAA, 0x55];

/// Serial parity setting carried by the parameter byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    /// RFC-2217 SET-PARITY value for this setting
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Odd => 1,
            Self::Even => 2,
            Self::Mark => 3,
            Self::Space => 4,
        }
    }

    /// Single-letter form used in mode strings like `8N1`
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::None => 'N',
            Self::Odd => 'O',
            Self::Even => 'E',
            Self::Mark => 'M',
            Self::Space => 'S',
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Odd => write!(f, "Odd"),
            Self::Even => write!(f, "Even"),
            Self::Mark => write!(f, "Mark"),
            Self::Space => write!(f, "Space"),
        }
    }
}

/// Serial port configuration parsed from a USR-VCOM packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsrVcomConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    /// 1 or 2
    pub stop_bits: u8,
    /// True if the packet was structurally valid
    pub valid: bool,
    /// Original packet bytes
    pub raw: [u8; PACKET_LEN],
}

impl UsrVcomConfig {
    /// Mode string like `8N1` or `8E1`
    #[must_use]
    pub fn mode_string(&self) -> String {
        format!("{}{}{}", self.data_bits, self.parity.letter(), self.stop_bits)
    }

    /// The four equivalent RFC-2217 port settings, in the order
    /// SET-BAUDRATE, SET-DATASIZE, SET-PARITY, SET-STOPSIZE.
    #[must_use]
    pub fn to_rfc2217_commands(&self) -> Vec<Rfc2217Command> {
        if !self.valid {
            return Vec::new();
        }

        vec![
            Rfc2217Command {
                command: SET_BAUDRATE,
                data: self.baud_rate.to_be_bytes().to_vec(),
            },
            Rfc2217Command {
                command: SET_DATASIZE,
                data: vec![self.data_bits],
            },
            Rfc2217Command {
                command: SET_PARITY,
                data: vec![self.parity.code()],
            },
            Rfc2217Command {
                command: SET_STOPSIZE,
                data: vec![self.stop_bits],
            },
        ]
    }

    /// Wire encoding of the translated settings, ready to forward to the
    /// device verbatim.
    #[must_use]
    pub fn build_rfc2217_packet(&self) -> Vec<u8> {
        let mut packet = Vec::new();
        for cmd in self.to_rfc2217_commands() {
            packet.extend_from_slice(&[IAC, SB, COM_PORT_OPTION, cmd.command]);
            packet.extend_from_slice(&cmd.data);
            packet.extend_from_slice(&[IAC, SE]);
        }
        packet
    }
}

impl fmt::Display for UsrVcomConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return write!(f, "USR-VCOM: <invalid>");
        }
        write!(f, "USR-VCOM: {} baud, {}", self.baud_rate, self.mode_string())
    }
}

/// True if the data starts with the USR-VCOM header
#[must_use]
pub fn is_usrvcom(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data[..HEADER_LEN] == HEADER
}

/// Parse a USR-VCOM packet out of `data`. The scanner locates the magic
/// anywhere in the buffer, so leading garbage is tolerated. Returns `None`
/// if no complete packet is present.
#[must_use]
pub fn parse_usrvcom(data: &[u8]) -> Option<UsrVcomConfig> {
    if data.len() < PACKET_LEN {
        return None;
    }

    let idx = (0..=data.len() - PACKET_LEN).find(|&i| data[i..i + HEADER_LEN] == HEADER)?;
    let packet: [u8; PACKET_LEN] = data[idx..idx + PACKET_LEN].try_into().ok()?;

    // Baud rate is big-endian 24-bit
    let baud_rate =
        (u32::from(packet[3]) << 16) | (u32::from(packet[4]) << 8) | u32::from(packet[5]);

    // Parameter byte:
    //   bits 1-0: data bits (00=5, 01=6, 10=7, 11=8)
    //   bit  2:   stop bits (0=1 bit, 1=2 bits)
    //   bit  3:   parity enable
    //   bits 5-4: parity type (00=Odd, 01=Even, 10=Mark, 11=Space)
    let param = packet[6];
    let data_bits = 5 + (param & 0x03);
    let stop_bits = if param & 0x04 != 0 { 2 } else { 1 };
    let parity = if param & 0x08 != 0 {
        match (param >> 4) & 0x03 {
            0 => Parity::Odd,
            1 => Parity::Even,
            2 => Parity::Mark,
            _ => Parity::Space,
        }
    } else {
        Parity::None
    };

    // Some senders do not compute the checksum correctly, so a mismatch is
    // only logged and the configuration is still accepted.
    let checksum = packet[7];
    let calculated = packet[3]
        .wrapping_add(packet[4])
        .wrapping_add(packet[5])
        .wrapping_add(packet[6]);
    if checksum != calculated {
        warn!(
            "USR-VCOM checksum mismatch: got {:02X}, expected {:02X}",
            checksum, calculated
        );
    }

    Some(UsrVcomConfig {
        baud_rate,
        data_bits,
        parity,
        stop_bits,
        valid: true,
        raw: packet,
    })
}
