//! RFC-2217 COM-PORT-OPTION subnegotiation
//!
//! Each item is framed as `IAC SB COM-PORT-OPTION <opcode> <payload> IAC SE`.
//! The proxy forwards items to the device unchanged; server responses
//! (`opcode + 100`) are the device's concern once the bridge is live.

use std::fmt;

/// Interpret As Command
pub const IAC: u8 = 0xFF;
/// Subnegotiation Begin
pub const SB: u8 = 0xFA;
/// Subnegotiation End
pub const SE: u8 = 0xF0;

/// COM-PORT-OPTION (44)
pub const COM_PORT_OPTION: u8 = 0x2C;

// Client to server commands (requests)
pub const SET_BAUDRATE: u8 = 0x01;
pub const SET_DATASIZE: u8 = 0x02;
pub const SET_PARITY: u8 = 0x03;
pub const SET_STOPSIZE: u8 = 0x04;
pub const SET_CONTROL: u8 = 0x05;

/// Server responses use the request opcode plus this offset
pub const SERVER_RESPONSE_OFFSET: u8 = 100;

/// A parsed RFC-2217 subnegotiation item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2217Command {
    /// Command code (1-5 for client requests)
    pub command: u8,
    /// Opaque command payload
    pub data: Vec<u8>,
}

impl Rfc2217Command {
    /// Wire encoding of the server acknowledgment for this command.
    #[must_use]
    pub fn build_response(&self) -> Vec<u8> {
        let mut resp = vec![
            IAC,
            SB,
            COM_PORT_OPTION,
            self.command.wrapping_add(SERVER_RESPONSE_OFFSET),
        ];
        resp.extend_from_slice(&self.data);
        resp.extend_from_slice(&[IAC, SE]);
        resp
    }

    /// True if this is a query (value 0 means "request current value")
    /// rather than a setting.
    #[must_use]
    pub fn is_query(&self) -> bool {
        match self.command {
            SET_BAUDRATE => {
                self.data.len() >= 4
                    && u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
                        == 0
            }
            SET_DATASIZE | SET_PARITY | SET_STOPSIZE | SET_CONTROL => {
                !self.data.is_empty() && self.data[0] == 0
            }
            _ => false,
        }
    }
}

impl fmt::Display for Rfc2217Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command {
            SET_BAUDRATE => {
                if self.data.len() >= 4 {
                    let baud =
                        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
                    write!(f, "SET-BAUDRATE: {}", baud)
                } else {
                    write!(f, "SET-BAUDRATE: <invalid>")
                }
            }
            SET_DATASIZE => match self.data.first() {
                Some(bits) => write!(f, "SET-DATASIZE: {} bits", bits),
                None => write!(f, "SET-DATASIZE: <invalid>"),
            },
            SET_PARITY => match self.data.first() {
                Some(&p) => {
                    const PARITY: [&str; 5] = ["NONE", "ODD", "EVEN", "MARK", "SPACE"];
                    match PARITY.get(p as usize) {
                        Some(name) => write!(f, "SET-PARITY: {}", name),
                        None => write!(f, "SET-PARITY: {}", p),
                    }
                }
                None => write!(f, "SET-PARITY: <invalid>"),
            },
            SET_STOPSIZE => match self.data.first() {
                Some(&s) => {
                    const STOP: [&str; 3] = ["1", "2", "1.5"];
                    match (s as usize).checked_sub(1).and_then(|i| STOP.get(i)) {
                        Some(name) => write!(f, "SET-STOPSIZE: {}", name),
                        None => write!(f, "SET-STOPSIZE: {}", s),
                    }
                }
                None => write!(f, "SET-STOPSIZE: <invalid>"),
            },
            SET_CONTROL => match self.data.first() {
                Some(c) => write!(f, "SET-CONTROL: {}", c),
                None => write!(f, "SET-CONTROL: <invalid>"),
            },
            other => write!(f, "UNKNOWN-{}: {:02x?}", other, self.data),
        }
    }
}

/// RFC-2217 items collected before an AT command, plus the raw bytes they
/// were decoded from so they can be forwarded verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rfc2217Buffer {
    pub commands: Vec<Rfc2217Command>,
    pub raw: Vec<u8>,
}

impl Rfc2217Buffer {
    /// True when every collected item is a query rather than a setting.
    #[must_use]
    pub fn all_queries(&self) -> bool {
        self.commands.iter().all(Rfc2217Command::is_query)
    }
}

/// Parse RFC-2217 subnegotiations out of raw bytes. Any number of items is
/// accepted in sequence; bytes between items are ignored. The original
/// bytes are preserved in the returned buffer.
#[must_use]
pub fn parse_commands(data: &[u8]) -> Rfc2217Buffer {
    let mut buf = Rfc2217Buffer {
        commands: Vec::new(),
        raw: data.to_vec(),
    };

    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == IAC && data[i + 1] == SB && data[i + 2] == COM_PORT_OPTION {
            let start = i + 3;
            let end = (start..data.len().saturating_sub(1))
                .find(|&j| data[j] == IAC && data[j + 1] == SE);
            if let Some(end) = end {
                if end > start {
                    buf.commands.push(Rfc2217Command {
                        command: data[start],
                        data: data[start + 1..end].to_vec(),
                    });
                    i = end + 2;
                    continue;
                }
            }
        }
        i += 1;
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_decode(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).expect("hex"))
            .collect()
    }

    #[test]
    fn test_parse_commands() {
        let data = hex_decode(
            "fffa2c0100000960fff0fffa2c0208fff0fffa2c0301fff0fffa2c0401fff0fffa2c0501fff0",
        );

        let buf = parse_commands(&data);

        assert_eq!(buf.commands.len(), 5);

        // SET-BAUDRATE: 2400 (0x960)
        assert_eq!(buf.commands[0].command, SET_BAUDRATE);
        assert_eq!(buf.commands[0].data, vec![0x00, 0x00, 0x09, 0x60]);

        // SET-DATASIZE: 8
        assert_eq!(buf.commands[1].command, SET_DATASIZE);
        assert_eq!(buf.commands[1].data, vec![0x08]);

        // SET-PARITY: 1 (ODD)
        assert_eq!(buf.commands[2].command, SET_PARITY);
        assert_eq!(buf.commands[2].data, vec![0x01]);

        // SET-STOPSIZE: 1
        assert_eq!(buf.commands[3].command, SET_STOPSIZE);
        assert_eq!(buf.commands[3].data, vec![0x01]);

        // SET-CONTROL: 1
        assert_eq!(buf.commands[4].command, SET_CONTROL);
        assert_eq!(buf.commands[4].data, vec![0x01]);

        // Raw bytes are preserved for verbatim forwarding
        assert_eq!(buf.raw, data);
    }

    #[test]
    fn test_parse_ignores_garbage_between_items() {
        let mut data = hex_decode("fffa2c0208fff0");
        data.extend_from_slice(&[0x00, 0x01, 0x02]);
        data.extend_from_slice(&hex_decode("fffa2c0401fff0"));

        let buf = parse_commands(&data);
        assert_eq!(buf.commands.len(), 2);
        assert_eq!(buf.commands[0].command, SET_DATASIZE);
        assert_eq!(buf.commands[1].command, SET_STOPSIZE);
    }

    #[test]
    fn test_parse_non_rfc2217_yields_no_commands() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let buf = parse_commands(&data);
        assert!(buf.commands.is_empty());
        assert_eq!(buf.raw, data);
    }

    #[test]
    fn test_build_response() {
        let cmd = Rfc2217Command {
            command: SET_BAUDRATE,
            data: vec![0x00, 0x00, 0x09, 0x60],
        };

        // IAC SB COM-PORT-OPTION (SET-BAUDRATE+100) data IAC SE
        assert_eq!(cmd.build_response(), hex_decode("fffa2c6500000960fff0"));
    }

    #[test]
    fn test_responses_round_trip() {
        let data = hex_decode("fffa2c0100000960fff0fffa2c0208fff0fffa2c0303fff0");
        let buf = parse_commands(&data);

        // Re-emitting every item through the response builder yields the
        // original bytes with each opcode shifted by 100, in order.
        let mut emitted = Vec::new();
        for cmd in &buf.commands {
            emitted.extend_from_slice(&cmd.build_response());
        }

        let mut expected = data.clone();
        expected[3] += 100;
        expected[13] += 100;
        expected[20] += 100;
        assert_eq!(emitted, expected);
    }

    #[test]
    fn test_command_display() {
        let cases: [(Rfc2217Command, &str); 8] = [
            (
                Rfc2217Command { command: SET_BAUDRATE, data: vec![0x00, 0x00, 0x09, 0x60] },
                "SET-BAUDRATE: 2400",
            ),
            (
                Rfc2217Command { command: SET_DATASIZE, data: vec![0x08] },
                "SET-DATASIZE: 8 bits",
            ),
            (
                Rfc2217Command { command: SET_PARITY, data: vec![0x00] },
                "SET-PARITY: NONE",
            ),
            (
                Rfc2217Command { command: SET_PARITY, data: vec![0x01] },
                "SET-PARITY: ODD",
            ),
            (
                Rfc2217Command { command: SET_PARITY, data: vec![0x02] },
                "SET-PARITY: EVEN",
            ),
            (
                Rfc2217Command { command: SET_STOPSIZE, data: vec![0x01] },
                "SET-STOPSIZE: 1",
            ),
            (
                Rfc2217Command { command: SET_STOPSIZE, data: vec![0x02] },
                "SET-STOPSIZE: 2",
            ),
            (
                Rfc2217Command { command: SET_CONTROL, data: vec![0x01] },
                "SET-CONTROL: 1",
            ),
        ];

        for (cmd, expected) in cases {
            assert_eq!(cmd.to_string(), expected);
        }
    }

    #[test]
    fn test_is_query() {
        // Query commands (value=0)
        assert!(Rfc2217Command { command: SET_BAUDRATE, data: vec![0, 0, 0, 0] }.is_query());
        assert!(Rfc2217Command { command: SET_DATASIZE, data: vec![0] }.is_query());
        assert!(Rfc2217Command { command: SET_PARITY, data: vec![0] }.is_query());
        assert!(Rfc2217Command { command: SET_STOPSIZE, data: vec![0] }.is_query());
        assert!(Rfc2217Command { command: SET_CONTROL, data: vec![0] }.is_query());

        // Setting commands (value>0)
        assert!(!Rfc2217Command { command: SET_BAUDRATE, data: vec![0, 0, 0x09, 0x60] }.is_query());
        assert!(!Rfc2217Command { command: SET_DATASIZE, data: vec![8] }.is_query());
        assert!(!Rfc2217Command { command: SET_PARITY, data: vec![2] }.is_query());
        assert!(!Rfc2217Command { command: SET_STOPSIZE, data: vec![1] }.is_query());
        assert!(!Rfc2217Command { command: SET_CONTROL, data: vec![1] }.is_query());
    }

    #[test]
    fn test_all_queries() {
        let queries = parse_commands(&hex_decode("fffa2c0100000000fff0fffa2c0200fff0"));
        assert!(queries.all_queries());

        let settings = parse_commands(&hex_decode("fffa2c0100000960fff0fffa2c0200fff0"));
        assert!(!settings.all_queries());
    }
}
