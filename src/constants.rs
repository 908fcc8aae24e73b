//! Constants used throughout the proxy
//!
//! This module centralizes magic numbers and protocol literals
//! to improve maintainability and reduce duplication.

use std::time::Duration;

/// AT command layer constants
pub mod at {
    /// Device registration: `AT+REG=<token>`
    pub const REG_PREFIX: &str = "AT+REG=";

    /// Client connection: `AT+CONNECT=<token>`
    pub const CONNECT_PREFIX: &str = "AT+CONNECT=";

    /// Dial tone, optionally followed by a phone number
    pub const DIAL_TONE_PREFIX: &str = "ATDT";

    /// Dial pulse, optionally followed by a phone number
    pub const DIAL_PULSE_PREFIX: &str = "ATDP";

    /// Accept reply
    pub const RESP_OK: &[u8] = b"OK\r\n";

    /// Reject reply, always followed by a close
    pub const RESP_ERROR: &[u8] = b"ERROR\r\n";
}

/// Telnet control bytes used outside the RFC-2217 subnegotiation parser
pub mod telnet {
    /// Telnet NOP (`IAC NOP`), used as an application-level keepalive
    pub const NOP: &[u8] = &[0xFF, 0xF1];
}

/// Buffer size constants
pub mod buffer {
    /// Buffer size for the bridge copy loops
    pub const BRIDGE_SIZE: usize = 4096;

    /// Buffer for the device supervisory read loop (data is discarded)
    pub const DEVICE_DISCARD_SIZE: usize = 256;
}

/// Timeout constants
pub mod timeout {
    use super::Duration;

    /// Hard deadline for keepalive NOP writes
    pub const NOP_WRITE: Duration = Duration::from_secs(10);

    /// Polling deadline for the device supervisory read loop, so the
    /// stop signal is checked periodically
    pub const DEVICE_POLL: Duration = Duration::from_secs(5);

    /// Grace period for in-flight HTTP requests on shutdown
    pub const API_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
}

/// TCP keepalive tuning for device sockets
pub mod keepalive {
    use super::Duration;

    /// Interval between probes
    pub const INTERVAL: Duration = Duration::from_secs(10);

    /// Probes before the connection is considered dead
    pub const PROBES: u32 = 3;
}
