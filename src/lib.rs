//! # RFC-2217 NAT Proxy Library
//!
//! A NAT-traversal proxy that lets remote clients open virtual serial-port
//! sessions to field devices that dial into the proxy from behind NAT.
//!
//! ## Architecture
//!
//! The proxy is organized into several modules for clean separation of concerns:
//!
//! - **protocol**: AT command framing plus the USR-VCOM and RFC-2217 codecs
//! - **registry**: live device entries with their busy/idle contract
//! - **session**: session objects, lifecycle management and the data bridge
//! - **handler**: the per-connection acceptance state machine
//! - **server**: the TCP accept loop with optional PROXY protocol support
//! - **api**: read-only HTTP status surface plus terminate-by-session-id
//! - **config**: environment-driven configuration
//!
//! ## Design Philosophy
//!
//! Devices and clients share one acceptance port and are told apart by the
//! first AT command they send (`AT+REG` vs `AT+CONNECT`). Serial-port
//! presets arriving before the AT line (RFC-2217 subnegotiations or the
//! vendor USR-VCOM frame) are absorbed by the codec and forwarded to the
//! device before any session data flows. Once a session is established the
//! bridged byte stream is opaque: the proxy never interprets it.

// Module declarations
pub mod api;
pub mod config;
pub mod constants;
pub mod error;
pub mod handler;
pub mod logging;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

// Public exports
pub use config::Config;
pub use error::ProtocolError;
pub use handler::Handler;
pub use registry::{Device, DeviceInfo, Registry};
pub use server::Server;
pub use session::{Manager, Session, SessionHooks, SessionInfo};
pub use transport::Transport;
