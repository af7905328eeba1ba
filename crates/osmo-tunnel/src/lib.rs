//! Tunnel multiplexer for interactive sessions.
//!
//! Provides:
//! - `TunnelMux` - Dispatch session requests to per-kind relays
//! - `relay_io` / `relay_frames` - Paired bidirectional relays
//! - `UdpDemux` - Per-peer UDP sockets behind one framed stream
//! - `RouterDialer` - Remote session streams on the router

pub mod error;
pub mod mux;
pub mod relay;
pub mod stream;
pub mod telemetry;
pub mod udp;

pub use error::TunnelError;
pub use mux::{DEFAULT_EXEC_COMMAND, TunnelConfig, TunnelMux};
pub use relay::{RelayStats, relay_frames, relay_io};
pub use stream::{ByteSink, ByteSource, ByteStream, RouterDialer, SessionDialer, dial_local_websocket};
pub use udp::{PeerEvent, UDP_HEADER_LEN, UdpDemux, decode_datagram, encode_datagram, forward_udp};
