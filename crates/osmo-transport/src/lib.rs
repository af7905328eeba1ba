//! Control channel to the remote service.
//!
//! Provides:
//! - Wire protocol (`ControlMessage`, `SessionRequest`)
//! - `ControlChannel` - Dial, reconnect, liveness and send/subscribe handle
//! - Credential refresh (`CredentialStore`, `HttpRefresher`)
//! - `LogSender` - Bounded log queue drain loop
//! - WebSocket link (feature: websocket)

pub mod auth;
pub mod channel;
pub mod error;
pub mod protocol;
pub mod sender;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use auth::{Credential, CredentialStore, HttpRefresher, TokenRefresher};
pub use channel::{ChannelConfig, ChannelDriver, ControlChannel, Dialer, Frame, Link, backoff_delay};
pub use error::ChannelError;
pub use protocol::{ControlMessage, SessionKind, SessionRequest};
pub use sender::{LogSender, RecordSink};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketDialer, WebSocketLink};
