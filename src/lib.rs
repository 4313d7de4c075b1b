//! Client-side coordinator for multi-party mesh calls: one direct peer
//! connection per remote participant, negotiated over a room-scoped
//! WebSocket relay.

pub mod candidates;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod registry;
pub mod rtc;
pub mod signaling;

#[cfg(test)]
mod mock;

pub use config::CallConfig;
pub use coordinator::{CallCoordinator, CallEvent, CallPhase, JoinGrant, SessionPermissions, StaticPermissions};
pub use error::{CallError, Result};
pub use media::{LocalMedia, MediaConstraints};
pub use registry::Participant;
pub use rtc::WebRtcConnectionFactory;
pub use signaling::WebSocketConnector;
