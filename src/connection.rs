use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::media::LocalTrack;

/// Session description exchanged as the `offer`/`answer` payload. Shaped
/// like a browser `RTCSessionDescriptionInit` so browser peers interoperate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network-traversal candidate, shaped like a browser `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Connectivity state reported by a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "New"),
            ConnectionState::Checking => write!(f, "Checking"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Inbound media handed to whoever renders it.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub remote: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    NegotiationNeeded,
    Track(RemoteTrack),
}

/// A callback from one connection handle, tagged with the link it belongs
/// to so events from an already replaced handle can be told apart.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub participant_id: String,
    pub link_id: u64,
    pub kind: ConnectionEventKind,
}

/// Where a connection handle reports its callbacks.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    participant_id: String,
    link_id: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEvents {
    pub fn new(
        participant_id: impl Into<String>,
        link_id: u64,
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            link_id,
            tx,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn event(&self, kind: ConnectionEventKind) -> ConnectionEvent {
        ConnectionEvent {
            participant_id: self.participant_id.clone(),
            link_id: self.link_id,
            kind,
        }
    }

    pub fn emit(&self, kind: ConnectionEventKind) {
        if self.tx.send(self.event(kind)).is_err() {
            trace!(peer = %self.participant_id, "event dropped, call already torn down");
        }
    }
}

/// One direct connection to a remote participant.
///
/// `create_offer` and `create_answer` also apply the generated description
/// locally, so a successful return means the local description is set.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_tracks(&self, tracks: &[LocalTrack]) -> Result<()>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Non-blocking; the handle is unusable afterwards.
    fn close(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert!(candidate.username_fragment.is_none());

        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMLineIndex"], 0);
    }

    #[test]
    fn description_type_is_lowercase() {
        let value = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(value["type"], "answer");
        let rollback: SessionDescription = serde_json::from_str(r#"{"type":"rollback"}"#).unwrap();
        assert_eq!(rollback.kind, SdpKind::Rollback);
        assert!(rollback.sdp.is_empty());
    }

    #[test]
    fn emit_after_teardown_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = ConnectionEvents::new("u2", 7, tx);
        drop(rx);
        events.emit(ConnectionEventKind::NegotiationNeeded);
        assert_eq!(events.link_id(), 7);
    }
}
