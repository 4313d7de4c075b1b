use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum CallError {
    /// Capture device missing or permission denied. Fatal to starting a call.
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("local media has not been acquired")]
    MediaNotAcquired,

    /// The signaling transport went away. Fatal to the whole call.
    #[error("signaling channel disconnected: {0}")]
    ChannelDisconnected(String),

    /// A message arrived for a peer whose negotiation state cannot accept it.
    #[error("stale {message} for peer {peer} in state {state}")]
    NegotiationStale {
        peer: String,
        message: &'static str,
        state: String,
    },

    /// ICE connectivity failed past the retry budget for one peer.
    #[error("connectivity to peer {peer} failed after {attempts} attempts")]
    ConnectivityFailed { peer: String, attempts: u32 },

    #[error("malformed signaling message: {0}")]
    MalformedMessage(String),

    #[error("not permitted to join room {0}")]
    NotPermitted(String),

    #[error("no room id given")]
    NoRoom,

    #[error("peer {0} is no longer live")]
    PeerGone(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid signaling url: {0}")]
    Url(#[from] url::ParseError),
}

impl CallError {
    /// Call-scoped failures sweep every peer before surfacing; all others
    /// stay confined to the peer they concern.
    pub fn is_call_fatal(&self) -> bool {
        matches!(
            self,
            CallError::MediaUnavailable(_)
                | CallError::MediaNotAcquired
                | CallError::ChannelDisconnected(_)
                | CallError::NotPermitted(_)
                | CallError::NoRoom
                | CallError::Ws(_)
                | CallError::Url(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
