use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{IceCandidate, SessionDescription};
use crate::error::{CallError, Result};

const KNOWN_TYPES: [&str; 5] = ["join", "offer", "answer", "candidate", "leave"];

/// One JSON object per WebSocket text frame, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        #[serde(default)]
        room_id: String,
        user_id: String,
        #[serde(default)]
        user_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        #[serde(default)]
        room_id: String,
        #[serde(rename = "userId")]
        sender_id: String,
        target_id: String,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        #[serde(default)]
        room_id: String,
        #[serde(rename = "userId")]
        sender_id: String,
        target_id: String,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Candidate {
        #[serde(default)]
        room_id: String,
        #[serde(rename = "userId")]
        sender_id: String,
        target_id: String,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    Leave {
        #[serde(default)]
        room_id: String,
        leaving_user_id: String,
        #[serde(default)]
        leaving_user_name: String,
    },
}

impl SignalMessage {
    /// Who originated the message. For `leave` that is the departing user.
    pub fn sender(&self) -> &str {
        match self {
            SignalMessage::Join { user_id, .. } => user_id,
            SignalMessage::Offer { sender_id, .. }
            | SignalMessage::Answer { sender_id, .. }
            | SignalMessage::Candidate { sender_id, .. } => sender_id,
            SignalMessage::Leave { leaving_user_id, .. } => leaving_user_id,
        }
    }

    /// Addressee of a directed message; `None` for broadcasts.
    pub fn target(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { target_id, .. }
            | SignalMessage::Answer { target_id, .. }
            | SignalMessage::Candidate { target_id, .. } => Some(target_id),
            SignalMessage::Join { .. } | SignalMessage::Leave { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Leave { .. } => "leave",
        }
    }
}

/// Parses one text frame. `Ok(None)` for other traffic sharing the relay
/// (chat, code sync), `MalformedMessage` for a broken signaling frame.
pub fn parse_frame(text: &str) -> Result<Option<SignalMessage>> {
    let value: Value = serde_json::from_str(text).map_err(|e| CallError::MalformedMessage(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CallError::MalformedMessage("missing type".into()))?;
    if !KNOWN_TYPES.contains(&kind) {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| CallError::MalformedMessage(e.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(SignalMessage),
    /// Terminal. No further events follow.
    Disconnected(String),
}

pub trait SignalSink: Send + Sync {
    fn send(&self, message: SignalMessage) -> Result<()>;
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Opens the room-scoped channel and announces the local user.
    async fn connect(
        &self,
        room_id: &str,
        local_id: &str,
        local_name: &str,
    ) -> Result<(Arc<dyn SignalSink>, ChannelEvents)>;
}

/// WebSocket connection to the relay for one room.
pub struct SignalingChannel {
    tx: mpsc::UnboundedSender<SignalMessage>,
    reader: JoinHandle<()>,
}

pub fn room_url(base_url: &str, room_id: &str) -> Result<Url> {
    let url = Url::parse(&format!("{}/{}", base_url.trim_end_matches('/'), room_id))?;
    Ok(url)
}

impl SignalingChannel {
    pub async fn connect(
        base_url: &str,
        room_id: &str,
        local_id: &str,
        local_name: &str,
    ) -> Result<(Self, ChannelEvents)> {
        let url = room_url(base_url, room_id)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();
        info!(%url, "signaling channel open");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<SignalMessage>();

        // Handle outgoing messages. Ends with a close frame once every
        // sender is gone, after flushing what was queued.
        let writer_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to encode {} message: {e}", msg.kind());
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("signaling send failed: {e}");
                    let _ = writer_events.send(ChannelEvent::Disconnected(format!("send failed: {e}")));
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Handle incoming messages
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Ok(Some(signal)) => {
                            if events_tx.send(ChannelEvent::Message(signal)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => debug!("ignoring non-signaling frame"),
                        Err(e) => warn!("dropping frame: {e}"),
                    },
                    Some(Ok(Message::Binary(_))) => warn!("dropping frame: unexpected binary payload"),
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(|| "closed by relay".to_string(), |f| f.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = events_tx.send(ChannelEvent::Disconnected(reason));
        });

        let channel = Self {
            tx: outgoing_tx,
            reader,
        };
        channel.send(SignalMessage::Join {
            room_id: room_id.to_string(),
            user_id: local_id.to_string(),
            user_name: local_name.to_string(),
        })?;
        Ok((channel, events_rx))
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, message: SignalMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| CallError::ChannelDisconnected("writer stopped".into()))
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct WebSocketConnector {
    base_url: String,
}

impl WebSocketConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(
        &self,
        room_id: &str,
        local_id: &str,
        local_name: &str,
    ) -> Result<(Arc<dyn SignalSink>, ChannelEvents)> {
        let (channel, events) = SignalingChannel::connect(&self.base_url, room_id, local_id, local_name).await?;
        let sink: Arc<dyn SignalSink> = Arc::new(channel);
        Ok((sink, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_uses_wire_field_names() {
        let message = SignalMessage::Offer {
            room_id: "r1".into(),
            sender_id: "u1".into(),
            target_id: "u2".into(),
            offer: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "roomId": "r1",
                "userId": "u1",
                "targetId": "u2",
                "offer": { "type": "offer", "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn leave_parses_from_browser_frame() {
        let frame = r#"{"type":"leave","roomId":"r1","leavingUserId":"u3","leavingUserName":"Cleo"}"#;
        let message = parse_frame(frame).unwrap().unwrap();
        assert_eq!(message.sender(), "u3");
        assert_eq!(message.target(), None);
        assert_eq!(
            message,
            SignalMessage::Leave {
                room_id: "r1".into(),
                leaving_user_id: "u3".into(),
                leaving_user_name: "Cleo".into(),
            }
        );
    }

    #[test]
    fn candidate_frame_keeps_payload() {
        let frame = json!({
            "type": "candidate",
            "roomId": "r1",
            "userId": "u1",
            "targetId": "u2",
            "candidate": { "candidate": "candidate:0 1 UDP 1 10.0.0.2 9 typ host", "sdpMLineIndex": 0 }
        })
        .to_string();
        match parse_frame(&frame).unwrap() {
            Some(SignalMessage::Candidate { candidate, target_id, .. }) => {
                assert_eq!(target_id, "u2");
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn foreign_traffic_is_ignored_not_malformed() {
        assert_eq!(parse_frame(r#"{"type":"chat","text":"hi"}"#).unwrap(), None);
    }

    #[test]
    fn broken_frames_are_malformed() {
        for frame in [
            "not json",
            r#"{"text":"no type"}"#,
            r#"{"type":"offer","userId":"u1"}"#,
            r#"{"type":7}"#,
        ] {
            assert!(
                matches!(parse_frame(frame), Err(CallError::MalformedMessage(_))),
                "{frame}"
            );
        }
    }

    /// Accepts one client, records its first frame, then sends `frames`
    /// followed by a close.
    async fn relay(frames: Vec<String>) -> (String, JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                other => panic!("unexpected first frame {other:?}"),
            };
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            ws.send(Message::Close(None)).await.unwrap();
            first
        });
        (format!("ws://{addr}/signal"), relay)
    }

    #[tokio::test]
    async fn channel_announces_join_and_survives_garbage() {
        let leave = json!({ "type": "leave", "roomId": "r1", "leavingUserId": "u9" }).to_string();
        let (url, relay) = relay(vec!["garbage".into(), leave]).await;

        let (_channel, mut events) = SignalingChannel::connect(&url, "r1", "u1", "Ann").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Message(SignalMessage::Leave {
                room_id: "r1".into(),
                leaving_user_id: "u9".into(),
                leaving_user_name: String::new(),
            })
        );
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Disconnected(_)));

        let first = relay.await.unwrap();
        assert_eq!(
            parse_frame(&first).unwrap(),
            Some(SignalMessage::Join {
                room_id: "r1".into(),
                user_id: "u1".into(),
                user_name: "Ann".into(),
            })
        );
    }

    #[test]
    fn room_url_appends_room_segment() {
        let url = room_url("ws://localhost:8081/signal/", "session_abc").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8081/signal/session_abc");
        assert!(room_url("not a url", "r").is_err());
    }
}
