//! In-memory stand-ins for the connection, signaling and permission seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::connection::{
    ConnectionEvents, ConnectionFactory, IceCandidate, PeerConnection, SdpKind,
    SessionDescription,
};
use crate::error::{CallError, Result};
use crate::media::LocalTrack;
use crate::signaling::{ChannelEvent, ChannelEvents, SignalMessage, SignalSink, SignalingConnector};

pub fn test_track(id: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/PCMU".to_owned(),
            clock_rate: 8000,
            channels: 1,
            ..Default::default()
        },
        id.to_owned(),
        "mock".to_owned(),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTracks(usize),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
}

pub struct MockConnection {
    peer: String,
    ops: Mutex<Vec<Op>>,
    closes: AtomicUsize,
    fail_remote: Mutex<bool>,
}

impl MockConnection {
    pub fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
            ops: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_remote: Mutex::new(false),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_remote_description(&self) {
        *self.fail_remote.lock() = true;
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }

    fn offers(&self) -> usize {
        self.ops.lock().iter().filter(|op| matches!(op, Op::CreateOffer { .. })).count()
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn add_tracks(&self, tracks: &[LocalTrack]) -> Result<()> {
        self.record(Op::AddTracks(tracks.len()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.record(Op::CreateOffer { ice_restart });
        Ok(SessionDescription::offer(format!("offer-{}-{}", self.peer, self.offers())))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(Op::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer-{}", self.peer)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if std::mem::take(&mut *self.fail_remote.lock()) {
            return Err(CallError::MalformedMessage("rejected sdp".into()));
        }
        self.record(Op::SetRemote(description.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out [`MockConnection`]s and remembers each one with its event sink.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<(ConnectionEvents, Arc<MockConnection>)>>,
}

impl MockFactory {
    pub fn connections_for(&self, peer: &str) -> Vec<Arc<MockConnection>> {
        self.created
            .lock()
            .iter()
            .filter(|(events, _)| events.participant_id() == peer)
            .map(|(_, connection)| connection.clone())
            .collect()
    }

    pub fn latest(&self, peer: &str) -> Arc<MockConnection> {
        self.connections_for(peer).pop().expect("no connection for peer")
    }

    pub fn events_for(&self, peer: &str) -> ConnectionEvents {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(events, _)| events.participant_id() == peer)
            .map(|(events, _)| events.clone())
            .expect("no connection for peer")
    }

    pub fn total(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(MockConnection::new(events.participant_id()));
        self.created.lock().push((events, connection.clone()));
        Ok(connection)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SignalMessage>>,
    broken: AtomicBool,
}

impl RecordingSink {
    /// Every later send fails the way a stopped writer does.
    pub fn break_writer(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, message: SignalMessage) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(CallError::ChannelDisconnected("writer stopped".into()));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Connects instantly. The test keeps the inbound side to inject events.
#[derive(Default)]
pub struct MockConnector {
    pub sink: Arc<RecordingSink>,
    inbound: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    connects: AtomicUsize,
    rooms: Mutex<HashMap<String, usize>>,
}

impl MockConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn inject(&self, event: ChannelEvent) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn joins_for(&self, room: &str) -> usize {
        self.rooms.lock().get(room).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SignalingConnector for MockConnector {
    async fn connect(
        &self,
        room_id: &str,
        local_id: &str,
        local_name: &str,
    ) -> Result<(Arc<dyn SignalSink>, ChannelEvents)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.rooms.lock().entry(room_id.to_string()).or_default() += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        self.sink.send(SignalMessage::Join {
            room_id: room_id.to_string(),
            user_id: local_id.to_string(),
            user_name: local_name.to_string(),
        })?;
        let sink: Arc<dyn SignalSink> = self.sink.clone();
        Ok((sink, rx))
    }
}
