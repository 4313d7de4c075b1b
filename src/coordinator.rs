//! Call lifecycle: joining a room, turning signaling traffic and connection
//! callbacks into negotiation steps, and tearing everything down again.
//!
//! Every inbound message and connection callback is handled by one dispatch
//! task, one at a time. The call state sits behind a single mutex that is
//! never held across an await; after each await the continuation re-checks
//! that its link is still live and still the current one for that peer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::CallConfig;
use crate::connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionEvents, ConnectionFactory, ConnectionState, IceCandidate,
    PeerConnection, RemoteTrack, SessionDescription,
};
use crate::error::{CallError, Result};
use crate::media::{LocalMedia, MediaConstraints};
use crate::negotiation::{
    offer_disposition, CandidateDisposition, FailureAction, Liveness, NegotiationState, OfferDisposition, PeerLink,
    Role, Transition,
};
use crate::registry::{Participant, PeerRegistry};
use crate::signaling::{ChannelEvent, ChannelEvents, SignalMessage, SignalSink, SignalingConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    NotJoined,
    Joining,
    Joined,
    Ended,
}

/// What renderers and front-ends observe about the call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    PeerJoined(Participant),
    PeerLeft(Participant),
    PeerStateChanged {
        participant_id: String,
        state: ConnectionState,
    },
    TrackReceived {
        participant_id: String,
        track: RemoteTrack,
    },
    /// `reason` is set when the call ended without the user leaving.
    CallEnded { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGrant {
    pub allowed: bool,
    pub display_name: String,
}

/// Decides whether the local user may join a room, and under which name.
#[async_trait]
pub trait SessionPermissions: Send + Sync {
    async fn check(&self, room_id: &str, user_id: &str) -> Result<JoinGrant>;
}

/// Grants (or refuses) every room with a fixed display name.
pub struct StaticPermissions {
    allowed: bool,
    display_name: Option<String>,
}

impl StaticPermissions {
    pub fn allow(display_name: Option<String>) -> Self {
        Self {
            allowed: true,
            display_name,
        }
    }

    pub fn deny() -> Self {
        Self {
            allowed: false,
            display_name: None,
        }
    }
}

#[async_trait]
impl SessionPermissions for StaticPermissions {
    async fn check(&self, _room_id: &str, user_id: &str) -> Result<JoinGrant> {
        Ok(JoinGrant {
            allowed: self.allowed,
            display_name: self.display_name.clone().unwrap_or_else(|| user_id.to_string()),
        })
    }
}

struct CallInner {
    phase: CallPhase,
    room_id: Option<String>,
    local_name: String,
    media: Option<Arc<LocalMedia>>,
    signal: Option<Arc<dyn SignalSink>>,
    registry: PeerRegistry,
    connection_tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    shutdown: Option<watch::Sender<bool>>,
}

struct Shared {
    local_id: String,
    config: CallConfig,
    factory: Arc<dyn ConnectionFactory>,
    connector: Arc<dyn SignalingConnector>,
    permissions: Arc<dyn SessionPermissions>,
    state: Mutex<CallInner>,
    events: broadcast::Sender<CallEvent>,
    phase: watch::Sender<CallPhase>,
}

/// Handle to one call. Clones share the same call.
#[derive(Clone)]
pub struct CallCoordinator {
    shared: Arc<Shared>,
}

impl CallCoordinator {
    pub fn new(
        local_id: impl Into<String>,
        config: CallConfig,
        factory: Arc<dyn ConnectionFactory>,
        connector: Arc<dyn SignalingConnector>,
        permissions: Arc<dyn SessionPermissions>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (phase, _) = watch::channel(CallPhase::NotJoined);
        let local_id = local_id.into();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CallInner {
                    phase: CallPhase::NotJoined,
                    room_id: None,
                    local_name: local_id.clone(),
                    media: None,
                    signal: None,
                    registry: PeerRegistry::new(),
                    connection_tx: None,
                    shutdown: None,
                }),
                local_id,
                config,
                factory,
                connector,
                permissions,
                events,
                phase,
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    /// Opens the capture device for the next call.
    pub async fn acquire_media(&self, constraints: &MediaConstraints) -> Result<Arc<LocalMedia>> {
        let media = Arc::new(LocalMedia::acquire(constraints).await?);
        self.set_local_media(media.clone());
        Ok(media)
    }

    pub fn set_local_media(&self, media: Arc<LocalMedia>) {
        self.shared.state.lock().media = Some(media);
    }

    pub fn local_media(&self) -> Option<Arc<LocalMedia>> {
        self.shared.state.lock().media.clone()
    }

    pub fn phase(&self) -> CallPhase {
        self.shared.state.lock().phase
    }

    pub fn watch_phase(&self) -> watch::Receiver<CallPhase> {
        self.shared.phase.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.shared.state.lock().registry.participants()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    pub fn peer_state(&self, participant_id: &str) -> Option<NegotiationState> {
        self.shared.state.lock().registry.get(participant_id).map(PeerLink::state)
    }

    /// Joins `room_id`: checks permission, opens the signaling channel and
    /// starts dispatching. A no-op while a join is in progress or done.
    pub async fn join(&self, room_id: &str) -> Result<()> {
        if room_id.is_empty() {
            return Err(CallError::NoRoom);
        }
        let prior = {
            let mut inner = self.shared.state.lock();
            if matches!(inner.phase, CallPhase::Joining | CallPhase::Joined) {
                debug!(room = %room_id, "join already in progress");
                return Ok(());
            }
            match &inner.media {
                Some(media) if !media.is_released() => {}
                _ => return Err(CallError::MediaNotAcquired),
            }
            let prior = inner.phase;
            inner.room_id = Some(room_id.to_string());
            self.set_phase(&mut inner, CallPhase::Joining);
            prior
        };

        let grant = match self.shared.permissions.check(room_id, &self.shared.local_id).await {
            Ok(grant) if grant.allowed => grant,
            Ok(_) => {
                self.abandon_join(prior);
                return Err(CallError::NotPermitted(room_id.to_string()));
            }
            Err(e) => {
                self.abandon_join(prior);
                return Err(e);
            }
        };

        let (signal, inbound) = match self
            .shared
            .connector
            .connect(room_id, &self.shared.local_id, &grant.display_name)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                self.abandon_join(prior);
                return Err(e);
            }
        };

        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut inner = self.shared.state.lock();
            if inner.phase != CallPhase::Joining {
                // Left while the channel was opening; the join already went out.
                info!(room = %room_id, "call left during join");
                let _ = signal.send(SignalMessage::Leave {
                    room_id: room_id.to_string(),
                    leaving_user_id: self.shared.local_id.clone(),
                    leaving_user_name: grant.display_name,
                });
                return Ok(());
            }
            inner.local_name = grant.display_name;
            inner.signal = Some(signal);
            inner.connection_tx = Some(connection_tx);
            inner.shutdown = Some(shutdown_tx);
            self.set_phase(&mut inner, CallPhase::Joined);
        }
        info!(room = %room_id, user = %self.shared.local_id, "joined call");

        tokio::spawn(self.clone().run(inbound, connection_rx, shutdown_rx));
        Ok(())
    }

    /// Announces departure, closes every peer link and releases local
    /// media. Safe to call in any phase; only the first call has effect.
    pub fn leave(&self) -> bool {
        self.teardown(None, true)
    }

    fn fail_call(&self, reason: String) {
        if self.teardown(Some(reason.clone()), false) {
            warn!("call ended: {reason}");
        }
    }

    fn teardown(&self, reason: Option<String>, announce: bool) -> bool {
        let (links, media) = {
            let mut inner = self.shared.state.lock();
            if inner.phase == CallPhase::Ended {
                return false;
            }
            if announce {
                if let (Some(signal), Some(room_id)) = (inner.signal.as_ref(), inner.room_id.as_ref()) {
                    let leave = SignalMessage::Leave {
                        room_id: room_id.clone(),
                        leaving_user_id: self.shared.local_id.clone(),
                        leaving_user_name: inner.local_name.clone(),
                    };
                    if let Err(e) = signal.send(leave) {
                        warn!("could not announce leave: {e}");
                    }
                }
            }
            inner.signal = None;
            inner.connection_tx = None;
            if let Some(shutdown) = inner.shutdown.take() {
                let _ = shutdown.send(true);
            }
            let links = inner.registry.drain_all();
            let media = inner.media.take();
            self.set_phase(&mut inner, CallPhase::Ended);
            (links, media)
        };

        if let Some(media) = media {
            media.release();
        }
        info!(peers = links.len(), "call torn down");
        for link in links {
            self.emit(CallEvent::PeerLeft(link.participant().clone()));
        }
        self.emit(CallEvent::CallEnded { reason });
        true
    }

    fn abandon_join(&self, prior: CallPhase) {
        let mut inner = self.shared.state.lock();
        if inner.phase == CallPhase::Joining {
            inner.room_id = None;
            self.set_phase(&mut inner, prior);
        }
    }

    fn set_phase(&self, inner: &mut CallInner, phase: CallPhase) {
        inner.phase = phase;
        self.shared.phase.send_replace(phase);
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    async fn run(
        self,
        mut inbound: ChannelEvents,
        mut connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = inbound.recv() => match event {
                    Some(ChannelEvent::Message(message)) => self.handle_signal(message).await,
                    Some(ChannelEvent::Disconnected(reason)) => {
                        self.fail_call(CallError::ChannelDisconnected(reason).to_string());
                        break;
                    }
                    None => {
                        self.fail_call(CallError::ChannelDisconnected("channel dropped".into()).to_string());
                        break;
                    }
                },
                Some(event) = connection_rx.recv() => self.handle_connection_event(event).await,
            }
        }
        debug!("dispatch loop stopped");
    }

    fn accepts(&self, message: &SignalMessage) -> bool {
        let sender = message.sender();
        if sender.is_empty() {
            warn!(kind = message.kind(), "dropping message without sender");
            return false;
        }
        if sender == self.shared.local_id {
            trace!(kind = message.kind(), "ignoring own message");
            return false;
        }
        if let Some(target) = message.target() {
            if target != self.shared.local_id {
                trace!(kind = message.kind(), to = target, "message addressed to someone else");
                return false;
            }
        }
        true
    }

    async fn handle_signal(&self, message: SignalMessage) {
        if !self.accepts(&message) {
            return;
        }
        if self.phase() != CallPhase::Joined {
            debug!(kind = message.kind(), "not joined, dropping message");
            return;
        }

        let result = match message {
            SignalMessage::Join { user_id, user_name, .. } => self.on_peer_joined(user_id, user_name).await,
            SignalMessage::Offer { sender_id, offer, .. } => self.on_offer(sender_id, offer).await,
            SignalMessage::Answer { sender_id, answer, .. } => self.on_answer(sender_id, answer).await,
            SignalMessage::Candidate {
                sender_id, candidate, ..
            } => self.on_candidate(sender_id, candidate).await,
            SignalMessage::Leave { leaving_user_id, .. } => {
                if !self.remove_peer(&leaving_user_id, "left the room") {
                    debug!(peer = %leaving_user_id, "leave for unknown participant");
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            self.report(e);
        }
    }

    /// Call-fatal errors end the call; everything else only concerns one peer.
    fn report(&self, error: CallError) {
        match error {
            e if e.is_call_fatal() => self.fail_call(e.to_string()),
            e @ (CallError::NegotiationStale { .. } | CallError::PeerGone(_)) => debug!("{e}"),
            e => warn!("{e}"),
        }
    }

    async fn on_peer_joined(&self, id: String, name: String) -> Result<()> {
        {
            let mut inner = self.shared.state.lock();
            if inner.registry.contains(&id) {
                inner.registry.rename(&id, &name);
                debug!(peer = %id, "already linked");
                return Ok(());
            }
        }
        let participant = if name.is_empty() {
            Participant::unnamed(id.clone())
        } else {
            Participant::new(id.clone(), name)
        };
        self.open_link(participant, Role::Initiator).await?;
        self.start_offer(&id, false).await
    }

    /// Creates the connection, attaches local media and registers the link.
    async fn open_link(&self, participant: Participant, role: Role) -> Result<()> {
        let id = participant.id.clone();
        let link = self.new_link(participant.clone(), role).await?;
        let connection = link.connection();
        let created = {
            let mut inner = self.shared.state.lock();
            if inner.phase == CallPhase::Joined {
                Some(inner.registry.upsert(link).1)
            } else {
                None
            }
        };
        match created {
            Some(true) => {
                info!(peer = %id, ?role, "peer link created");
                self.emit(CallEvent::PeerJoined(participant));
                Ok(())
            }
            Some(false) => Ok(()),
            None => {
                connection.close();
                Err(CallError::PeerGone(id))
            }
        }
    }

    /// Moves `id` onto a fresh connection with the same role. Fails with
    /// `PeerGone` if the link changed while the new handle was being built.
    async fn replace_link(&self, id: &str, stale_link_id: u64) -> Result<(Arc<dyn PeerConnection>, Liveness, u64)> {
        let (participant, role) = {
            let mut inner = self.shared.state.lock();
            let link = inner
                .registry
                .get_current(id, stale_link_id)
                .ok_or_else(|| CallError::PeerGone(id.to_string()))?;
            (link.participant().clone(), link.role())
        };

        let link = self.new_link(participant, role).await?;
        let fresh = (link.connection(), link.liveness(), link.link_id());
        let replaced = {
            let mut inner = self.shared.state.lock();
            if inner.phase == CallPhase::Joined && inner.registry.get_current(id, stale_link_id).is_some() {
                inner.registry.replace(link).is_some()
            } else {
                false
            }
        };
        if !replaced {
            fresh.0.close();
            return Err(CallError::PeerGone(id.to_string()));
        }
        debug!(peer = %id, from = stale_link_id, to = fresh.2, "link replaced");
        Ok(fresh)
    }

    async fn new_link(&self, participant: Participant, role: Role) -> Result<PeerLink> {
        let id = participant.id.clone();
        let (link_id, connection_tx, media) = {
            let mut inner = self.shared.state.lock();
            if inner.phase != CallPhase::Joined {
                return Err(CallError::PeerGone(id));
            }
            let connection_tx = inner
                .connection_tx
                .clone()
                .ok_or_else(|| CallError::PeerGone(id.clone()))?;
            let media = inner.media.clone().ok_or(CallError::MediaNotAcquired)?;
            (inner.registry.allocate_link_id(), connection_tx, media)
        };

        let events = ConnectionEvents::new(id.clone(), link_id, connection_tx);
        let connection = self.shared.factory.create(events).await?;
        if let Err(e) = media.attach_to(connection.as_ref()).await {
            connection.close();
            return Err(e);
        }
        Ok(PeerLink::new(link_id, participant, role, connection))
    }

    /// Generates and sends an offer on the current link for `id`.
    async fn start_offer(&self, id: &str, ice_restart: bool) -> Result<()> {
        let (connection, liveness, link_id) = {
            let inner = self.shared.state.lock();
            let link = inner
                .registry
                .get(id)
                .ok_or_else(|| CallError::PeerGone(id.to_string()))?;
            link.check(Transition::LocalOffer)?;
            (link.connection(), link.liveness(), link.link_id())
        };

        let offer = match connection.create_offer(ice_restart).await {
            Ok(offer) => offer,
            Err(e) => {
                self.drop_link(id, link_id, "offer failed");
                return Err(e);
            }
        };
        self.advance(id, link_id, &liveness, Transition::LocalOffer)?;
        debug!(peer = %id, ice_restart, "sending offer");
        self.send(SignalMessage::Offer {
            room_id: self.room_id(),
            sender_id: self.shared.local_id.clone(),
            target_id: id.to_string(),
            offer,
        })
    }

    async fn on_offer(&self, sender: String, offer: SessionDescription) -> Result<()> {
        let known = self.shared.state.lock().registry.contains(&sender);
        if !known {
            self.open_link(Participant::unnamed(sender.clone()), Role::Receiver).await?;
        }

        let (mut connection, mut liveness, mut link_id, state) = {
            let inner = self.shared.state.lock();
            let link = inner
                .registry
                .get(&sender)
                .ok_or_else(|| CallError::PeerGone(sender.clone()))?;
            (link.connection(), link.liveness(), link.link_id(), link.state())
        };

        match offer_disposition(state, &self.shared.local_id, &sender) {
            OfferDisposition::Accept => {}
            OfferDisposition::RollbackAndAccept => {
                info!(peer = %sender, "offer collision, abandoning local offer");
                match self.replace_link(&sender, link_id).await {
                    Ok(fresh) => (connection, liveness, link_id) = fresh,
                    Err(e) => {
                        if !matches!(e, CallError::PeerGone(_)) && !e.is_call_fatal() {
                            self.drop_link(&sender, link_id, "collision could not be resolved");
                        }
                        return Err(e);
                    }
                }
            }
            OfferDisposition::Ignore => {
                info!(peer = %sender, "offer collision, keeping local offer");
                return Ok(());
            }
            OfferDisposition::Stale => {
                return Err(CallError::NegotiationStale {
                    peer: sender,
                    message: "offer",
                    state: state.to_string(),
                })
            }
        };

        if let Err(e) = self
            .answer_offer(&sender, link_id, &liveness, connection, offer)
            .await
        {
            if !matches!(e, CallError::PeerGone(_)) && !e.is_call_fatal() {
                self.drop_link(&sender, link_id, "offer could not be answered");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn answer_offer(
        &self,
        sender: &str,
        link_id: u64,
        liveness: &Liveness,
        connection: Arc<dyn PeerConnection>,
        offer: SessionDescription,
    ) -> Result<()> {
        connection.set_remote_description(offer).await?;
        self.advance(sender, link_id, liveness, Transition::RemoteOffer)?;

        let answer = connection.create_answer().await?;
        self.advance(sender, link_id, liveness, Transition::LocalAnswer)?;
        self.send(SignalMessage::Answer {
            room_id: self.room_id(),
            sender_id: self.shared.local_id.clone(),
            target_id: sender.to_string(),
            answer,
        })?;

        self.flush_candidates(sender, connection.as_ref()).await;
        Ok(())
    }

    async fn on_answer(&self, sender: String, answer: SessionDescription) -> Result<()> {
        let (connection, liveness, link_id) = {
            let inner = self.shared.state.lock();
            let link = inner.registry.get(&sender).ok_or_else(|| CallError::NegotiationStale {
                peer: sender.clone(),
                message: "answer",
                state: "unknown".into(),
            })?;
            link.check(Transition::RemoteAnswer)?;
            (link.connection(), link.liveness(), link.link_id())
        };

        if let Err(e) = connection.set_remote_description(answer).await {
            self.drop_link(&sender, link_id, "answer rejected");
            return Err(e);
        }
        self.advance(&sender, link_id, &liveness, Transition::RemoteAnswer)?;
        self.flush_candidates(&sender, connection.as_ref()).await;
        Ok(())
    }

    async fn on_candidate(&self, sender: String, candidate: IceCandidate) -> Result<()> {
        let connection = {
            let mut inner = self.shared.state.lock();
            let target = inner
                .registry
                .get(&sender)
                .map(|link| (link.candidate_disposition(), link.connection()));
            match target {
                Some((CandidateDisposition::Apply, connection)) => connection,
                Some((CandidateDisposition::Drop, _)) => {
                    debug!(peer = %sender, "dropping candidate for closed link");
                    return Ok(());
                }
                Some((CandidateDisposition::Buffer, _)) | None => {
                    match inner.registry.candidates_mut().enqueue(&sender, candidate) {
                        Some(pending) => trace!(peer = %sender, pending, "candidate buffered"),
                        None => debug!(peer = %sender, "candidate buffer full, dropping candidate"),
                    }
                    return Ok(());
                }
            }
        };
        connection.add_ice_candidate(candidate).await
    }

    /// Applies the candidates queued before the remote description was set.
    async fn flush_candidates(&self, id: &str, connection: &dyn PeerConnection) {
        let queued = self.shared.state.lock().registry.candidates_mut().drain(id);
        if queued.is_empty() {
            return;
        }
        debug!(peer = %id, count = queued.len(), "applying buffered candidates");
        for candidate in queued {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(peer = %id, "buffered candidate rejected: {e}");
            }
        }
    }

    fn advance(&self, id: &str, link_id: u64, liveness: &Liveness, transition: Transition) -> Result<NegotiationState> {
        if !liveness.is_live() {
            return Err(CallError::PeerGone(id.to_string()));
        }
        let mut inner = self.shared.state.lock();
        let link = inner
            .registry
            .get_current(id, link_id)
            .ok_or_else(|| CallError::PeerGone(id.to_string()))?;
        let state = link.transition(transition)?;
        trace!(peer = %id, %state, "negotiation advanced");
        Ok(state)
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        let ConnectionEvent {
            participant_id: id,
            link_id,
            kind,
        } = event;
        let current = self.shared.state.lock().registry.get_current(&id, link_id).is_some();
        if !current {
            trace!(peer = %id, link_id, "event from a replaced connection");
            return;
        }

        match kind {
            ConnectionEventKind::LocalCandidate(candidate) => {
                let message = SignalMessage::Candidate {
                    room_id: self.room_id(),
                    sender_id: self.shared.local_id.clone(),
                    target_id: id.clone(),
                    candidate,
                };
                if let Err(e) = self.send(message) {
                    self.report(e);
                }
            }
            ConnectionEventKind::StateChanged(state) => self.on_state_changed(&id, link_id, state).await,
            ConnectionEventKind::NegotiationNeeded => {
                let wants = self
                    .shared
                    .state
                    .lock()
                    .registry
                    .get(&id)
                    .is_some_and(PeerLink::wants_renegotiation);
                if wants {
                    if let Err(e) = self.start_offer(&id, false).await {
                        self.report(e);
                    }
                }
            }
            ConnectionEventKind::Track(track) => {
                info!(peer = %id, track = %track.id, kind = ?track.kind, "remote track");
                self.emit(CallEvent::TrackReceived {
                    participant_id: id,
                    track,
                });
            }
        }
    }

    async fn on_state_changed(&self, id: &str, link_id: u64, state: ConnectionState) {
        info!(peer = %id, %state, "connection state changed");
        self.emit(CallEvent::PeerStateChanged {
            participant_id: id.to_string(),
            state,
        });

        match state {
            ConnectionState::Connected => {
                if let Some(link) = self.shared.state.lock().registry.get_current(id, link_id) {
                    link.record_connected();
                }
            }
            ConnectionState::Failed => {
                let max_retries = self.shared.config.max_ice_retries;
                let action = self
                    .shared
                    .state
                    .lock()
                    .registry
                    .get_current(id, link_id)
                    .map(|link| link.record_failure(max_retries));
                match action {
                    Some(FailureAction::RestartIce) => {
                        warn!(peer = %id, "connectivity failed, restarting ICE");
                        if let Err(e) = self.start_offer(id, true).await {
                            self.report(e);
                        }
                    }
                    Some(FailureAction::Wait) => {
                        info!(peer = %id, "connectivity failed, waiting for the initiator to restart");
                    }
                    Some(FailureAction::GiveUp { attempts }) => {
                        let err = CallError::ConnectivityFailed {
                            peer: id.to_string(),
                            attempts,
                        };
                        warn!("{err}");
                        self.drop_link(id, link_id, "connectivity failed");
                    }
                    None => {}
                }
            }
            ConnectionState::Closed => {
                self.drop_link(id, link_id, "connection closed");
            }
            _ => {}
        }
    }

    /// Removes the link for `id`, whatever its generation.
    fn remove_peer(&self, id: &str, reason: &str) -> bool {
        let removed = self.shared.state.lock().registry.remove(id);
        self.peer_removed(removed, reason)
    }

    /// Removes the link for `id` only if it is still `link_id`.
    fn drop_link(&self, id: &str, link_id: u64, reason: &str) -> bool {
        let removed = {
            let mut inner = self.shared.state.lock();
            if inner.registry.get_current(id, link_id).is_some() {
                inner.registry.remove(id)
            } else {
                None
            }
        };
        self.peer_removed(removed, reason)
    }

    fn peer_removed(&self, removed: Option<PeerLink>, reason: &str) -> bool {
        match removed {
            Some(link) => {
                info!(peer = %link.participant().id, reason, "peer removed");
                self.emit(CallEvent::PeerLeft(link.participant().clone()));
                true
            }
            None => false,
        }
    }

    fn send(&self, message: SignalMessage) -> Result<()> {
        let signal = self.shared.state.lock().signal.clone();
        signal
            .ok_or_else(|| CallError::ChannelDisconnected("not joined".into()))?
            .send(message)
    }

    fn room_id(&self) -> String {
        self.shared.state.lock().room_id.clone().unwrap_or_default()
    }
}
