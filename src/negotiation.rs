//! Per-peer offer/answer state machine.
//!
//! The state field only changes through [`PeerLink::transition`], which
//! consults the table in [`NegotiationState::next`]. Connection callbacks
//! and signaling messages are turned into transitions by the coordinator.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::connection::PeerConnection;
use crate::error::{CallError, Result};
use crate::registry::Participant;

/// Fixed at link creation. Only the initiator ever offers on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::HaveLocalOffer => write!(f, "have-local-offer"),
            NegotiationState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            NegotiationState::Stable => write!(f, "stable"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    LocalOffer,
    RemoteOffer,
    LocalAnswer,
    RemoteAnswer,
    Close,
}

impl Transition {
    fn label(self) -> &'static str {
        match self {
            Transition::LocalOffer => "local offer",
            Transition::RemoteOffer => "offer",
            Transition::LocalAnswer => "local answer",
            Transition::RemoteAnswer => "answer",
            Transition::Close => "close",
        }
    }
}

impl NegotiationState {
    /// Transition table. `None` means the input is stale for this state.
    pub fn next(self, transition: Transition) -> Option<NegotiationState> {
        use NegotiationState::*;
        match (self, transition) {
            (Closed, _) => None,
            (_, Transition::Close) => Some(Closed),
            (Idle | Stable, Transition::LocalOffer) => Some(HaveLocalOffer),
            (Idle | Stable, Transition::RemoteOffer) => Some(HaveRemoteOffer),
            (HaveRemoteOffer, Transition::LocalAnswer) => Some(Stable),
            (HaveLocalOffer, Transition::RemoteAnswer) => Some(Stable),
            _ => None,
        }
    }

    pub fn is_stable(self) -> bool {
        self == NegotiationState::Stable
    }
}

/// What to do with an incoming offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    Accept,
    /// Give up the local offer and take the remote one. The pending local
    /// description cannot be rolled back in place, so the caller moves the
    /// peer onto a fresh connection first.
    RollbackAndAccept,
    Ignore,
    Stale,
}

/// Glare resolution: with both sides holding a local offer, the side with
/// the lexicographically larger id rolls back. The outcome depends only on
/// the id pair, never on arrival timing.
pub fn offer_disposition(state: NegotiationState, local_id: &str, sender_id: &str) -> OfferDisposition {
    match state {
        NegotiationState::Idle | NegotiationState::Stable => OfferDisposition::Accept,
        NegotiationState::HaveLocalOffer if local_id > sender_id => OfferDisposition::RollbackAndAccept,
        NegotiationState::HaveLocalOffer => OfferDisposition::Ignore,
        NegotiationState::HaveRemoteOffer | NegotiationState::Closed => OfferDisposition::Stale,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Apply,
    Buffer,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    RestartIce,
    /// The initiator owns restarts; wait for its offer.
    Wait,
    GiveUp { attempts: u32 },
}

/// Shared flag checked by negotiation continuations after every await.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PeerLink {
    link_id: u64,
    participant: Participant,
    role: Role,
    state: NegotiationState,
    connection: Arc<dyn PeerConnection>,
    retry_count: u32,
    remote_description_set: bool,
    liveness: Liveness,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("link_id", &self.link_id)
            .field("participant", &self.participant)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl PeerLink {
    pub fn new(
        link_id: u64,
        participant: Participant,
        role: Role,
        connection: Arc<dyn PeerConnection>,
    ) -> Self {
        Self {
            link_id,
            participant,
            role,
            state: NegotiationState::Idle,
            connection,
            retry_count: 0,
            remote_description_set: false,
            liveness: Liveness::new(),
        }
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub(crate) fn participant_mut(&mut self) -> &mut Participant {
        &mut self.participant
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn connection(&self) -> Arc<dyn PeerConnection> {
        Arc::clone(&self.connection)
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// The state `transition` would lead to, without taking it.
    pub fn check(&self, transition: Transition) -> Result<NegotiationState> {
        self.state.next(transition).ok_or_else(|| CallError::NegotiationStale {
            peer: self.participant.id.clone(),
            message: transition.label(),
            state: self.state.to_string(),
        })
    }

    pub fn transition(&mut self, transition: Transition) -> Result<NegotiationState> {
        let next = self.check(transition)?;
        if matches!(transition, Transition::RemoteOffer | Transition::RemoteAnswer) {
            self.remote_description_set = true;
        }
        self.state = next;
        Ok(next)
    }

    pub fn candidate_disposition(&self) -> CandidateDisposition {
        match self.state {
            NegotiationState::Closed => CandidateDisposition::Drop,
            _ if self.remote_description_set => CandidateDisposition::Apply,
            _ => CandidateDisposition::Buffer,
        }
    }

    /// Whether a negotiation-needed callback should produce a fresh offer.
    pub fn wants_renegotiation(&self) -> bool {
        self.role == Role::Initiator && self.state.is_stable()
    }

    pub fn record_failure(&mut self, max_retries: u32) -> FailureAction {
        self.retry_count += 1;
        if self.retry_count >= max_retries {
            FailureAction::GiveUp {
                attempts: self.retry_count,
            }
        } else if self.wants_renegotiation() {
            FailureAction::RestartIce
        } else {
            FailureAction::Wait
        }
    }

    pub fn record_connected(&mut self) {
        self.retry_count = 0;
    }

    /// Absorbing. Marks pending continuations dead and closes the handle.
    pub(crate) fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.liveness.kill();
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;

    fn link(role: Role) -> (PeerLink, Arc<MockConnection>) {
        let connection = Arc::new(MockConnection::new("b"));
        let link = PeerLink::new(1, Participant::new("b", "Bea"), role, connection.clone());
        (link, connection)
    }

    #[test]
    fn offer_answer_reaches_stable() {
        let (mut initiator, _) = link(Role::Initiator);
        initiator.transition(Transition::LocalOffer).unwrap();
        assert_eq!(initiator.transition(Transition::RemoteAnswer).unwrap(), NegotiationState::Stable);

        let (mut receiver, _) = link(Role::Receiver);
        receiver.transition(Transition::RemoteOffer).unwrap();
        assert_eq!(receiver.transition(Transition::LocalAnswer).unwrap(), NegotiationState::Stable);
    }

    #[test]
    fn answer_outside_local_offer_is_stale() {
        let (mut link, _) = link(Role::Receiver);
        assert!(link.check(Transition::RemoteAnswer).is_err());
        let err = link.transition(Transition::RemoteAnswer).unwrap_err();
        assert!(matches!(err, CallError::NegotiationStale { message: "answer", .. }));
        assert_eq!(link.state(), NegotiationState::Idle);
    }

    #[test]
    fn closed_absorbs_everything() {
        for transition in [
            Transition::LocalOffer,
            Transition::RemoteOffer,
            Transition::LocalAnswer,
            Transition::RemoteAnswer,
            Transition::Close,
        ] {
            assert_eq!(NegotiationState::Closed.next(transition), None);
        }
        assert_eq!(NegotiationState::HaveRemoteOffer.next(Transition::Close), Some(NegotiationState::Closed));
    }

    #[test]
    fn tie_break_is_a_function_of_the_id_pair() {
        let state = NegotiationState::HaveLocalOffer;
        assert_eq!(offer_disposition(state, "b", "a"), OfferDisposition::RollbackAndAccept);
        assert_eq!(offer_disposition(state, "a", "b"), OfferDisposition::Ignore);
        assert_eq!(offer_disposition(NegotiationState::Stable, "a", "b"), OfferDisposition::Accept);
        assert_eq!(offer_disposition(NegotiationState::Closed, "a", "b"), OfferDisposition::Stale);
    }

    #[test]
    fn candidates_buffer_until_remote_description() {
        let (mut link, _) = link(Role::Initiator);
        assert_eq!(link.candidate_disposition(), CandidateDisposition::Buffer);
        link.transition(Transition::LocalOffer).unwrap();
        assert_eq!(link.candidate_disposition(), CandidateDisposition::Buffer);
        link.transition(Transition::RemoteAnswer).unwrap();
        assert_eq!(link.candidate_disposition(), CandidateDisposition::Apply);
        link.close();
        assert_eq!(link.candidate_disposition(), CandidateDisposition::Drop);
    }

    #[test]
    fn failures_restart_then_give_up() {
        let (mut link, _) = link(Role::Initiator);
        link.transition(Transition::LocalOffer).unwrap();
        link.transition(Transition::RemoteAnswer).unwrap();
        assert_eq!(link.record_failure(3), FailureAction::RestartIce);
        assert_eq!(link.record_failure(3), FailureAction::RestartIce);
        assert_eq!(link.record_failure(3), FailureAction::GiveUp { attempts: 3 });

        link.record_connected();
        assert_eq!(link.retry_count(), 0);
    }

    #[test]
    fn receiver_waits_for_restart() {
        let (mut link, _) = link(Role::Receiver);
        link.transition(Transition::RemoteOffer).unwrap();
        link.transition(Transition::LocalAnswer).unwrap();
        assert!(!link.wants_renegotiation());
        assert_eq!(link.record_failure(3), FailureAction::Wait);
    }

    #[test]
    fn close_kills_liveness_once() {
        let (mut link, connection) = link(Role::Receiver);
        let live = link.liveness();
        link.close();
        link.close();
        assert!(!live.is_live());
        assert_eq!(connection.close_count(), 1);
    }
}
