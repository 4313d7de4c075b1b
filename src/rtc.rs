use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::connection::{
    ConnectionEventKind, ConnectionEvents, ConnectionFactory, ConnectionState, IceCandidate, PeerConnection,
    RemoteTrack, SdpKind, SessionDescription, TrackKind,
};
use crate::error::Result;
use crate::media::LocalTrack;

/// Builds webrtc-rs peer connections wired to report into the coordinator.
pub struct WebRtcConnectionFactory {
    api: API,
    config: CallConfig,
}

impl WebRtcConnectionFactory {
    pub fn new(config: CallConfig) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let api = APIBuilder::new().with_media_engine(media_engine).build();
        Ok(Self { api, config })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.rtc_configuration()).await?);
        let peer = events.participant_id().to_string();
        debug!(%peer, link = events.link_id(), "created peer connection");

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => sink.emit(ConnectionEventKind::LocalCandidate(init.into())),
                    Err(e) => warn!(peer = %sink.participant_id(), "unusable local candidate: {e}"),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                debug!(peer = %sink.participant_id(), "ICE connection state has changed: {s}");
                let state = match s {
                    RTCIceConnectionState::Checking => ConnectionState::Checking,
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => ConnectionState::Connected,
                    RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCIceConnectionState::Failed => ConnectionState::Failed,
                    _ => return,
                };
                sink.emit(ConnectionEventKind::StateChanged(state));
            })
        }));

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                debug!(peer = %sink.participant_id(), "peer connection state has changed: {s}");
                if s == RTCPeerConnectionState::Closed {
                    sink.emit(ConnectionEventKind::StateChanged(ConnectionState::Closed));
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(ConnectionEventKind::NegotiationNeeded);
            })
        }));

        let sink = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    info!(peer = %sink.participant_id(), ?kind, "remote track received");
                    sink.emit(ConnectionEventKind::Track(RemoteTrack {
                        id: track.id(),
                        kind,
                        remote: Some(track),
                    }));
                })
            },
        ));

        Ok(Arc::new(RtcConnection {
            peer,
            peer_connection,
        }))
    }
}

pub struct RtcConnection {
    peer: String,
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn add_tracks(&self, tracks: &[LocalTrack]) -> Result<()> {
        for track in tracks {
            self.peer_connection.add_track(Arc::clone(track)).await?;
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.peer_connection.create_offer(options).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer.clone()).await?;
        Ok(from_rtc(answer))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    fn close(&self) {
        let peer_connection = Arc::clone(&self.peer_connection);
        let peer = self.peer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = peer_connection.close().await {
                        warn!(%peer, "error closing peer connection: {e}");
                    }
                });
            }
            Err(_) => warn!(%peer, "no runtime to close peer connection on"),
        }
    }
}

fn from_rtc(description: RTCSessionDescription) -> SessionDescription {
    let kind = match description.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: description.sdp,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback
        }
    };
    Ok(rtc)
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::test_track;

    #[test]
    fn candidate_round_trips_through_rtc_init() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.4 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        let init: RTCIceCandidateInit = candidate.clone().into();
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[test]
    fn rollback_needs_no_sdp() {
        let rtc = to_rtc(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Rollback);
        assert_eq!(from_rtc(rtc).kind, SdpKind::Rollback);
    }

    #[tokio::test]
    async fn factory_builds_connections_with_default_codecs() {
        let factory = WebRtcConnectionFactory::new(CallConfig::default()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let connection = factory.create(ConnectionEvents::new("u2", 1, tx)).await.unwrap();
        let offer = connection.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        connection.close();
    }

    #[tokio::test]
    async fn glare_settles_by_moving_the_loser_to_a_fresh_connection() {
        let factory = WebRtcConnectionFactory::new(CallConfig::default()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let tracks = vec![test_track("audio")];

        // "a" and "b" offer to each other at the same time.
        let a = factory.create(ConnectionEvents::new("b", 1, tx.clone())).await.unwrap();
        let b = factory.create(ConnectionEvents::new("a", 1, tx.clone())).await.unwrap();
        a.add_tracks(&tracks).await.unwrap();
        b.add_tracks(&tracks).await.unwrap();
        let offer_a = a.create_offer(false).await.unwrap();
        let _offer_b = b.create_offer(false).await.unwrap();

        // "b" has the larger id: its offer is dropped with its connection.
        b.close();
        let b = factory.create(ConnectionEvents::new("a", 2, tx)).await.unwrap();
        b.add_tracks(&tracks).await.unwrap();
        b.set_remote_description(offer_a).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);

        // "a" keeps its pending offer and completes with that answer.
        a.set_remote_description(answer).await.unwrap();

        a.close();
        b.close();
    }
}
