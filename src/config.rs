use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

pub const DEFAULT_MAX_ICE_RETRIES: u32 = 3;

pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Configuration for one call.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// STUN/TURN urls handed to every peer connection
    pub ice_servers: Vec<String>,
    /// Consecutive ICE failures tolerated per peer before it is dropped
    pub max_ice_retries: u32,
    /// Capacity of the call event broadcast
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            max_ice_retries: DEFAULT_MAX_ICE_RETRIES,
            event_capacity: 64,
        }
    }
}

impl CallConfig {
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        if !servers.is_empty() {
            self.ice_servers = servers;
        }
        self
    }

    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ice_transport_policy: RTCIceTransportPolicy::All,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_override_keeps_default_servers() {
        let config = CallConfig::default().with_ice_servers(Vec::new());
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.max_ice_retries, 3);

        let config = config.with_ice_servers(vec!["stun:example.org:3478".into()]);
        assert_eq!(config.ice_servers, vec!["stun:example.org:3478".to_string()]);
    }

    #[test]
    fn rtc_configuration_bundles_everything() {
        let rtc = CallConfig::default().rtc_configuration();
        assert_eq!(rtc.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(rtc.ice_servers[0].urls.len(), 3);
    }
}
