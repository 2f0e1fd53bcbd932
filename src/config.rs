use crate::error::Error;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

/// A single STUN/TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        IceServer {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// How media descriptions are bundled onto transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxBundle,
    MaxCompat,
}

/// Which ICE candidates the engine may use.
///
/// `Public` asks for server-reflexive and relay candidates only. The engine
/// crate only distinguishes `All` and `Relay`, so `Public` degrades to `All`
/// at translation time (see `Config::engine_config`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceTransportPolicy {
    Relay,
    Public,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    Negotiate,
    Require,
}

/// Coordinator configuration. Immutable once a coordinator has been created
/// from it; the coordinator takes it by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub ice_servers: Vec<IceServer>,
    pub bundle_policy: BundlePolicy,
    pub ice_transport_policy: IceTransportPolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
    pub ice_candidate_pool_size: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ice_servers: vec![IceServer::new("stun:stun.l.google.com:19302")],
            bundle_policy: BundlePolicy::MaxBundle,
            ice_transport_policy: IceTransportPolicy::All,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
            ice_candidate_pool_size: 0,
        }
    }
}

const URL_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

impl Config {
    /// Structural validation. Runs before any engine call so that a bad
    /// configuration never has engine side effects.
    pub fn validate(&self) -> Result<(), Error> {
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::Config("ICE server with no urls".into()));
            }
            for url in &server.urls {
                if url.is_empty() {
                    return Err(Error::Config("empty ICE server url".into()));
                }
                if !URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                    return Err(Error::Config(format!(
                        "unsupported ICE server url scheme: {url}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Translates into the engine's configuration type. Call `validate`
    /// first; this conversion itself is total.
    pub(crate) fn engine_config(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        let ice_transport_policy = match self.ice_transport_policy {
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Public => {
                // The engine has no "no host candidates" policy.
                log::warn!("ice transport policy 'public' is not supported by the engine, using 'all'");
                RTCIceTransportPolicy::All
            }
        };

        RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            bundle_policy: match self.bundle_policy {
                BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
                BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
                BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            },
            rtcp_mux_policy: match self.rtcp_mux_policy {
                RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
                RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
            },
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_has_single_google_stun_server() {
        let config = Config::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(
            config.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_policies_favor_bundled_multiplexed_transport() {
        let config = Config::default();
        assert_eq!(config.bundle_policy, BundlePolicy::MaxBundle);
        assert_eq!(config.ice_transport_policy, IceTransportPolicy::All);
        assert_eq!(config.rtcp_mux_policy, RtcpMuxPolicy::Require);
        assert_eq!(config.ice_candidate_pool_size, 0);
    }

    #[test]
    fn rejects_server_without_urls() {
        let config = Config {
            ice_servers: vec![IceServer {
                urls: vec![],
                username: String::new(),
                credential: String::new(),
            }],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_unknown_url_scheme() {
        let config = Config {
            ice_servers: vec![IceServer::new("http://example.com")],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn accepts_turn_with_credentials() {
        let mut server = IceServer::new("turn:turn.example.com:3478");
        server.username = "user".into();
        server.credential = "pass".into();
        let config = Config {
            ice_servers: vec![server],
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        let engine = config.engine_config();
        assert_eq!(engine.ice_servers.len(), 1);
        assert_eq!(engine.ice_servers[0].username, "user");
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
