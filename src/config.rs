use std::time::Duration;

pub const DEFAULT_PRIMARY_HOST: &str = "0.peerjs.com";
pub const DEFAULT_FALLBACK_HOST: &str = "peer.enclosureapp.com";
pub const DEFAULT_RELAY_KEY: &str = "peerjs";

/// One signaling relay server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    /// Mount path of the relay, always starting and ending with `/`.
    pub path: String,
    pub secure: bool,
}

impl RelayEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 443,
            path: "/".to_string(),
            secure: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        self.path = path;
        self
    }

    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    fn base(&self, secure_scheme: &str, plain_scheme: &str) -> String {
        let scheme = if self.secure {
            secure_scheme
        } else {
            plain_scheme
        };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }

    /// Identity provisioning endpoint.
    pub fn id_url(&self, timestamp_ms: i64) -> String {
        format!("{}peerjs/id?ts={timestamp_ms}", self.base("https", "http"))
    }

    /// Persistent socket endpoint for `peer_id`.
    pub fn socket_url(&self, key: &str, peer_id: &str, token: &str) -> String {
        format!(
            "{}peerjs?key={}&id={}&token={}",
            self.base("wss", "ws"),
            urlencoding::encode(key),
            urlencoding::encode(peer_id),
            urlencoding::encode(token)
        )
    }
}

#[derive(Clone, Debug)]
pub struct SignalingConfig {
    pub primary: RelayEndpoint,
    /// Tried exactly once, when the primary does not acknowledge in time.
    pub fallback: Option<RelayEndpoint>,
    pub key: String,
    pub open_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_id_reissues: u32,
    pub max_reconnect_attempts: u32,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            primary: RelayEndpoint::new(DEFAULT_PRIMARY_HOST),
            fallback: Some(RelayEndpoint::new(DEFAULT_FALLBACK_HOST)),
            key: DEFAULT_RELAY_KEY.to_string(),
            open_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            max_id_reissues: 3,
            max_reconnect_attempts: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallSessionConfig {
    /// How long negotiation may run before ICE must report connectivity.
    pub ice_connect_timeout: Duration,
    /// How long ICE may stay disconnected/failed before the call ends.
    pub ice_disconnect_grace: Duration,
    /// When set, a non-initiating side that sees the remote peer but gets no
    /// offer within this window starts offering itself.
    pub answer_fallback: Option<Duration>,
}

impl Default for CallSessionConfig {
    fn default() -> Self {
        Self {
            ice_connect_timeout: Duration::from_secs(30),
            ice_disconnect_grace: Duration::from_secs(3),
            answer_fallback: Some(Duration::from_secs(3)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallManagerConfig {
    /// Maximum concurrent calls on one shared relay connection.
    pub max_concurrent_calls: usize,
    pub session: CallSessionConfig,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            session: CallSessionConfig::default(),
        }
    }
}
