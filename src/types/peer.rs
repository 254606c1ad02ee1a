use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const HEX_CHARS: &[u8] = b"0123456789abcdef";
const DEFAULT_AVATAR: &str = "user.svg";

/// Identity of one signaling endpoint, as assigned by the relay.
///
/// Ordering is plain lexical ordering of the underlying string; the call
/// session uses it to break offer glare deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates an identity locally, used when provisioning fails or the
    /// relay reports the current one as taken. Layout follows a v4 UUID.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut id = String::with_capacity(36);
        for (i, len) in [8usize, 4, 4, 4, 12].into_iter().enumerate() {
            if i > 0 {
                id.push('-');
            }
            for _ in 0..len {
                id.push(HEX_CHARS[rng.random_range(0..HEX_CHARS.len())] as char);
            }
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for PeerIdentity {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Key shared out-of-band that scopes one call in the rendezvous directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `{epoch_ms}-{4 random digits}`
    pub fn generate() -> Self {
        let suffix: u32 = rand::rng().random_range(1000..10000);
        Self(format!("{}-{suffix}", Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The record a participant publishes under `rooms/{room}/peers/{peerId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "name", default)]
    pub display_name: String,
    #[serde(rename = "photo", default)]
    pub avatar_ref: String,
}

impl PeerRecord {
    pub fn new(
        peer_id: &PeerIdentity,
        display_name: impl Into<String>,
        avatar_ref: impl Into<String>,
    ) -> Self {
        let avatar_ref = avatar_ref.into();
        Self {
            peer_id: peer_id.to_string(),
            display_name: display_name.into(),
            avatar_ref: if avatar_ref.is_empty() {
                DEFAULT_AVATAR.to_string()
            } else {
                avatar_ref
            },
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.peer_id.clone())
    }
}

/// Display data for the local participant, published once the relay assigns an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalProfile {
    pub display_name: String,
    pub avatar_ref: String,
    /// Application-level user id, if any. Notification markers addressed to
    /// this id are cleaned up when a call ends.
    pub user_id: Option<String>,
}

impl LocalProfile {
    pub fn new(display_name: impl Into<String>, avatar_ref: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            avatar_ref: avatar_ref.into(),
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn record_for(&self, peer_id: &PeerIdentity) -> PeerRecord {
        PeerRecord::new(peer_id, self.display_name.clone(), self.avatar_ref.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_wire_names() {
        let record = PeerRecord::new(&PeerIdentity::from("abc"), "Ana", "");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["peerId"], "abc");
        assert_eq!(json["name"], "Ana");
        assert_eq!(json["photo"], "user.svg");
    }

    #[test]
    fn test_record_ignores_unknown_fields() {
        let record: PeerRecord =
            serde_json::from_str(r#"{"peerId":"p1","name":"Bo","photo":"x.png","native":true}"#)
                .unwrap();
        assert_eq!(record.peer_id, "p1");
        assert_eq!(record.avatar_ref, "x.png");
    }

    #[test]
    fn test_room_id_format() {
        let room = RoomId::generate();
        let (millis, suffix) = room.as_str().split_once('-').unwrap();
        assert!(millis.parse::<i64>().unwrap() > 1_600_000_000_000);
        let suffix: u32 = suffix.parse().unwrap();
        assert!((1000..10000).contains(&suffix));
    }

    #[test]
    fn test_generated_identity_shape() {
        let id = PeerIdentity::generate();
        let parts: Vec<&str> = id.as_str().split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(id.as_str().chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
        assert_ne!(id, PeerIdentity::generate());
    }

    #[test]
    fn test_identity_lexical_order() {
        assert!(PeerIdentity::from("b") > PeerIdentity::from("a"));
        assert!(PeerIdentity::from("a1") < PeerIdentity::from("a2"));
    }
}
