//! Session keys.
//!
//! A session is the per-(channel, room) conversational state. Its key is
//! stable across restarts and doubles as the checkpoint namespace, so the
//! format is parsed strictly: `itak:<channel>:<room_type>:<room_id>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of room a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    /// One-on-one conversation.
    Direct,
    /// Shared multi-user room.
    Group,
    /// Synthetic room created for a webhook-submitted task.
    Webhook,
    /// Sub-agent scratch session, never user-facing.
    Sub,
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Group => write!(f, "group"),
            Self::Webhook => write!(f, "webhook"),
            Self::Sub => write!(f, "sub"),
        }
    }
}

impl FromStr for RoomType {
    type Err = SessionKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            "webhook" => Ok(Self::Webhook),
            "sub" => Ok(Self::Sub),
            other => Err(SessionKeyParseError::UnknownRoomType {
                room_type: other.to_string(),
            }),
        }
    }
}

/// Error returned when a session key string does not parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionKeyParseError {
    /// The key did not have the `itak:` prefix or four segments.
    #[error("malformed session key: {key}")]
    Malformed {
        /// The offending key.
        key: String,
    },
    /// The room type segment was not recognized.
    #[error("unknown room type: {room_type}")]
    UnknownRoomType {
        /// The offending segment.
        room_type: String,
    },
}

/// Stable identifier for a session: `itak:<channel>:<room_type>:<room_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey {
    /// Channel name (e.g. `discord`, `webhook`, `cli`).
    channel: String,
    /// Room kind.
    room_type: RoomType,
    /// Channel-scoped room identifier.
    room_id: String,
}

impl SessionKey {
    /// Build a session key from its parts.
    #[must_use]
    pub fn new(channel: impl Into<String>, room_type: RoomType, room_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            room_type,
            room_id: room_id.into(),
        }
    }

    /// Channel segment.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Room type segment.
    #[must_use]
    pub fn room_type(&self) -> RoomType {
        self.room_type
    }

    /// Room id segment.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Derive the checkpoint namespace for the `n`-th sub-agent of this
    /// session: `<self>/sub/<n>`.
    #[must_use]
    pub fn sub_namespace(&self, n: usize) -> String {
        format!("{self}/sub/{n}")
    }

    /// A filesystem-safe form of the key (colons replaced), used for
    /// per-session directories under `data/sessions/`.
    #[must_use]
    pub fn as_path_segment(&self) -> String {
        self.to_string().replace([':', '/'], "_")
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "itak:{}:{}:{}", self.channel, self.room_type, self.room_id)
    }
}

impl FromStr for SessionKey {
    type Err = SessionKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SessionKeyParseError::Malformed { key: s.to_string() };
        let rest = s.strip_prefix("itak:").ok_or_else(malformed)?;
        let mut parts = rest.splitn(3, ':');
        let channel = parts.next().filter(|p| !p.is_empty()).ok_or_else(malformed)?;
        let room_type = parts.next().ok_or_else(malformed)?.parse::<RoomType>()?;
        let room_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(malformed)?;
        Ok(Self::new(channel, room_type, room_id))
    }
}

impl TryFrom<String> for SessionKey {
    type Error = SessionKeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display() {
        let key = SessionKey::new("discord", RoomType::Direct, "1234");
        let parsed: SessionKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(key.to_string(), "itak:discord:direct:1234");
    }

    #[test]
    fn rejects_missing_prefix() {
        let err = "discord:direct:1234".parse::<SessionKey>().unwrap_err();
        assert!(matches!(err, SessionKeyParseError::Malformed { .. }));
    }

    #[test]
    fn rejects_unknown_room_type() {
        let err = "itak:discord:lounge:1234".parse::<SessionKey>().unwrap_err();
        assert!(matches!(err, SessionKeyParseError::UnknownRoomType { .. }));
    }

    #[test]
    fn room_id_may_contain_colons() {
        let parsed: SessionKey = "itak:matrix:group:!abc:example.org".parse().unwrap();
        assert_eq!(parsed.room_id(), "!abc:example.org");
    }

    #[test]
    fn sub_namespace_nests_under_parent() {
        let key = SessionKey::new("cli", RoomType::Direct, "local");
        assert_eq!(key.sub_namespace(2), "itak:cli:direct:local/sub/2");
    }
}
