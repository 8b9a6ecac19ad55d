//! The adapter contract.

use async_trait::async_trait;
use itak_core::{RoomType, SessionKey};
use itak_runtime::PresenceState;

use crate::error::ChannelResult;

/// An inbound attachment before the media pipeline runs.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Original filename.
    pub filename: String,
    /// MIME type, when the medium reports one.
    pub mime: Option<String>,
    /// Either a URL to download or inline bytes.
    pub source: AttachmentSource,
}

/// Where an attachment's bytes come from.
#[derive(Debug, Clone)]
pub enum AttachmentSource {
    /// Download from a URL (adapter-authenticated).
    Url(String),
    /// Bytes carried inline.
    Bytes(Vec<u8>),
}

/// One inbound message as an adapter sees it, before identity
/// resolution.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// The external user id on the adapter's medium.
    pub external_user_id: String,
    /// Room kind.
    pub room_type: RoomType,
    /// The external room id.
    pub room_id: String,
    /// Message text.
    pub content: String,
    /// Attachments, if any.
    pub attachments: Vec<Attachment>,
}

/// The contract every channel adapter implements.
///
/// `start`/`stop` are idempotent. `send` is single best-effort delivery.
/// Presence and edit-in-place are optional capabilities: the defaults
/// no-op, and `supports_edit` gates `edit_last`.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name, the first segment of this adapter's session keys.
    fn channel(&self) -> &str;

    /// Bring the adapter up. Idempotent.
    async fn start(&self) -> ChannelResult<()>;

    /// Take the adapter down. Idempotent.
    async fn stop(&self) -> ChannelResult<()>;

    /// Deliver a message into a room. Best effort, no retries.
    async fn send(&self, session: &SessionKey, content: &str) -> ChannelResult<()>;

    /// Map a presence state to the medium. Default: no-op.
    async fn set_presence(&self, _session: &SessionKey, _state: PresenceState, _detail: &str) {}

    /// Whether this adapter can edit its last message in place.
    fn supports_edit(&self) -> bool {
        false
    }

    /// Edit the last message sent to this room. Only called when
    /// [`supports_edit`](Self::supports_edit) is true.
    async fn edit_last(&self, _session: &SessionKey, _content: &str) -> ChannelResult<()> {
        Ok(())
    }
}
