//! Channel adapter fabric.
//!
//! Adapters translate between their medium and the runtime: inbound
//! messages resolve an external identity to a principal and enter the
//! per-session queue; progress and final responses flow back out through
//! the adapter that owns the session's channel. The same principal keeps
//! one memory scope across channels while each room keeps its own
//! transcript and working context.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod adapter;
mod error;
mod fabric;
mod media;
mod webhook;

pub use adapter::{Attachment, AttachmentSource, ChannelAdapter, InboundEnvelope};
pub use error::{ChannelError, ChannelResult};
pub use fabric::{AdapterFabric, PrincipalResolver};
pub use media::{MediaClass, MediaPipeline, classify_attachment};
pub use webhook::{
    WebhookChannel, WebhookNotifier, WebhookOutboundEvent, WebhookRequest, sign_payload,
};
