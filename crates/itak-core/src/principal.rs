//! Principals and role-based access levels.
//!
//! A principal is an identified human with a role and one or more
//! external-channel bindings. The same principal resolved through two
//! different channels shares one memory scope; the role gates which tools
//! the scheduler exposes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalId(pub Uuid);

impl PrincipalId {
    /// Create a new random principal id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access level, totally ordered: `Owner > Sudo > User`.
///
/// Derived `Ord` follows declaration order, so `User < Sudo < Owner`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Regular user: read-only tools and conversation.
    #[default]
    User,
    /// Elevated user: side-effecting tools, no registry mutation.
    Sudo,
    /// The owner: everything, including principal registry mutation and
    /// budget overrides.
    Owner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Sudo => write!(f, "sudo"),
            Self::Owner => write!(f, "owner"),
        }
    }
}

/// A `(channel, external_id)` pair linking a principal to an external
/// messaging identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// Channel name (e.g. `discord`).
    pub channel: String,
    /// The identity on that channel.
    pub external_id: String,
}

impl ChannelBinding {
    /// Create a new binding.
    #[must_use]
    pub fn new(channel: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            external_id: external_id.into(),
        }
    }
}

/// Per-principal request-rate policy, consumed by the limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatePolicy {
    /// Requests per minute.
    pub rpm: u32,
    /// Maximum concurrent monologues for this principal.
    pub max_concurrent: u32,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            rpm: 30,
            max_concurrent: 2,
        }
    }
}

/// An identified human user with a role and channel bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Stable id.
    pub id: PrincipalId,
    /// Display name used in prompts and logs.
    pub display_name: String,
    /// Access level.
    pub role: Role,
    /// External identities that resolve to this principal.
    pub channel_bindings: BTreeSet<ChannelBinding>,
    /// Request-rate policy.
    #[serde(default)]
    pub rate_policy: RatePolicy,
}

impl Principal {
    /// Create a principal with no bindings.
    #[must_use]
    pub fn new(display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: PrincipalId::new(),
            display_name: display_name.into(),
            role,
            channel_bindings: BTreeSet::new(),
            rate_policy: RatePolicy::default(),
        }
    }

    /// Add a channel binding.
    #[must_use]
    pub fn with_binding(mut self, channel: impl Into<String>, external_id: impl Into<String>) -> Self {
        self.channel_bindings
            .insert(ChannelBinding::new(channel, external_id));
        self
    }

    /// Whether this principal is bound to the given external identity.
    #[must_use]
    pub fn is_bound(&self, channel: &str, external_id: &str) -> bool {
        self.channel_bindings
            .iter()
            .any(|b| b.channel == channel && b.external_id == external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_totally_ordered() {
        assert!(Role::Owner > Role::Sudo);
        assert!(Role::Sudo > Role::User);
        assert!(Role::Owner >= Role::Owner);
    }

    #[test]
    fn binding_lookup() {
        let p = Principal::new("dawn", Role::Owner)
            .with_binding("discord", "D")
            .with_binding("telegram", "T");
        assert!(p.is_bound("discord", "D"));
        assert!(p.is_bound("telegram", "T"));
        assert!(!p.is_bound("discord", "T"));
    }
}
