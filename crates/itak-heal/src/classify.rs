//! Error categorization and signature normalization.

use itak_core::ErrorKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Healing categories. `Security` and `Data` are immediately fatal;
/// `Resource` surfaces after one cleanup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing package, module, or binary.
    Dependency,
    /// Connectivity, timeouts, provider hiccups.
    Network,
    /// Misconfiguration, missing secrets, bad endpoints.
    Config,
    /// Generic runtime failure inside the agent.
    Runtime,
    /// Tool-level failure (bad arguments shape, tool bug).
    Tool,
    /// Disk, memory, or quota exhaustion.
    Resource,
    /// Policy violations, permission problems, injection attempts.
    Security,
    /// Corrupt or schema-mismatched data.
    Data,
}

impl ErrorCategory {
    /// Whether this category is immediately fatal.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Security | Self::Data)
    }

    /// Whether the repair loop may attempt a retry at all.
    #[must_use]
    pub fn is_repairable(self) -> bool {
        matches!(
            self,
            Self::Dependency | Self::Network | Self::Config | Self::Runtime | Self::Tool
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dependency => write!(f, "dependency"),
            Self::Network => write!(f, "network"),
            Self::Config => write!(f, "config"),
            Self::Runtime => write!(f, "runtime"),
            Self::Tool => write!(f, "tool"),
            Self::Resource => write!(f, "resource"),
            Self::Security => write!(f, "security"),
            Self::Data => write!(f, "data"),
        }
    }
}

static DEPENDENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)not found|no such (?:command|module|crate|package)|cannot find|missing dependency|unresolved import")
        .expect("dependency pattern")
});
static RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no space|out of memory|disk full|quota|too many open files|resource exhausted")
        .expect("resource pattern")
});
static DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)corrupt|schema mismatch|decode failed|malformed data|checksum")
        .expect("data pattern")
});
static CONFIG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)config|endpoint|base.?url|credential|unauthorized|api.?key")
        .expect("config pattern")
});

/// Map an error (taxonomy kind + message) to its healing category.
#[must_use]
pub fn classify(kind: ErrorKind, message: &str) -> ErrorCategory {
    match kind {
        ErrorKind::PolicyViolation | ErrorKind::PermissionDenied => ErrorCategory::Security,
        ErrorKind::MissingSecret => ErrorCategory::Config,
        ErrorKind::RateLimited | ErrorKind::BudgetExceeded | ErrorKind::Timeout => {
            ErrorCategory::Network
        },
        ErrorKind::InvalidArgs => ErrorCategory::Tool,
        ErrorKind::Cancelled => ErrorCategory::Runtime,
        ErrorKind::ProviderTransient | ErrorKind::ProviderNonTransient | ErrorKind::InternalInvariant => {
            // The message decides within these broad kinds.
            if DATA_RE.is_match(message) {
                ErrorCategory::Data
            } else if RESOURCE_RE.is_match(message) {
                ErrorCategory::Resource
            } else if DEPENDENCY_RE.is_match(message) {
                ErrorCategory::Dependency
            } else if CONFIG_RE.is_match(message) {
                ErrorCategory::Config
            } else if kind == ErrorKind::InternalInvariant {
                ErrorCategory::Runtime
            } else {
                ErrorCategory::Network
            }
        },
    }
}

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("digits"));
static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-f]{8,}\b").expect("hex"));
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/[\w.-]+){2,}").expect("path"));

/// Normalize an error message into a stable lookup signature: lowercase,
/// with ids, numbers, and paths collapsed.
#[must_use]
pub fn signature(message: &str) -> String {
    let lowered = message.to_lowercase();
    let no_paths = PATH_RE.replace_all(&lowered, "<path>");
    let no_hex = HEX_RE.replace_all(&no_paths, "<id>");
    let collapsed = DIGITS_RE.replace_all(&no_hex, "<n>");
    collapsed.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_and_data_are_fatal() {
        assert!(classify(ErrorKind::PolicyViolation, "ssrf block").is_fatal());
        assert!(classify(ErrorKind::ProviderTransient, "checksum corrupt row").is_fatal());
    }

    #[test]
    fn dependency_errors_are_spotted_by_message() {
        let cat = classify(
            ErrorKind::ProviderTransient,
            "bash: ffprobe: command not found",
        );
        assert_eq!(cat, ErrorCategory::Dependency);
        assert!(cat.is_repairable());
    }

    #[test]
    fn timeouts_are_network() {
        assert_eq!(
            classify(ErrorKind::Timeout, "model stream timed out"),
            ErrorCategory::Network
        );
    }

    #[test]
    fn resource_is_not_repairable() {
        let cat = classify(ErrorKind::ProviderTransient, "write failed: no space left");
        assert_eq!(cat, ErrorCategory::Resource);
        assert!(!cat.is_repairable());
        assert!(!cat.is_fatal());
    }

    #[test]
    fn signatures_are_stable_across_ids() {
        let a = signature("job 12345 failed at /tmp/run-9/step: timeout after 30s");
        let b = signature("job 99999 failed at /tmp/run-2/step: timeout after 60s");
        assert_eq!(a, b);
    }
}
