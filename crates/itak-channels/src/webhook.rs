//! Webhook ingress and egress.
//!
//! Inbound: signed HTTP POSTs become tasks on synthetic sessions, with an
//! optional callback POST carrying the deliverable. Outbound: enumerated
//! events are POSTed to configured URLs. Both directions sign payloads
//! with a keyed BLAKE3 MAC over the raw body, hex-encoded; per-route keys
//! live in the vault.

use itak_core::{Principal, RoomType, SessionKey};
use itak_runtime::{AgentRuntime, InboundMessage};
use itak_tools::SsrfGuard;
use itak_vault::SecretVault;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ChannelError, ChannelResult};

/// Compute the hex MAC for a payload under a route key.
#[must_use]
pub fn sign_payload(key: &str, body: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new_derive_key("itak webhook v1");
    hasher.update(key.as_bytes());
    let derived = hasher.finalize();
    blake3::keyed_hash(derived.as_bytes(), body).to_hex().to_string()
}

/// An inbound webhook request body.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRequest {
    /// Task description.
    pub task: String,
    /// Optional callback URL for the deliverable.
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Inbound webhook channel. Routes are named; each has a secret
/// `webhook_<route>` in the vault and a principal it acts as.
///
/// The callback URL arrives in the untrusted request body, so it passes
/// the SSRF guard before the task runs and again never connects past the
/// guard's DNS filter.
pub struct WebhookChannel {
    runtime: Arc<AgentRuntime>,
    vault: Arc<SecretVault>,
    principal: Principal,
    ssrf: SsrfGuard,
    http: reqwest::Client,
    /// Overall budget for one webhook-triggered task.
    task_timeout: Duration,
}

impl WebhookChannel {
    /// Create the channel acting as `principal`.
    #[must_use]
    pub fn new(
        runtime: Arc<AgentRuntime>,
        vault: Arc<SecretVault>,
        principal: Principal,
        ssrf: SsrfGuard,
    ) -> Self {
        let http = ssrf.client();
        Self {
            runtime,
            vault,
            principal,
            ssrf,
            http,
            task_timeout: Duration::from_secs(600),
        }
    }

    /// Verify the signature for `route` against the raw body.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::BadSignature`] on mismatch or when the
    /// route has no configured secret.
    pub fn verify(&self, route: &str, body: &[u8], signature: &str) -> ChannelResult<()> {
        let secret = self
            .vault
            .materialize(&format!("{{{{webhook_{route}}}}}"))
            .map_err(|_| ChannelError::BadSignature {
                route: route.to_string(),
            })?;
        let expected = sign_payload(&secret, body);
        let matches: bool = subtle::ConstantTimeEq::ct_eq(
            expected.as_bytes(),
            signature.as_bytes(),
        )
        .into();
        if !matches {
            return Err(ChannelError::BadSignature {
                route: route.to_string(),
            });
        }
        Ok(())
    }

    /// Handle a verified inbound request: create a synthetic session, run
    /// the task to completion, POST the deliverable to the callback when
    /// one was given, and return the final text.
    ///
    /// # Errors
    ///
    /// Rejects with a policy violation when the callback URL fails the
    /// SSRF guard, before any work runs. Propagates runtime errors;
    /// callback delivery failures are logged, not surfaced.
    pub async fn handle(&self, route: &str, request: WebhookRequest) -> ChannelResult<String> {
        // The callback URL is caller-controlled; refuse the whole request
        // before spending a task on it.
        if let Some(callback) = &request.callback_url {
            self.ssrf.check(callback)?;
        }

        let key = SessionKey::new(
            "webhook",
            RoomType::Webhook,
            format!("{route}-{}", uuid::Uuid::new_v4()),
        );
        info!(session = %key, route, "Webhook task accepted");

        let final_text = self
            .runtime
            .submit_and_wait(
                InboundMessage {
                    session_key: key,
                    principal: self.principal.clone(),
                    content: request.task,
                },
                self.task_timeout,
            )
            .await?;

        if let Some(callback) = request.callback_url {
            self.post_callback(route, &callback, &final_text).await;
        }
        Ok(final_text)
    }

    async fn post_callback(&self, route: &str, url: &str, deliverable: &str) {
        // Re-checked here: the guard is cheap and the task may have run
        // for minutes since the inbound validation.
        let target = match self.ssrf.check(url) {
            Ok(target) => target,
            Err(e) => {
                warn!(url, error = %e, "Webhook callback target blocked");
                return;
            },
        };
        let body = serde_json::json!({
            "event": "task_completed",
            "timestamp": chrono::Utc::now(),
            "payload": {"deliverable": deliverable},
        });
        let raw = body.to_string();
        let signature = self
            .vault
            .materialize(&format!("{{{{webhook_{route}}}}}"))
            .map(|secret| sign_payload(&secret, raw.as_bytes()))
            .unwrap_or_default();

        let result = self
            .http
            .post(target)
            .header("x-itak-signature", signature)
            .header("content-type", "application/json")
            .body(raw)
            .timeout(Duration::from_secs(30))
            .send()
            .await;
        if let Err(e) = result {
            warn!(url, error = %e, "Webhook callback failed");
        }
    }
}

impl std::fmt::Debug for WebhookChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookChannel")
            .field("principal", &self.principal.id)
            .finish_non_exhaustive()
    }
}

/// Outbound event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutboundEvent {
    /// A task reached `done`.
    TaskCompleted,
    /// A fatal error surfaced.
    ErrorCritical,
    /// The daily activity report.
    DailyReport,
}

/// POSTs signed event payloads to configured URLs with bounded retries.
/// Targets are operator-configured but still pass the SSRF guard; the
/// client carries the guard's DNS filter.
pub struct WebhookNotifier {
    urls: Vec<String>,
    vault: Arc<SecretVault>,
    secret_name: String,
    ssrf: SsrfGuard,
    http: reqwest::Client,
}

impl WebhookNotifier {
    /// Create a notifier for the given URLs, signing with the named vault
    /// secret.
    #[must_use]
    pub fn new(
        urls: Vec<String>,
        vault: Arc<SecretVault>,
        secret_name: impl Into<String>,
        ssrf: SsrfGuard,
    ) -> Self {
        let http = ssrf.client();
        Self {
            urls,
            vault,
            secret_name: secret_name.into(),
            ssrf,
            http,
        }
    }

    /// Emit one event to every URL. Failures are logged and retried up to
    /// three times with backoff; they never surface to users.
    pub async fn emit(&self, event: WebhookOutboundEvent, payload: serde_json::Value) {
        let body = serde_json::json!({
            "event": event,
            "timestamp": chrono::Utc::now(),
            "payload": payload,
        })
        .to_string();
        let signature = self
            .vault
            .materialize(&format!("{{{{{}}}}}", self.secret_name))
            .map(|secret| sign_payload(&secret, body.as_bytes()))
            .unwrap_or_default();

        for url in &self.urls {
            let target = match self.ssrf.check(url) {
                Ok(target) => target,
                Err(e) => {
                    warn!(url, error = %e, "Webhook event target blocked");
                    continue;
                },
            };
            let mut delivered = false;
            for attempt in 1u32..=3 {
                let result = self
                    .http
                    .post(target.clone())
                    .header("x-itak-signature", signature.clone())
                    .header("content-type", "application/json")
                    .body(body.clone())
                    .timeout(Duration::from_secs(15))
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        delivered = true;
                        break;
                    },
                    Ok(response) => {
                        warn!(url, status = %response.status(), attempt, "Webhook emit rejected");
                    },
                    Err(e) => warn!(url, error = %e, attempt, "Webhook emit failed"),
                }
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
            if !delivered {
                warn!(url, event = ?event, "Webhook event dropped after retries");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify_and_reject() {
        let body = br#"{"task": "summarize the logs"}"#;
        let good = sign_payload("route-secret", body);
        assert_eq!(good, sign_payload("route-secret", body));
        assert_ne!(good, sign_payload("other-secret", body));
        assert_ne!(good, sign_payload("route-secret", b"tampered"));
    }
}
