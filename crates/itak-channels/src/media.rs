//! Inbound media pipeline.
//!
//! Attachments are stored under the session's media directory, classified,
//! and turned into descriptive text through the matching model role. The
//! descriptive text is what enters the transcript, with a reference to
//! the stored artifact.

use itak_core::{Artifact, PrincipalId, SessionKey};
use itak_llm::{ChatRequest, Message, ModelRole, ModelRouter};
use itak_tools::SsrfGuard;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::adapter::{Attachment, AttachmentSource};
use crate::error::{ChannelError, ChannelResult};

/// Broad media classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    /// Raster images, described through the vision role.
    Image,
    /// Audio, transcribed through the utility role.
    Audio,
    /// Text-bearing documents, extracted locally.
    Document,
    /// Everything else; stored but only referenced.
    Opaque,
}

/// Classify by MIME type first, extension second.
#[must_use]
pub fn classify_attachment(attachment: &Attachment) -> MediaClass {
    if let Some(mime) = &attachment.mime {
        if mime.starts_with("image/") {
            return MediaClass::Image;
        }
        if mime.starts_with("audio/") {
            return MediaClass::Audio;
        }
        if mime.starts_with("text/") || mime == "application/pdf" || mime == "application/json" {
            return MediaClass::Document;
        }
    }
    let lowered = attachment.filename.to_lowercase();
    let ext = lowered.rsplit('.').next().unwrap_or_default();
    match ext {
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => MediaClass::Image,
        "mp3" | "wav" | "ogg" | "m4a" | "flac" | "opus" => MediaClass::Audio,
        "txt" | "md" | "csv" | "json" | "log" | "pdf" => MediaClass::Document,
        _ => MediaClass::Opaque,
    }
}

/// Downloads, stores, and describes inbound attachments.
///
/// Attachment URLs come from external media and count as agent-initiated
/// fetches: every download target passes the SSRF guard, and the client
/// carries the guard's DNS filter.
#[derive(Debug, Clone)]
pub struct MediaPipeline {
    router: ModelRouter,
    sessions_root: PathBuf,
    ssrf: SsrfGuard,
    http: reqwest::Client,
}

impl MediaPipeline {
    /// Create a pipeline storing under `sessions_root` (`data/sessions`).
    #[must_use]
    pub fn new(router: ModelRouter, sessions_root: impl Into<PathBuf>, ssrf: SsrfGuard) -> Self {
        let http = ssrf.client();
        Self {
            router,
            sessions_root: sessions_root.into(),
            ssrf,
            http,
        }
    }

    /// Ingest one attachment: store it, describe it, and return the
    /// transcript-facing text plus the artifact record.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Media`] when download or storage fails.
    /// Description-model failures degrade to a plain reference.
    pub async fn ingest(
        &self,
        session: &SessionKey,
        principal: PrincipalId,
        attachment: &Attachment,
    ) -> ChannelResult<(String, Artifact)> {
        let bytes = match &attachment.source {
            AttachmentSource::Bytes(bytes) => bytes.clone(),
            AttachmentSource::Url(url) => {
                let target = self.ssrf.check(url)?;
                self.http
                    .get(target)
                    .send()
                    .await
                    .map_err(|e| ChannelError::Media(format!("download failed: {e}")))?
                    .bytes()
                    .await
                    .map_err(|e| ChannelError::Media(format!("download body failed: {e}")))?
                    .to_vec()
            },
        };

        let class = classify_attachment(attachment);
        let mut artifact = Artifact::new(
            attachment.filename.clone(),
            attachment
                .mime
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            bytes.len() as u64,
        );

        let media_dir = self
            .sessions_root
            .join(session.as_path_segment())
            .join("media");
        tokio::fs::create_dir_all(&media_dir)
            .await
            .map_err(|e| ChannelError::Media(e.to_string()))?;
        let path = media_dir.join(artifact.id.to_string());
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ChannelError::Media(e.to_string()))?;
        debug!(session = %session, artifact = %artifact.id, ?class, "Attachment stored");

        let description = match class {
            MediaClass::Image => {
                self.describe(
                    ModelRole::Vision,
                    principal,
                    &format!(
                        "Describe the attached image '{}' (stored at {}) for a text-only \
                         transcript.",
                        attachment.filename,
                        path.display()
                    ),
                )
                .await
            },
            MediaClass::Audio => {
                self.describe(
                    ModelRole::Utility,
                    principal,
                    &format!(
                        "Transcribe the attached audio '{}' (stored at {}).",
                        attachment.filename,
                        path.display()
                    ),
                )
                .await
            },
            MediaClass::Document => {
                // Local extraction for text-bearing formats.
                let text = String::from_utf8_lossy(&bytes);
                let excerpt: String = text.chars().take(4000).collect();
                Some(format!("Document '{}' contents:\n{excerpt}", attachment.filename))
            },
            MediaClass::Opaque => None,
        };

        artifact.content_type = match class {
            MediaClass::Image => "image".to_string(),
            MediaClass::Audio => "audio".to_string(),
            MediaClass::Document => "document".to_string(),
            MediaClass::Opaque => artifact.content_type,
        };

        let text = description.unwrap_or_else(|| {
            format!(
                "[attachment '{}' stored as artifact {}]",
                attachment.filename, artifact.id
            )
        });
        Ok((format!("{text}\n[artifact {}]", artifact.id), artifact))
    }

    async fn describe(
        &self,
        role: ModelRole,
        principal: PrincipalId,
        prompt: &str,
    ) -> Option<String> {
        let request = ChatRequest::new(
            "You turn media into faithful text for a transcript.",
            vec![Message::user(prompt)],
        )
        .max_tokens(400);
        match self.router.complete(role, principal, &request).await {
            Ok(response) => Some(response.text),
            Err(e) => {
                warn!(role = %role, error = %e, "Media description failed");
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itak_core::{Classify, ErrorKind, RoomType};
    use itak_limits::{LimiterConfig, RateLimiter};
    use itak_llm::ModelRouter;
    use itak_tools::NetworkPolicy;
    use std::sync::Arc;

    fn attachment(name: &str, mime: Option<&str>) -> Attachment {
        Attachment {
            filename: name.to_string(),
            mime: mime.map(String::from),
            source: AttachmentSource::Bytes(b"data".to_vec()),
        }
    }

    #[tokio::test]
    async fn private_attachment_urls_are_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let router = ModelRouter::builder()
            .build(Arc::new(RateLimiter::new(LimiterConfig::default())));
        let pipeline = MediaPipeline::new(
            router,
            dir.path(),
            SsrfGuard::new(NetworkPolicy::open()),
        );

        let poisoned = Attachment {
            filename: "pic.png".to_string(),
            mime: Some("image/png".to_string()),
            source: AttachmentSource::Url(
                "http://169.254.169.254/latest/meta-data".to_string(),
            ),
        };
        let key = SessionKey::new("mock", RoomType::Direct, "room");
        let err = pipeline
            .ingest(&key, PrincipalId::new(), &poisoned)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
        // Nothing was stored for the rejected attachment.
        assert!(!dir.path().join(key.as_path_segment()).exists());
    }

    #[test]
    fn classification_prefers_mime() {
        assert_eq!(
            classify_attachment(&attachment("weird.bin", Some("image/png"))),
            MediaClass::Image
        );
        assert_eq!(
            classify_attachment(&attachment("note.md", None)),
            MediaClass::Document
        );
        assert_eq!(
            classify_attachment(&attachment("voice.ogg", None)),
            MediaClass::Audio
        );
        assert_eq!(
            classify_attachment(&attachment("blob.xyz", None)),
            MediaClass::Opaque
        );
    }
}
