//! Tracing setup: env-filtered stderr plus daily JSONL files under
//! `data/logs/`, both passing the output guard so no secret value ever
//! lands in a log line.

use itak_vault::OutputGuard;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Guard installed once the vault exists; until then lines pass through
/// unredacted (they cannot contain secrets the vault does not hold yet).
static LOG_GUARD: OnceLock<OutputGuard> = OnceLock::new();

/// Register the output guard for log redaction. Called during wiring,
/// after the vault loads.
pub(crate) fn set_guard(guard: OutputGuard) {
    let _ = LOG_GUARD.set(guard);
}

/// Writer wrapper applying the redactor per line.
struct RedactingWriter<W: Write>(W);

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(guard) = LOG_GUARD.get() {
            let text = String::from_utf8_lossy(buf);
            let redacted = guard.redact(&text);
            self.0.write_all(redacted.as_bytes())?;
            return Ok(buf.len());
        }
        self.0.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

/// Initialize tracing. Returns the appender guard that must live as long
/// as the process.
pub(crate) fn init(
    data_dir: &Path,
) -> std::io::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "itak.jsonl");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let redacted_file = Arc::new(file_writer);
    let make_file = move || RedactingWriter((*redacted_file).clone());
    let make_stderr = || RedactingWriter(std::io::stderr());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,itak=debug")
        }))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(make_stderr.with_max_level(tracing::Level::INFO)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_file),
        )
        .init();
    Ok(guard)
}
