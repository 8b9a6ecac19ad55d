//! The core tier: markdown files that ride along in every prompt.
//!
//! Files are content-addressable assets, immutable at load. An edit on
//! disk is picked up by the next [`CoreContext::read_all`] call, which the
//! scheduler performs at session start; there is no in-memory divergence.

use std::path::PathBuf;

use crate::error::MemoryResult;

/// Reader for the core-tier directory (`identity.md`, `rules.md`, ...).
#[derive(Debug, Clone)]
pub struct CoreContext {
    dir: PathBuf,
}

impl CoreContext {
    /// Point at a core-tier directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read every markdown file, sorted by name, concatenated with
    /// filename headers. An absent directory yields an empty string.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CoreTier`](crate::MemoryError) if the
    /// directory exists but cannot be read.
    pub fn read_all(&self) -> MemoryResult<String> {
        if !self.dir.exists() {
            return Ok(String::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        files.sort();

        let mut combined = String::new();
        for path in files {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("core")
                .to_string();
            let body = std::fs::read_to_string(&path)?;
            combined.push_str(&format!("## {name}\n\n{}\n\n", body.trim()));
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_markdown_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_rules.md"), "no surprises").unwrap();
        std::fs::write(dir.path().join("a_identity.md"), "I am iTaK").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let core = CoreContext::new(dir.path());
        let text = core.read_all().unwrap();
        let identity = text.find("a_identity").unwrap();
        let rules = text.find("b_rules").unwrap();
        assert!(identity < rules);
        assert!(!text.contains("ignored"));
    }

    #[test]
    fn absent_directory_is_empty() {
        let core = CoreContext::new("/nonexistent/itak-core-tier");
        assert_eq!(core.read_all().unwrap(), "");
    }
}
