use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

use keel_core::Result;

/// Name of the marker file inside the config directory.
pub const MARKER_FILE: &str = ".initialized";

/// Records that the host has completed a start at least once.
#[derive(Debug, Clone)]
pub struct FirstRunMarker {
    path: PathBuf,
}

impl FirstRunMarker {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_first_run(&self) -> bool {
        !self.path.exists()
    }

    /// Write the marker, creating the config directory if needed.
    pub fn mark_initialized(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, Utc::now().to_rfc3339())?;
        info!(path = ?self.path, "first run recorded");
        Ok(())
    }

    /// When the marker was written, if it exists and is readable.
    pub fn initialized_at(&self) -> Option<DateTime<Utc>> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}
