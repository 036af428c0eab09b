use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::capability::Capabilities;

static PLUGIN_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*(\.[A-Za-z0-9][A-Za-z0-9_-]*)+$")
        .expect("static regex")
});

/// `true` for reverse-domain style ids such as `org.example.notes`.
pub fn is_valid_plugin_id(id: &str) -> bool {
    PLUGIN_ID.is_match(id)
}

/// Plugin manifest — a signed JSON document shipped next to the module.
///
/// ```json
/// {
///   "id": "org.example.notes",
///   "name": "Notes",
///   "version": "1.2.0",
///   "capabilities": ["storage-read", "storage-write"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Capability names the publisher vouches for.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl PluginManifest {
    pub fn from_json(bytes: &[u8]) -> keel_core::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_path(path: &Path) -> keel_core::Result<Self> {
        Self::from_json(&std::fs::read(path)?)
    }

    pub fn semver(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }

    /// Declared capabilities. Unknown names are ignored here and reported by
    /// [`validate`](Self::validate).
    pub fn capability_flags(&self) -> Capabilities {
        Capabilities::from_names(&self.capabilities).0
    }

    /// Human-readable problems with this manifest; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if self.id.trim().is_empty() {
            errs.push("missing or empty id".to_string());
        } else if !is_valid_plugin_id(&self.id) {
            errs.push(format!("id '{}' is not a reverse-domain identifier", self.id));
        }
        if self.name.trim().is_empty() {
            errs.push("missing or empty name".to_string());
        }
        if self.version.trim().is_empty() {
            errs.push("missing or empty version".to_string());
        } else if self.semver().is_none() {
            errs.push(format!("version '{}' is not valid semver", self.version));
        }
        let (_, unknown) = Capabilities::from_names(&self.capabilities);
        for name in unknown {
            errs.push(format!("unknown capability '{name}'"));
        }
        errs
    }
}

/// Canonical form of a JSON manifest: keys sorted, no insignificant whitespace.
/// This is the byte string a manifest signature covers.
pub fn canonical_bytes(raw: &[u8]) -> keel_core::Result<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Manifest and detached signature that accompany a module on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub manifest: PathBuf,
    pub signature: PathBuf,
}

impl Sidecar {
    /// `<dir>/<stem>.manifest.json` and `<dir>/<stem>.manifest.sig` for a module path.
    pub fn for_module(module: &Path) -> Self {
        let stem = module
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = module.parent().unwrap_or(Path::new("."));
        Self {
            manifest: dir.join(format!("{stem}.manifest.json")),
            signature: dir.join(format!("{stem}.manifest.sig")),
        }
    }

    pub fn exists(&self) -> bool {
        self.manifest.exists()
    }
}
