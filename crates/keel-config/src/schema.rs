use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration — maps to `keel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub plugins: PluginsConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

// ── Plugins ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned recursively for plugin modules.
    pub dir: PathBuf,
    /// File extension of candidate modules, without the dot.
    pub extension: String,
    /// Reject modules that do not ship a verified manifest.
    pub require_signatures: bool,
    /// Base64 Ed25519 public key used to verify plugin manifests.
    pub trusted_key: Option<PathBuf>,
    /// Default capability policy.
    pub policy: PolicyMode,
    /// Capability ceiling per plugin id (capability names).
    pub grants: BTreeMap<String, Vec<String>>,
    pub verifier: VerifierConfig,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("plugins"),
            extension: std::env::consts::DLL_EXTENSION.into(),
            require_signatures: false,
            trusted_key: None,
            policy: PolicyMode::default(),
            grants: BTreeMap::new(),
            verifier: VerifierConfig::default(),
        }
    }
}

/// How capability grants are decided when a plugin loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    /// Deny everything not on the allow-list or in a verified manifest.
    #[default]
    LeastPrivilege,
    /// Grant whatever a plugin requests.
    Permissive,
}

impl std::str::FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least-privilege" | "deny" => Ok(Self::LeastPrivilege),
            "permissive" | "allow-all" => Ok(Self::Permissive),
            other => Err(format!("unknown capability policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub kind: VerifierKind,
    /// External verifier program (kind = "command").
    pub command: Option<PathBuf>,
    /// Arguments placed before `--manifest/--sig/--pubkey`.
    pub args: Vec<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            kind: VerifierKind::Builtin,
            command: None,
            args: vec!["verify".into()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    #[default]
    Builtin,
    Command,
}

// ── Runtime ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run without a UI; the ui service is never exposed to plugins.
    pub headless: bool,
    /// Per-user config directory holding the first-run marker.
    pub config_dir: Option<PathBuf>,
    /// Capacity of the process-wide event bus.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            headless: false,
            config_dir: None,
            event_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// The configured directory, or `<user config dir>/keel`.
    pub fn resolved_config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("keel")
        })
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl KeelConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Signatures ───
        if self.plugins.require_signatures && self.plugins.trusted_key.is_none() {
            warnings.push(ConfigWarning {
                field: "plugins.trusted_key".into(),
                message: "signatures are required but no trusted key is configured".into(),
                severity: WarningSeverity::Error,
                hint: Some("Point plugins.trusted_key at a base64 Ed25519 public key".into()),
            });
        } else if self.plugins.trusted_key.is_none() {
            warnings.push(ConfigWarning {
                field: "plugins.trusted_key".into(),
                message: "no trusted key; modules shipped with a signed manifest will be rejected"
                    .into(),
                severity: WarningSeverity::Info,
                hint: Some("Point plugins.trusted_key at a base64 Ed25519 public key".into()),
            });
        }

        // ── Verifier ───
        if self.plugins.verifier.kind == VerifierKind::Command
            && self.plugins.verifier.command.is_none()
        {
            warnings.push(ConfigWarning {
                field: "plugins.verifier.command".into(),
                message: "command verifier selected without a program".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set plugins.verifier.command, e.g. \"keel\"".into()),
            });
        }

        // ── Policy ───
        if self.plugins.policy == PolicyMode::Permissive {
            warnings.push(ConfigWarning {
                field: "plugins.policy".into(),
                message: "permissive policy grants every capability a plugin requests".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Use \"least-privilege\" with plugins.grants instead".into()),
            });
        }

        // ── Extension ───
        if self.plugins.extension.is_empty() || self.plugins.extension.starts_with('.') {
            warnings.push(ConfigWarning {
                field: "plugins.extension".into(),
                message: format!("invalid module extension '{}'", self.plugins.extension),
                severity: WarningSeverity::Error,
                hint: Some(format!(
                    "Use the bare extension, e.g. \"{}\"",
                    std::env::consts::DLL_EXTENSION
                )),
            });
        }

        // ── Event bus ───
        if self.runtime.event_capacity == 0 {
            warnings.push(ConfigWarning {
                field: "runtime.event_capacity".into(),
                message: "event capacity is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 1024".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
