use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the Keel host.
#[derive(Error, Debug)]
pub enum KeelError {
    // ── Load errors ────────────────────────────────────────────
    #[error("failed to open module {path}: {reason}")]
    ModuleOpen { path: PathBuf, reason: String },

    #[error("module {path} does not export `{symbol}`")]
    MissingEntry { path: PathBuf, symbol: String },

    #[error("entry point of {path} returned a null plugin table")]
    NullTable { path: PathBuf },

    #[error("module {path} returned invalid metadata: {reason}")]
    InvalidMetadata { path: PathBuf, reason: String },

    #[error("plugin id already loaded: {0}")]
    DuplicateId(String),

    #[error("manifest does not match module {path}: {reason}")]
    ManifestMismatch { path: PathBuf, reason: String },

    // ── Init errors ────────────────────────────────────────────
    #[error("plugin refused to initialize: {0}")]
    InitRefused(String),

    // ── Verification ───────────────────────────────────────────
    #[error("manifest verification failed for {path}: {reason}")]
    Verification { path: PathBuf, reason: String },

    // ── Lifecycle errors ───────────────────────────────────────
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin {id} is {found}, expected {expected}")]
    InvalidState {
        id: String,
        expected: String,
        found: String,
    },

    #[error("core is already initialized")]
    AlreadyInitialized,

    #[error("core is not initialized")]
    NotInitialized,

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`KeelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The candidate module was skipped; discovery continues.
    Load,
    /// The plugin declined to run and is excluded from dispatch.
    Init,
    /// The module's provenance could not be established. Hard gate.
    Verification,
    Lifecycle,
    Config,
    Internal,
}

impl KeelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModuleOpen { .. }
            | Self::MissingEntry { .. }
            | Self::NullTable { .. }
            | Self::InvalidMetadata { .. }
            | Self::DuplicateId(_)
            | Self::ManifestMismatch { .. } => ErrorKind::Load,
            Self::InitRefused(_) => ErrorKind::Init,
            Self::Verification { .. } => ErrorKind::Verification,
            Self::PluginNotFound(_)
            | Self::InvalidState { .. }
            | Self::AlreadyInitialized
            | Self::NotInitialized => ErrorKind::Lifecycle,
            Self::Config(_) | Self::ConfigValidation { .. } => ErrorKind::Config,
            Self::Io(_) | Self::Serialization(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn is_load_error(&self) -> bool {
        self.kind() == ErrorKind::Load
    }
}

pub type Result<T> = std::result::Result<T, KeelError>;
