//! # keel-config
//!
//! Configuration system for the Keel host. Reads from `keel.toml` and
//! environment variables, with CLI flags applied on top by the caller.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ConfigWarning, KeelConfig, LoggingConfig, PluginsConfig, PolicyMode, RuntimeConfig,
    VerifierConfig, VerifierKind, WarningSeverity,
};
