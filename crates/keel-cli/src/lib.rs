//! # keel-cli
//!
//! Command-line interface for the Keel plugin host.
//!
//! ## Commands
//!
//! - `keel start` — Run the host until interrupted
//! - `keel verify` — Check a detached manifest signature (exit 0/1/2)
//! - `keel validate` — Lint a plugin manifest
//! - `keel plugins` — Load plugins and report what would be granted
//! - `keel config` — Show the effective configuration
//! - `keel version` — Show version

pub mod commands;

pub use commands::Cli;
