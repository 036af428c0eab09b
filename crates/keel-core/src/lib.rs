//! # keel-core
//!
//! Shared vocabulary for the Keel plugin host: the unified error type used by
//! every crate in the workspace and the process-wide event bus that plugins
//! publish into.

pub mod error;
pub mod event;

pub use error::{ErrorKind, KeelError, Result};
pub use event::{Event, EventBus};
