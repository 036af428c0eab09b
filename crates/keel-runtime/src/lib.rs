//! # keel-runtime
//!
//! The process lifecycle around the plugin host. A [`Core`] is constructed
//! explicitly, initialized once, pumps plugin events, and is shut down
//! explicitly; it owns the only plugin manager and host for its lifetime.
//!
//! ```text
//!   Core::initialize
//!     ├─ PluginHost (services, event bus, headless flag)
//!     ├─ PluginManager::discover   trust gate → load → grant
//!     ├─ PluginManager::initialize_all
//!     ├─ unload plugins that refused to initialize
//!     └─ first-run marker
//!   Core::run / pump_events        plugin events → other plugins
//!   Core::shutdown                 reverse-order unload, host dropped last
//! ```

pub mod lifecycle;
pub mod first_run;

pub use lifecycle::{Core, StartupReport};
pub use first_run::FirstRunMarker;
