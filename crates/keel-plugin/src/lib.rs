//! Native plugin host: module contract, capability model, manifest
//! verification, the capability-checked host interface and the manager that
//! drives plugin lifecycles.

pub mod abi;
pub mod capability;
pub mod ffi;
pub mod host;
pub mod interface;
pub mod manager;
pub mod manifest;
pub mod module;
pub mod sdk;
pub mod verify;

pub use capability::{Capabilities, Capability, CapabilityGrant, CapabilityPolicy, PolicyMode};
pub use host::{HostBinding, HostServices, PluginHost, Service, ServiceKind};
pub use interface::{PluginInterface, PluginMetadata};
pub use manager::{DiscoveryReport, LoadFailure, PluginInfo, PluginManager, PluginState};
pub use manifest::{PluginManifest, Sidecar, canonical_bytes, is_valid_plugin_id};
#[cfg(feature = "native")]
pub use module::NativeLoader;
pub use module::{Module, ModuleLoader};
pub use verify::{
    CommandVerifier, Ed25519Verifier, ManifestRecord, ManifestVerifier, SignatureVerifier, Trust,
    TrustGate, Verification,
};
