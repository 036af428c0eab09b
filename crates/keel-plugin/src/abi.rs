//! The fixed binary contract between the host and a plugin module.
//!
//! A module exports one symbol, [`PLUGIN_ENTRY_SYMBOL`], a no-argument
//! `extern "C"` function returning a pointer to a [`PluginVTable`] (or null to
//! signal failure). Every table function takes the table's opaque `instance`
//! pointer as its first argument. The host passes a [`HostVTable`] to
//! `initialize`; its `instance` pointer identifies the calling plugin.
//!
//! Function pointers are `Option`s so that a null slot in a table produced by
//! a C plugin is representable and rejected at load time.

use std::ffi::{c_char, c_void};

/// Name of the exported entry symbol, NUL-terminated.
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"PluginInit\0";

/// Signature of the exported entry symbol.
pub type PluginEntryFn = unsafe extern "C" fn() -> *const PluginVTable;

pub type StrFn = unsafe extern "C" fn(instance: *mut c_void) -> *const c_char;
pub type CapabilitiesFn = unsafe extern "C" fn(instance: *mut c_void) -> u64;
pub type InitializeFn =
    unsafe extern "C" fn(instance: *mut c_void, host: *const HostVTable) -> bool;
pub type ShutdownFn = unsafe extern "C" fn(instance: *mut c_void);
pub type OnEventFn = unsafe extern "C" fn(
    instance: *mut c_void,
    event_type: *const c_char,
    event_data: *const c_char,
);

/// Function table every plugin module provides.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginVTable {
    /// Unique reverse-domain id, e.g. `org.example.notes`.
    pub get_id: Option<StrFn>,
    pub get_name: Option<StrFn>,
    pub get_version: Option<StrFn>,
    /// Bitmask of capabilities the plugin asks for.
    pub get_capabilities: Option<CapabilitiesFn>,
    /// Returns false when the plugin refuses to run.
    pub initialize: Option<InitializeFn>,
    /// Called at most once, before the module is closed.
    pub shutdown: Option<ShutdownFn>,
    /// `event_data` is a serialized (JSON) payload.
    pub on_event: Option<OnEventFn>,
    /// Plugin-owned instance data. Never freed by the host.
    pub instance: *mut c_void,
}

pub type ServiceFn = unsafe extern "C" fn(host: *mut c_void) -> *mut c_void;
pub type HasCapabilityFn = unsafe extern "C" fn(host: *mut c_void, cap: u64) -> bool;
pub type LogFn =
    unsafe extern "C" fn(host: *mut c_void, level: *const c_char, message: *const c_char);
pub type EmitEventFn =
    unsafe extern "C" fn(host: *mut c_void, event_type: *const c_char, event_data: *const c_char);
pub type RequestCapabilityFn = unsafe extern "C" fn(host: *mut c_void, cap: u64) -> bool;

/// Host services offered to a plugin. All entries are always populated by the host.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostVTable {
    pub get_storage_service: ServiceFn,
    pub get_network_service: ServiceFn,
    pub get_ui_service: ServiceFn,
    pub has_capability: HasCapabilityFn,
    pub log: LogFn,
    pub emit_event: EmitEventFn,
    pub request_capability: RequestCapabilityFn,
    /// Binds the table to one plugin; pass it back as the first argument.
    pub instance: *mut c_void,
}
