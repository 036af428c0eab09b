use std::ffi::{CStr, CString, c_void};
use std::path::Path;
use tracing::warn;

use crate::abi::{
    CapabilitiesFn, HostVTable, InitializeFn, OnEventFn, PluginVTable, ShutdownFn, StrFn,
};
use crate::manifest::is_valid_plugin_id;
use keel_core::{KeelError, Result};

/// Identity a plugin reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub requested: u64,
}

/// A validated plugin function table.
///
/// Built once from the raw pointer returned by the entry symbol. Every slot
/// is checked for null up front so later calls cannot hit a missing function.
#[derive(Debug)]
pub struct PluginInterface {
    get_id: StrFn,
    get_name: StrFn,
    get_version: StrFn,
    get_capabilities: CapabilitiesFn,
    initialize: InitializeFn,
    shutdown: ShutdownFn,
    on_event: OnEventFn,
    instance: *mut c_void,
}

// SAFETY: the copied table is immutable; `instance` is only ever passed back
// to the plugin's own functions, and the manager never calls a plugin from two
// threads at once.
unsafe impl Send for PluginInterface {}

impl PluginInterface {
    /// Validate a table returned by a module's entry point.
    ///
    /// # Safety
    ///
    /// `table` must be null or point to a readable `PluginVTable` whose
    /// functions remain callable while the owning module stays open.
    pub unsafe fn from_raw(table: *const PluginVTable, path: &Path) -> Result<Self> {
        if table.is_null() {
            return Err(KeelError::NullTable {
                path: path.to_path_buf(),
            });
        }
        // SAFETY: non-null and readable per the caller's contract.
        let raw = unsafe { *table };
        let missing = |slot: &str| KeelError::InvalidMetadata {
            path: path.to_path_buf(),
            reason: format!("table slot `{slot}` is null"),
        };
        Ok(Self {
            get_id: raw.get_id.ok_or_else(|| missing("get_id"))?,
            get_name: raw.get_name.ok_or_else(|| missing("get_name"))?,
            get_version: raw.get_version.ok_or_else(|| missing("get_version"))?,
            get_capabilities: raw
                .get_capabilities
                .ok_or_else(|| missing("get_capabilities"))?,
            initialize: raw.initialize.ok_or_else(|| missing("initialize"))?,
            shutdown: raw.shutdown.ok_or_else(|| missing("shutdown"))?,
            on_event: raw.on_event.ok_or_else(|| missing("on_event"))?,
            instance: raw.instance,
        })
    }

    /// Read and validate the plugin's identity.
    pub fn metadata(&self, path: &Path) -> Result<PluginMetadata> {
        let id = self.read_str(self.get_id, "id", path)?;
        let name = self.read_str(self.get_name, "name", path)?;
        let version = self.read_str(self.get_version, "version", path)?;

        if !is_valid_plugin_id(&id) {
            return Err(KeelError::InvalidMetadata {
                path: path.to_path_buf(),
                reason: format!("id '{id}' is not a reverse-domain identifier"),
            });
        }
        if version.trim().is_empty() {
            return Err(KeelError::InvalidMetadata {
                path: path.to_path_buf(),
                reason: "version is empty".into(),
            });
        }

        // SAFETY: validated table, module open.
        let requested = unsafe { (self.get_capabilities)(self.instance) };
        Ok(PluginMetadata {
            id,
            name,
            version,
            requested,
        })
    }

    fn read_str(&self, f: StrFn, field: &str, path: &Path) -> Result<String> {
        // SAFETY: validated table, module open.
        let ptr = unsafe { f(self.instance) };
        if ptr.is_null() {
            return Err(KeelError::InvalidMetadata {
                path: path.to_path_buf(),
                reason: format!("get_{field} returned null"),
            });
        }
        // SAFETY: the contract requires a NUL-terminated string that outlives the call.
        let s = unsafe { CStr::from_ptr(ptr) };
        s.to_str()
            .map(str::to_owned)
            .map_err(|e| KeelError::InvalidMetadata {
                path: path.to_path_buf(),
                reason: format!("{field} is not valid UTF-8: {e}"),
            })
    }

    pub fn initialize(&self, host: *const HostVTable) -> bool {
        // SAFETY: validated table, module open; `host` outlives the plugin.
        unsafe { (self.initialize)(self.instance, host) }
    }

    pub fn shutdown(&self) {
        // SAFETY: validated table, module open.
        unsafe { (self.shutdown)(self.instance) }
    }

    pub fn on_event(&self, event_type: &str, payload: &str) {
        let (Ok(event_type), Ok(payload)) = (CString::new(event_type), CString::new(payload))
        else {
            warn!(event_type, "dropping event containing an interior NUL byte");
            return;
        };
        // SAFETY: validated table, module open; both strings live across the call.
        unsafe { (self.on_event)(self.instance, event_type.as_ptr(), payload.as_ptr()) }
    }
}
