//! Safe authoring layer for plugins written in Rust.
//!
//! Implement [`Plugin`] and export it:
//!
//! ```ignore
//! use keel_plugin::sdk::{HostApi, Plugin};
//! use keel_plugin::Capabilities;
//!
//! #[derive(Default)]
//! struct Notes { host: Option<HostApi> }
//!
//! impl Plugin for Notes {
//!     fn id(&self) -> &str { "org.example.notes" }
//!     fn name(&self) -> &str { "Notes" }
//!     fn version(&self) -> &str { "1.0.0" }
//!     fn capabilities(&self) -> Capabilities { Capabilities::STORAGE_READ }
//!     fn initialize(&mut self, host: HostApi) -> bool {
//!         host.log("info", "notes ready");
//!         self.host = Some(host);
//!         true
//!     }
//! }
//!
//! keel_plugin::export_plugin!(Notes::default());
//! ```
//!
//! Panics never cross the ABI: a panicking `initialize` reports `false`, other
//! hooks swallow the panic.

use parking_lot::Mutex;
use std::ffi::{CString, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;

use crate::abi::{HostVTable, PluginVTable};
use crate::capability::Capabilities;

/// A plugin implemented in Rust.
pub trait Plugin: Send + 'static {
    /// Reverse-domain id, e.g. `org.example.notes`.
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Capabilities the plugin asks for. The host decides what is granted.
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Return `false` to refuse to run.
    fn initialize(&mut self, host: HostApi) -> bool;

    /// Called at most once. The [`HostApi`] must not be used afterwards.
    fn shutdown(&mut self) {}

    fn on_event(&mut self, _event_type: &str, _payload: &str) {}
}

/// Handle to the host table a plugin received in `initialize`.
///
/// Valid from `initialize` until the plugin's `shutdown` returns.
#[derive(Debug, Clone, Copy)]
pub struct HostApi {
    table: NonNull<HostVTable>,
}

// SAFETY: every host entry point is safe to call from any thread.
unsafe impl Send for HostApi {}
unsafe impl Sync for HostApi {}

impl HostApi {
    /// # Safety
    ///
    /// `table` must be null or the host table passed to `initialize`.
    pub unsafe fn from_raw(table: *const HostVTable) -> Option<Self> {
        NonNull::new(table as *mut HostVTable).map(|table| Self { table })
    }

    fn vt(&self) -> &HostVTable {
        // SAFETY: the host keeps the table alive while the plugin runs.
        unsafe { self.table.as_ref() }
    }

    /// True if any of `caps` is granted to this plugin.
    pub fn has_capability(&self, caps: Capabilities) -> bool {
        let vt = self.vt();
        // SAFETY: host-provided function with its own instance pointer.
        unsafe { (vt.has_capability)(vt.instance, caps.bits()) }
    }

    /// Ask the host to widen the grant. Denial is a normal outcome.
    pub fn request_capability(&self, caps: Capabilities) -> bool {
        let vt = self.vt();
        // SAFETY: as above.
        unsafe { (vt.request_capability)(vt.instance, caps.bits()) }
    }

    pub fn storage_service(&self) -> Option<NonNull<c_void>> {
        let vt = self.vt();
        // SAFETY: as above.
        NonNull::new(unsafe { (vt.get_storage_service)(vt.instance) })
    }

    pub fn network_service(&self) -> Option<NonNull<c_void>> {
        let vt = self.vt();
        // SAFETY: as above.
        NonNull::new(unsafe { (vt.get_network_service)(vt.instance) })
    }

    pub fn ui_service(&self) -> Option<NonNull<c_void>> {
        let vt = self.vt();
        // SAFETY: as above.
        NonNull::new(unsafe { (vt.get_ui_service)(vt.instance) })
    }

    pub fn log(&self, level: &str, message: &str) {
        let (Ok(level), Ok(message)) = (CString::new(level), CString::new(message)) else {
            return;
        };
        let vt = self.vt();
        // SAFETY: as above; both strings outlive the call.
        unsafe { (vt.log)(vt.instance, level.as_ptr(), message.as_ptr()) }
    }

    pub fn emit_event(&self, event_type: &str, payload: &str) {
        let (Ok(event_type), Ok(payload)) = (CString::new(event_type), CString::new(payload))
        else {
            return;
        };
        let vt = self.vt();
        // SAFETY: as above; both strings outlive the call.
        unsafe { (vt.emit_event)(vt.instance, event_type.as_ptr(), payload.as_ptr()) }
    }
}

struct Instance<P> {
    id: CString,
    name: CString,
    version: CString,
    capabilities: u64,
    plugin: Mutex<P>,
}

/// Build a plugin table for `plugin`.
///
/// The table and the plugin are leaked: plugin-owned memory is never freed by
/// the host, and the table must outlive every call the host makes.
pub fn into_vtable<P: Plugin>(plugin: P) -> *const PluginVTable {
    let text = |s: &str| CString::new(s).unwrap_or_default();
    let instance = Box::new(Instance {
        id: text(plugin.id()),
        name: text(plugin.name()),
        version: text(plugin.version()),
        capabilities: plugin.capabilities().bits(),
        plugin: Mutex::new(plugin),
    });
    let table = Box::new(PluginVTable {
        get_id: Some(get_id::<P>),
        get_name: Some(get_name::<P>),
        get_version: Some(get_version::<P>),
        get_capabilities: Some(get_capabilities::<P>),
        initialize: Some(initialize::<P>),
        shutdown: Some(shutdown::<P>),
        on_event: Some(on_event::<P>),
        instance: Box::into_raw(instance).cast(),
    });
    Box::into_raw(table)
}

/// # Safety
/// `ptr` is null or the instance pointer of a table built by [`into_vtable::<P>`].
unsafe fn instance<'a, P>(ptr: *mut c_void) -> Option<&'a Instance<P>> {
    // SAFETY: per the function contract.
    unsafe { (ptr as *const Instance<P>).as_ref() }
}

/// # Safety
/// `ptr` is null or a NUL-terminated string valid for the call.
unsafe fn text<'a>(ptr: *const c_char) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return std::borrow::Cow::Borrowed("");
    }
    // SAFETY: per the function contract.
    unsafe { std::ffi::CStr::from_ptr(ptr) }.to_string_lossy()
}

unsafe extern "C" fn get_id<P: Plugin>(ptr: *mut c_void) -> *const c_char {
    // SAFETY: the host passes back our own instance pointer.
    unsafe { instance::<P>(ptr) }.map_or(std::ptr::null(), |i| i.id.as_ptr())
}

unsafe extern "C" fn get_name<P: Plugin>(ptr: *mut c_void) -> *const c_char {
    // SAFETY: as above.
    unsafe { instance::<P>(ptr) }.map_or(std::ptr::null(), |i| i.name.as_ptr())
}

unsafe extern "C" fn get_version<P: Plugin>(ptr: *mut c_void) -> *const c_char {
    // SAFETY: as above.
    unsafe { instance::<P>(ptr) }.map_or(std::ptr::null(), |i| i.version.as_ptr())
}

unsafe extern "C" fn get_capabilities<P: Plugin>(ptr: *mut c_void) -> u64 {
    // SAFETY: as above.
    unsafe { instance::<P>(ptr) }.map_or(0, |i| i.capabilities)
}

unsafe extern "C" fn initialize<P: Plugin>(ptr: *mut c_void, host: *const HostVTable) -> bool {
    // SAFETY: as above; `host` is the table the host handed us.
    let Some(i) = (unsafe { instance::<P>(ptr) }) else {
        return false;
    };
    // SAFETY: as above.
    let Some(host) = (unsafe { HostApi::from_raw(host) }) else {
        return false;
    };
    catch_unwind(AssertUnwindSafe(|| i.plugin.lock().initialize(host))).unwrap_or(false)
}

unsafe extern "C" fn shutdown<P: Plugin>(ptr: *mut c_void) {
    // SAFETY: as above.
    if let Some(i) = unsafe { instance::<P>(ptr) } {
        let _ = catch_unwind(AssertUnwindSafe(|| i.plugin.lock().shutdown()));
    }
}

unsafe extern "C" fn on_event<P: Plugin>(
    ptr: *mut c_void,
    event_type: *const c_char,
    payload: *const c_char,
) {
    // SAFETY: as above; strings are valid for the call.
    let Some(i) = (unsafe { instance::<P>(ptr) }) else {
        return;
    };
    let (event_type, payload) = unsafe { (text(event_type), text(payload)) };
    let _ = catch_unwind(AssertUnwindSafe(|| {
        i.plugin.lock().on_event(&event_type, &payload)
    }));
}

#[doc(hidden)]
pub struct TablePtr(pub *const PluginVTable);

// SAFETY: the table is immutable once built.
unsafe impl Send for TablePtr {}
unsafe impl Sync for TablePtr {}

/// Export a [`Plugin`] as this library's `PluginInit` entry point.
///
/// The expression is evaluated once, on the first call; later calls return the
/// same table.
#[macro_export]
macro_rules! export_plugin {
    ($ctor:expr) => {
        #[allow(non_snake_case)]
        #[unsafe(no_mangle)]
        pub extern "C" fn PluginInit() -> *const $crate::abi::PluginVTable {
            static TABLE: ::std::sync::OnceLock<$crate::sdk::TablePtr> =
                ::std::sync::OnceLock::new();
            ::std::panic::catch_unwind(|| {
                TABLE
                    .get_or_init(|| $crate::sdk::TablePtr($crate::sdk::into_vtable($ctor)))
                    .0
            })
            .unwrap_or(::std::ptr::null())
        }
    };
}
