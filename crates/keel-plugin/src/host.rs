use std::any::Any;
use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::abi::HostVTable;
use crate::capability::{Capabilities, CapabilityGrant};
use keel_core::{Event, EventBus};

/// A host-owned service object handed to plugins as an opaque pointer.
pub type Service = Arc<dyn Any + Send + Sync>;

/// The service categories a plugin can ask the host for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Storage,
    Network,
    Ui,
}

impl ServiceKind {
    /// Holding any one of these capabilities unlocks the service.
    pub fn required(self) -> Capabilities {
        match self {
            ServiceKind::Storage => Capabilities::STORAGE_READ | Capabilities::STORAGE_WRITE,
            ServiceKind::Network => Capabilities::PEER_NETWORK | Capabilities::MASTER_NETWORK,
            ServiceKind::Ui => Capabilities::UI_PANEL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Storage => "storage",
            ServiceKind::Network => "network",
            ServiceKind::Ui => "ui",
        }
    }
}

/// Service objects the host can expose. Unset slots are never exposed.
#[derive(Clone, Default)]
pub struct HostServices {
    storage: Option<Service>,
    network: Option<Service>,
    ui: Option<Service>,
}

impl HostServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(mut self, service: Service) -> Self {
        self.storage = Some(service);
        self
    }

    pub fn with_network(mut self, service: Service) -> Self {
        self.network = Some(service);
        self
    }

    pub fn with_ui(mut self, service: Service) -> Self {
        self.ui = Some(service);
        self
    }

    pub fn get(&self, kind: ServiceKind) -> Option<&Service> {
        match kind {
            ServiceKind::Storage => self.storage.as_ref(),
            ServiceKind::Network => self.network.as_ref(),
            ServiceKind::Ui => self.ui.as_ref(),
        }
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices")
            .field("storage", &self.storage.is_some())
            .field("network", &self.network.is_some())
            .field("ui", &self.ui.is_some())
            .finish()
    }
}

/// The process-wide host. Shared by every plugin binding and kept alive by
/// them, so it always outlives the plugins it serves.
#[derive(Debug)]
pub struct PluginHost {
    services: HostServices,
    events: EventBus,
    headless: bool,
}

impl PluginHost {
    pub fn new(events: EventBus) -> Self {
        Self {
            services: HostServices::default(),
            events,
            headless: false,
        }
    }

    pub fn with_services(mut self, services: HostServices) -> Self {
        self.services = services;
        self
    }

    /// In headless mode the UI service is never exposed.
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The capability-gated service lookup behind `get_*_service`.
    pub fn service(&self, kind: ServiceKind, grant: &CapabilityGrant) -> Option<&Service> {
        if kind == ServiceKind::Ui && self.headless {
            return None;
        }
        if !grant.has_any(kind.required().bits()) {
            debug!(
                plugin = %grant.plugin_id(),
                service = kind.name(),
                "service denied: capability not granted"
            );
            return None;
        }
        self.services.get(kind)
    }

    /// Create the host table handed to one plugin's `initialize`.
    pub fn bind(self: &Arc<Self>, grant: Arc<CapabilityGrant>) -> HostBinding {
        HostBinding::new(Arc::clone(self), grant)
    }
}

/// A per-plugin host table.
///
/// The table's `instance` pointer refers to this binding, so every callback
/// knows which plugin is calling and consults that plugin's grant only. The
/// binding is boxed so the pointer stays valid for as long as it lives.
pub struct HostBinding {
    inner: Box<Binding>,
}

struct Binding {
    vtable: HostVTable,
    grant: Arc<CapabilityGrant>,
    host: Arc<PluginHost>,
}

// SAFETY: the only raw pointer is `vtable.instance`, which points at the
// binding itself; all shared state behind it is `Sync`.
unsafe impl Send for HostBinding {}
unsafe impl Sync for HostBinding {}

impl HostBinding {
    fn new(host: Arc<PluginHost>, grant: Arc<CapabilityGrant>) -> Self {
        let mut inner = Box::new(Binding {
            vtable: HostVTable {
                get_storage_service: storage_service,
                get_network_service: network_service,
                get_ui_service: ui_service,
                has_capability,
                log,
                emit_event,
                request_capability,
                instance: std::ptr::null_mut(),
            },
            grant,
            host,
        });
        inner.vtable.instance = &*inner as *const Binding as *mut c_void;
        Self { inner }
    }

    /// Pointer passed to the plugin's `initialize`. Valid while `self` lives.
    pub fn as_ptr(&self) -> *const HostVTable {
        &self.inner.vtable
    }

    pub fn plugin_id(&self) -> &str {
        self.inner.grant.plugin_id()
    }

    pub fn grant(&self) -> &Arc<CapabilityGrant> {
        &self.inner.grant
    }
}

impl fmt::Debug for HostBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBinding")
            .field("plugin", &self.plugin_id())
            .field("granted", &self.inner.grant.granted())
            .finish()
    }
}

// ── ABI callbacks ──────────────────────────────────────────────
//
// Entry points may be called from any plugin thread. None of them may unwind
// into plugin code: a panic is logged and the neutral value returned.

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("panic inside host callback");
        fallback
    })
}

/// # Safety
/// `host` is null or the `instance` of a live [`HostBinding`].
unsafe fn binding<'a>(host: *mut c_void) -> Option<&'a Binding> {
    // SAFETY: per the function contract.
    unsafe { (host as *const Binding).as_ref() }
}

/// # Safety
/// `ptr` is null or a NUL-terminated string valid for the call.
unsafe fn lossy(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: per the function contract.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn service_handle(host: *mut c_void, kind: ServiceKind) -> *mut c_void {
    guarded(std::ptr::null_mut(), || {
        // SAFETY: `host` comes from the table we handed out.
        let Some(b) = (unsafe { binding(host) }) else {
            return std::ptr::null_mut();
        };
        match b.host.service(kind, &b.grant) {
            Some(service) => Arc::as_ptr(service) as *const () as *mut c_void,
            None => std::ptr::null_mut(),
        }
    })
}

unsafe extern "C" fn storage_service(host: *mut c_void) -> *mut c_void {
    service_handle(host, ServiceKind::Storage)
}

unsafe extern "C" fn network_service(host: *mut c_void) -> *mut c_void {
    service_handle(host, ServiceKind::Network)
}

unsafe extern "C" fn ui_service(host: *mut c_void) -> *mut c_void {
    service_handle(host, ServiceKind::Ui)
}

/// True iff the calling plugin's grant intersects `cap`.
unsafe extern "C" fn has_capability(host: *mut c_void, cap: u64) -> bool {
    guarded(false, || {
        // SAFETY: `host` comes from the table we handed out.
        unsafe { binding(host) }.is_some_and(|b| b.grant.has_any(cap))
    })
}

unsafe extern "C" fn request_capability(host: *mut c_void, cap: u64) -> bool {
    guarded(false, || {
        // SAFETY: `host` comes from the table we handed out.
        unsafe { binding(host) }.is_some_and(|b| b.grant.request(cap))
    })
}

unsafe extern "C" fn log(host: *mut c_void, level: *const c_char, message: *const c_char) {
    guarded((), || {
        // SAFETY: pointers come from the plugin under the ABI contract.
        let (b, level, message) = unsafe { (binding(host), lossy(level), lossy(message)) };
        let plugin = b.map_or("<unbound>", |b| b.grant.plugin_id());
        forward_log(plugin, level.as_deref().unwrap_or(""), message.as_deref().unwrap_or(""));
    })
}

unsafe extern "C" fn emit_event(host: *mut c_void, event_type: *const c_char, data: *const c_char) {
    guarded((), || {
        // SAFETY: pointers come from the plugin under the ABI contract.
        let (b, event_type, data) = unsafe { (binding(host), lossy(event_type), lossy(data)) };
        let Some(b) = b else { return };
        let Some(event_type) = event_type else {
            warn!(plugin = %b.grant.plugin_id(), "emit_event called without an event type");
            return;
        };
        let delivered = b.host.events.publish(Event::plugin(
            b.grant.plugin_id(),
            &event_type,
            data.as_deref().unwrap_or(""),
        ));
        trace!(
            plugin = %b.grant.plugin_id(),
            event_type = %event_type,
            delivered,
            "plugin event published"
        );
    })
}

/// Route a plugin log line into `tracing`. The level string is kept verbatim
/// as a field; anything unrecognized is logged at INFO.
pub fn forward_log(plugin: &str, level: &str, message: &str) {
    match level.to_ascii_lowercase().as_str() {
        "error" | "fatal" | "critical" => error!(plugin, plugin_level = level, "{message}"),
        "warn" | "warning" => warn!(plugin, plugin_level = level, "{message}"),
        "debug" => debug!(plugin, plugin_level = level, "{message}"),
        "trace" => trace!(plugin, plugin_level = level, "{message}"),
        _ => info!(plugin, plugin_level = level, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use std::ffi::CString;

    struct Store;

    fn host(headless: bool) -> Arc<PluginHost> {
        let services = HostServices::new()
            .with_storage(Arc::new(Store))
            .with_network(Arc::new(Store))
            .with_ui(Arc::new(Store));
        Arc::new(
            PluginHost::new(EventBus::new(16))
                .with_services(services)
                .headless(headless),
        )
    }

    fn bind(host: &Arc<PluginHost>, granted: Capabilities, ceiling: Capabilities) -> HostBinding {
        host.bind(Arc::new(CapabilityGrant::new("org.test.plugin", granted.bits(), ceiling)))
    }

    fn call_service(b: &HostBinding, f: fn(&HostVTable) -> crate::abi::ServiceFn) -> *mut c_void {
        let vt = unsafe { &*b.as_ptr() };
        unsafe { f(vt)(vt.instance) }
    }

    #[test]
    fn host_debug_shows_services_and_mode() {
        let host = PluginHost::new(EventBus::new(4)).headless(true);
        let text = format!("{host:?}");
        assert!(text.contains("PluginHost"));
        assert!(text.contains("headless: true"));
        assert!(text.contains("storage: false"));
    }

    #[test]
    fn binding_instance_points_at_itself() {
        let h = host(false);
        let b = bind(&h, Capabilities::empty(), Capabilities::empty());
        let vt = unsafe { &*b.as_ptr() };
        assert!(!vt.instance.is_null());
        assert_eq!(b.plugin_id(), "org.test.plugin");
    }

    #[test]
    fn storage_service_requires_storage_capability() {
        let h = host(false);
        for granted in [
            Capabilities::empty(),
            Capabilities::STORAGE_READ,
            Capabilities::STORAGE_WRITE,
            Capabilities::STORAGE_READ | Capabilities::STORAGE_WRITE,
            Capabilities::PEER_NETWORK | Capabilities::UI_PANEL,
        ] {
            let b = bind(&h, granted, Capabilities::all());
            let vt = unsafe { &*b.as_ptr() };
            let allowed = unsafe {
                (vt.has_capability)(
                    vt.instance,
                    Capabilities::STORAGE_READ.bits() | Capabilities::STORAGE_WRITE.bits(),
                )
            };
            let handle = call_service(&b, |vt| vt.get_storage_service);
            assert_eq!(allowed, !handle.is_null(), "granted={granted}");
        }
    }

    #[test]
    fn missing_service_is_null_even_when_granted() {
        let h = Arc::new(PluginHost::new(EventBus::new(4)));
        let b = bind(&h, Capabilities::all(), Capabilities::all());
        assert!(call_service(&b, |vt| vt.get_storage_service).is_null());
    }

    #[test]
    fn headless_never_exposes_ui() {
        let b = bind(&host(true), Capabilities::UI_PANEL, Capabilities::all());
        assert!(call_service(&b, |vt| vt.get_ui_service).is_null());
        let b = bind(&host(false), Capabilities::UI_PANEL, Capabilities::all());
        assert!(!call_service(&b, |vt| vt.get_ui_service).is_null());
    }

    #[test]
    fn bindings_do_not_share_grants() {
        let h = host(false);
        let a = bind(&h, Capabilities::MASTER_NETWORK, Capabilities::all());
        let b = bind(&h, Capabilities::empty(), Capabilities::all());
        assert!(!call_service(&a, |vt| vt.get_network_service).is_null());
        assert!(call_service(&b, |vt| vt.get_network_service).is_null());
    }

    #[test]
    fn request_capability_goes_through_grant() {
        let h = host(false);
        let b = bind(&h, Capabilities::empty(), Capabilities::STORAGE_WRITE);
        let vt = unsafe { &*b.as_ptr() };
        unsafe {
            assert!(!(vt.request_capability)(vt.instance, Capability::PeerNetwork.bit()));
            assert!((vt.request_capability)(vt.instance, Capability::StorageWrite.bit()));
            assert!((vt.has_capability)(vt.instance, Capability::StorageWrite.bit()));
        }
        assert!(b.grant().has(Capability::StorageWrite));
    }

    #[test]
    fn emit_event_publishes_with_source() {
        let h = host(false);
        let mut rx = h.events().subscribe();
        let b = bind(&h, Capabilities::empty(), Capabilities::empty());
        let vt = unsafe { &*b.as_ptr() };
        let ty = CString::new("note.saved").unwrap();
        let data = CString::new(r#"{"id":1}"#).unwrap();
        unsafe { (vt.emit_event)(vt.instance, ty.as_ptr(), data.as_ptr()) };
        match rx.try_recv().unwrap() {
            Event::Plugin {
                source,
                event_type,
                payload,
                ..
            } => {
                assert_eq!(source, "org.test.plugin");
                assert_eq!(event_type, "note.saved");
                assert_eq!(payload, r#"{"id":1}"#);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn callbacks_tolerate_null_pointers() {
        let h = host(false);
        let b = bind(&h, Capabilities::all(), Capabilities::all());
        let vt = unsafe { &*b.as_ptr() };
        let level = CString::new("LOUD").unwrap();
        unsafe {
            (vt.log)(vt.instance, level.as_ptr(), std::ptr::null());
            (vt.log)(std::ptr::null_mut(), std::ptr::null(), std::ptr::null());
            (vt.emit_event)(vt.instance, std::ptr::null(), std::ptr::null());
            assert!(!(vt.has_capability)(std::ptr::null_mut(), u64::MAX));
            assert!((vt.get_storage_service)(std::ptr::null_mut()).is_null());
        }
    }
}
