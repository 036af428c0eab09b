//! Shared fixtures: an in-memory module loader, a scriptable plugin and an
//! Ed25519 signer.

#![allow(dead_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_core::{EventBus, KeelError};
use keel_plugin::abi::{PluginEntryFn, PluginVTable};
use keel_plugin::module::{Module, ModuleLoader};
use keel_plugin::sdk::{HostApi, Plugin, into_vtable};
use keel_plugin::{
    Capabilities, CapabilityPolicy, HostServices, PluginHost, PluginManager, canonical_bytes,
};

/// Ordered record of what plugins and modules did.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, line: impl Into<String>) {
        self.0.lock().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, line: &str) -> bool {
        self.0.lock().iter().any(|l| l == line)
    }

    pub fn position(&self, line: &str) -> Option<usize> {
        self.0.lock().iter().position(|l| l == line)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

// ── Loader ─────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Table(*const PluginVTable);

// SAFETY: tables built by `into_vtable` are immutable and leaked.
unsafe impl Send for Table {}
unsafe impl Sync for Table {}

#[derive(Clone, Copy)]
enum Image {
    Plugin(Table),
    NullTable,
    NoEntry,
}

thread_local! {
    static STAGED: Cell<*const PluginVTable> = const { Cell::new(std::ptr::null()) };
}

extern "C" fn staged_entry() -> *const PluginVTable {
    STAGED.with(Cell::get)
}

/// Serves plugin tables registered per path. Files must still exist on disk
/// so discovery finds them.
#[derive(Clone, Default)]
pub struct MemoryLoader {
    images: Arc<Mutex<HashMap<PathBuf, Image>>>,
    journal: Journal,
}

impl MemoryLoader {
    pub fn new(journal: Journal) -> Self {
        Self {
            images: Arc::default(),
            journal,
        }
    }

    pub fn install(&self, path: &Path, plugin: impl Plugin) {
        self.put(path, Image::Plugin(Table(into_vtable(plugin))));
    }

    /// A module that opens fine but does not export the entry symbol.
    pub fn install_without_entry(&self, path: &Path) {
        self.put(path, Image::NoEntry);
    }

    pub fn install_null_table(&self, path: &Path) {
        self.put(path, Image::NullTable);
    }

    fn put(&self, path: &Path, image: Image) {
        std::fs::write(path, b"").unwrap();
        self.images.lock().insert(path.to_path_buf(), image);
    }
}

impl ModuleLoader for MemoryLoader {
    fn open(&self, path: &Path) -> keel_core::Result<Box<dyn Module>> {
        let image = self
            .images
            .lock()
            .get(path)
            .copied()
            .ok_or_else(|| KeelError::ModuleOpen {
                path: path.to_path_buf(),
                reason: "not a module".into(),
            })?;
        self.journal.push(format!("open:{}", file_name(path)));
        Ok(Box::new(MemoryModule {
            path: path.to_path_buf(),
            image,
            journal: self.journal.clone(),
        }))
    }
}

struct MemoryModule {
    path: PathBuf,
    image: Image,
    journal: Journal,
}

impl Module for MemoryModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn entry(&self) -> keel_core::Result<PluginEntryFn> {
        let table = match self.image {
            Image::Plugin(table) => table.0,
            Image::NullTable => std::ptr::null(),
            Image::NoEntry => {
                return Err(KeelError::MissingEntry {
                    path: self.path.clone(),
                    symbol: keel_plugin::module::symbol_name(),
                });
            }
        };
        STAGED.with(|staged| staged.set(table));
        Ok(staged_entry as PluginEntryFn)
    }
}

impl Drop for MemoryModule {
    fn drop(&mut self) {
        self.journal.push(format!("close:{}", file_name(&self.path)));
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ── Plugin ─────────────────────────────────────────────────────

/// A plugin that journals everything that happens to it.
pub struct Probe {
    id: String,
    version: String,
    requested: Capabilities,
    accept: bool,
    request_on_init: Option<Capabilities>,
    emit_on_init: Option<(String, String)>,
    journal: Journal,
    host: Option<HostApi>,
}

impl Probe {
    pub fn new(id: &str, journal: &Journal) -> Self {
        Self {
            id: id.into(),
            version: "1.0.0".into(),
            requested: Capabilities::empty(),
            accept: true,
            request_on_init: None,
            emit_on_init: None,
            journal: journal.clone(),
            host: None,
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.into();
        self
    }

    pub fn requesting(mut self, caps: Capabilities) -> Self {
        self.requested = caps;
        self
    }

    pub fn refusing(mut self) -> Self {
        self.accept = false;
        self
    }

    pub fn request_on_init(mut self, caps: Capabilities) -> Self {
        self.request_on_init = Some(caps);
        self
    }

    pub fn emit_on_init(mut self, event_type: &str, payload: &str) -> Self {
        self.emit_on_init = Some((event_type.into(), payload.into()));
        self
    }
}

impl Plugin for Probe {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Probe"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn capabilities(&self) -> Capabilities {
        self.requested
    }

    fn initialize(&mut self, host: HostApi) -> bool {
        let storage = Capabilities::STORAGE_READ | Capabilities::STORAGE_WRITE;
        self.journal.push(format!("init:{}", self.id));
        self.journal
            .push(format!("has_storage:{}:{}", self.id, host.has_capability(storage)));
        self.journal.push(format!(
            "storage_service:{}:{}",
            self.id,
            host.storage_service().is_some()
        ));
        if let Some(caps) = self.request_on_init {
            let granted = host.request_capability(caps);
            self.journal.push(format!("request:{}:{granted}", self.id));
        }
        if let Some((event_type, payload)) = &self.emit_on_init {
            host.emit_event(event_type, payload);
        }
        host.log("info", "probe ready");
        self.host = Some(host);
        self.accept
    }

    fn shutdown(&mut self) {
        // The host table must still answer while shutdown runs.
        if let Some(host) = self.host {
            host.log("debug", "probe shutting down");
            host.has_capability(Capabilities::all());
        }
        self.journal.push(format!("shutdown:{}", self.id));
    }

    fn on_event(&mut self, event_type: &str, payload: &str) {
        self.journal
            .push(format!("event:{}:{event_type}:{payload}", self.id));
    }
}

// ── Signing ────────────────────────────────────────────────────

pub struct Signer {
    pair: Ed25519KeyPair,
}

impl Signer {
    pub fn generate() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Self {
            pair: Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap(),
        }
    }

    pub fn write_public_key(&self, path: &Path) {
        std::fs::write(path, STANDARD.encode(self.pair.public_key().as_ref())).unwrap();
    }

    /// Sign the canonical form of `manifest` into `signature`.
    pub fn sign(&self, manifest: &Path, signature: &Path) {
        let bytes = canonical_bytes(&std::fs::read(manifest).unwrap()).unwrap();
        let sig = self.pair.sign(&bytes);
        std::fs::write(signature, STANDARD.encode(sig.as_ref())).unwrap();
    }
}

// ── Manager ────────────────────────────────────────────────────

pub struct Storage;

/// A host offering a storage service.
pub fn host() -> Arc<PluginHost> {
    let services = HostServices::new().with_storage(Arc::new(Storage));
    Arc::new(PluginHost::new(EventBus::new(64)).with_services(services))
}

pub fn manager(loader: &MemoryLoader, policy: CapabilityPolicy) -> PluginManager {
    PluginManager::new(Arc::new(loader.clone()), host()).with_policy(policy)
}

pub fn so(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.so"))
}
