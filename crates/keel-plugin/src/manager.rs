use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capability::{Capabilities, CapabilityGrant, CapabilityPolicy};
use crate::host::{HostBinding, PluginHost};
use crate::interface::PluginInterface;
use crate::module::{Module, ModuleLoader, candidates};
use crate::verify::{Trust, TrustGate};
use keel_core::{Event, KeelError, Result};

/// Lifecycle state of one plugin id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    /// Found on disk, not yet opened.
    Discovered,
    Loaded,
    Initialized,
    ShuttingDown,
    Unloaded,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PluginState::Discovered => "discovered",
            PluginState::Loaded => "loaded",
            PluginState::Initialized => "initialized",
            PluginState::ShuttingDown => "shutting-down",
            PluginState::Unloaded => "unloaded",
        })
    }
}

/// A snapshot of one managed plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub state: PluginState,
    pub requested: Capabilities,
    pub granted: Capabilities,
    pub verified: bool,
}

/// A candidate that did not make it to `Loaded`.
#[derive(Debug)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: KeelError,
}

/// Outcome of scanning a plugin directory.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Ids loaded, in load order.
    pub loaded: Vec<String>,
    pub failures: Vec<LoadFailure>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Host-side record of one loaded plugin.
///
/// Field order matters only through [`PluginManager::release`], which tears
/// the record down explicitly: shutdown hook, then module, then host binding.
struct PluginDescriptor {
    id: String,
    name: String,
    version: String,
    path: PathBuf,
    requested: u64,
    verified: bool,
    state: PluginState,
    grant: Arc<CapabilityGrant>,
    interface: PluginInterface,
    module: Option<Box<dyn Module>>,
    binding: Option<HostBinding>,
}

impl PluginDescriptor {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            path: self.path.clone(),
            state: self.state,
            requested: Capabilities::from_bits_retain(self.requested),
            granted: self.grant.granted(),
            verified: self.verified,
        }
    }
}

/// Discovers, loads, initializes and unloads native plugins.
///
/// ## Loading
///
/// Candidates are processed one at a time, in directory-traversal order:
///
/// 1. trust gate: a sidecar manifest is verified before the module is opened
/// 2. open the module and resolve `PluginInit`
/// 3. call the entry point and validate the returned table
/// 4. read id/name/version/capabilities; reject duplicate ids
/// 5. check a verified manifest matches the module's identity
/// 6. compute the grant: requested ∩ policy ceiling
///
/// A failure at any step drops the module handle and moves on to the next
/// candidate.
///
/// ## Teardown
///
/// Plugins are released in reverse load order. An initialized plugin's
/// `shutdown` hook always returns before its module is closed.
pub struct PluginManager {
    loader: Arc<dyn ModuleLoader>,
    trust: TrustGate,
    policy: CapabilityPolicy,
    host: Arc<PluginHost>,
    plugins: Vec<PluginDescriptor>,
}

impl PluginManager {
    pub fn new(loader: Arc<dyn ModuleLoader>, host: Arc<PluginHost>) -> Self {
        Self {
            loader,
            trust: TrustGate::open(),
            policy: CapabilityPolicy::least_privilege(),
            host,
            plugins: Vec::new(),
        }
    }

    /// A manager that opens real shared libraries.
    #[cfg(feature = "native")]
    pub fn native(host: Arc<PluginHost>) -> Self {
        Self::new(Arc::new(crate::module::NativeLoader), host)
    }

    pub fn with_trust(mut self, trust: TrustGate) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_policy(mut self, policy: CapabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn host(&self) -> &Arc<PluginHost> {
        &self.host
    }

    pub fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    /// Scan `dir` recursively for files with `extension` and load each one.
    pub fn discover(&mut self, dir: &Path, extension: &str) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        if !dir.exists() {
            info!(?dir, "plugin directory does not exist, skipping discovery");
            return report;
        }

        for path in candidates(dir, extension) {
            debug!(path = ?path, state = %PluginState::Discovered, "plugin candidate");
            match self.load(&path) {
                Ok(id) => report.loaded.push(id),
                Err(e) => {
                    warn!(path = ?path, error = %e, "failed to load plugin");
                    self.host.events().publish(Event::PluginError {
                        plugin_id: path.display().to_string(),
                        error: e.to_string(),
                    });
                    report.failures.push(LoadFailure { path, error: e });
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            "plugin discovery complete"
        );
        report
    }

    /// Load a single module. On success the plugin is `Loaded` and its id returned.
    pub fn load(&mut self, path: &Path) -> Result<String> {
        let trust = self.trust.check(path)?;

        let module = self.loader.open(path)?;
        let entry = module.entry()?;
        // SAFETY: `entry` was resolved from `module`, which is still open.
        let table = unsafe { entry() };
        // SAFETY: the entry contract yields null or a valid table tied to `module`.
        let interface = unsafe { PluginInterface::from_raw(table, path) }?;
        let meta = interface.metadata(path)?;

        if self.index(&meta.id).is_some() {
            return Err(KeelError::DuplicateId(meta.id));
        }

        if let Some(manifest) = trust.manifest() {
            if manifest.id != meta.id || manifest.version != meta.version {
                return Err(KeelError::ManifestMismatch {
                    path: path.to_path_buf(),
                    reason: format!(
                        "manifest declares {}@{}, module reports {}@{}",
                        manifest.id, manifest.version, meta.id, meta.version
                    ),
                });
            }
        }

        let ceiling = self
            .policy
            .ceiling(&meta.id, trust.manifest().map(|m| m.capability_flags()));
        let grant = Arc::new(CapabilityGrant::new(&meta.id, meta.requested, ceiling));
        let requested = Capabilities::from_bits_retain(meta.requested);
        if !grant.granted().satisfies(requested) {
            warn!(
                plugin = %meta.id,
                requested = %requested,
                granted = %grant.granted(),
                "requested capabilities exceed policy; grant clipped"
            );
        }

        info!(
            plugin = %meta.id,
            version = %meta.version,
            verified = matches!(trust, Trust::Verified(_)),
            "plugin loaded"
        );
        self.host.events().publish(Event::PluginLoaded {
            plugin_id: meta.id.clone(),
            version: meta.version.clone(),
        });

        let id = meta.id.clone();
        self.plugins.push(PluginDescriptor {
            id: meta.id,
            name: meta.name,
            version: meta.version,
            path: path.to_path_buf(),
            requested: meta.requested,
            verified: matches!(trust, Trust::Verified(_)),
            state: PluginState::Loaded,
            grant,
            interface,
            module: Some(module),
            binding: None,
        });
        Ok(id)
    }

    /// Initialize one `Loaded` plugin with its own host binding.
    pub fn initialize(&mut self, id: &str) -> Result<()> {
        let host = Arc::clone(&self.host);
        let idx = self.index(id).ok_or_else(|| KeelError::PluginNotFound(id.into()))?;
        let plugin = &mut self.plugins[idx];
        if plugin.state != PluginState::Loaded {
            return Err(KeelError::InvalidState {
                id: id.into(),
                expected: PluginState::Loaded.to_string(),
                found: plugin.state.to_string(),
            });
        }

        let binding = host.bind(Arc::clone(&plugin.grant));
        let accepted = plugin.interface.initialize(binding.as_ptr());
        plugin.binding = Some(binding);

        if accepted {
            plugin.state = PluginState::Initialized;
            info!(plugin = %id, granted = %plugin.grant.granted(), "plugin initialized");
            host.events().publish(Event::PluginInitialized {
                plugin_id: id.into(),
            });
            Ok(())
        } else {
            warn!(plugin = %id, "plugin refused to initialize");
            host.events().publish(Event::PluginError {
                plugin_id: id.into(),
                error: "initialize returned false".into(),
            });
            Err(KeelError::InitRefused(id.into()))
        }
    }

    /// Initialize every `Loaded` plugin in load order. Returns how many succeeded.
    pub fn initialize_all(&mut self) -> usize {
        let pending: Vec<String> = self
            .plugins
            .iter()
            .filter(|p| p.state == PluginState::Loaded)
            .map(|p| p.id.clone())
            .collect();
        pending
            .iter()
            .filter(|id| self.initialize(id).is_ok())
            .count()
    }

    /// Deliver an event to every `Initialized` plugin except `source`.
    /// Returns the number of plugins it was delivered to.
    pub fn dispatch(&self, source: Option<&str>, event_type: &str, payload: &str) -> usize {
        let mut delivered = 0;
        for plugin in &self.plugins {
            if plugin.state != PluginState::Initialized || Some(plugin.id.as_str()) == source {
                continue;
            }
            plugin.interface.on_event(event_type, payload);
            delivered += 1;
        }
        delivered
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.index(id).map(|i| self.plugins[i].state)
    }

    pub fn info(&self, id: &str) -> Option<PluginInfo> {
        self.index(id).map(|i| self.plugins[i].info())
    }

    /// All managed plugins, in load order.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.plugins.iter().map(PluginDescriptor::info).collect()
    }

    pub fn grant(&self, id: &str) -> Option<Arc<CapabilityGrant>> {
        self.index(id).map(|i| Arc::clone(&self.plugins[i].grant))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Shut down (if initialized) and unload one plugin.
    pub fn unload(&mut self, id: &str) -> Result<()> {
        let idx = self.index(id).ok_or_else(|| KeelError::PluginNotFound(id.into()))?;
        let plugin = self.plugins.remove(idx);
        self.release(plugin);
        Ok(())
    }

    /// Unload every plugin that loaded but never initialized. Returns their ids.
    pub fn unload_uninitialized(&mut self) -> Vec<String> {
        let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.plugins)
            .into_iter()
            .partition(|p| p.state == PluginState::Loaded);
        self.plugins = kept;
        stale
            .into_iter()
            .rev()
            .map(|plugin| {
                let id = plugin.id.clone();
                self.release(plugin);
                id
            })
            .collect()
    }

    /// Release every plugin, most recently loaded first.
    pub fn shutdown_all(&mut self) {
        while let Some(plugin) = self.plugins.pop() {
            self.release(plugin);
        }
    }

    fn release(&self, mut plugin: PluginDescriptor) {
        if plugin.state == PluginState::Initialized {
            plugin.state = PluginState::ShuttingDown;
            debug!(plugin = %plugin.id, "calling plugin shutdown");
            plugin.interface.shutdown();
        }
        // Module first: the plugin's code must be gone before the table it
        // was handed is freed.
        drop(plugin.module.take());
        drop(plugin.binding.take());
        plugin.state = PluginState::Unloaded;

        info!(plugin = %plugin.id, "plugin unloaded");
        self.host.events().publish(Event::PluginUnloaded {
            plugin_id: plugin.id,
        });
    }

    fn index(&self, id: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.id == id)
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("policy", &self.policy)
            .field("plugins", &self.plugins.iter().map(|p| &p.id).collect::<Vec<_>>())
            .finish()
    }
}
