//! Capability bits, grant bookkeeping, and the policy that decides grants.
//!
//! A plugin's *requested* mask is only ever an input. What it may actually use
//! is its [`CapabilityGrant`], which lives in host memory and is bounded by the
//! ceiling the [`CapabilityPolicy`] computes for that plugin id.

use bitflags::bitflags;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub use keel_config::PolicyMode;

bitflags! {
    /// A set of capabilities, one bit per [`Capability`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u64 {
        const STORAGE_READ = 1 << 0;
        const STORAGE_WRITE = 1 << 1;
        const PEER_NETWORK = 1 << 2;
        const MASTER_NETWORK = 1 << 3;
        const UI_PANEL = 1 << 4;
        const NOTIFICATIONS = 1 << 5;
        const FILESYSTEM_READ = 1 << 6;
        const FILESYSTEM_WRITE = 1 << 7;
        const SUBPROCESS_SPAWN = 1 << 8;
        const SYSTEM_INFO_READ = 1 << 9;
    }
}

/// A single named privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    StorageRead,
    StorageWrite,
    PeerNetwork,
    MasterNetwork,
    UiPanel,
    Notifications,
    FilesystemRead,
    FilesystemWrite,
    SubprocessSpawn,
    SystemInfoRead,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::StorageRead,
        Capability::StorageWrite,
        Capability::PeerNetwork,
        Capability::MasterNetwork,
        Capability::UiPanel,
        Capability::Notifications,
        Capability::FilesystemRead,
        Capability::FilesystemWrite,
        Capability::SubprocessSpawn,
        Capability::SystemInfoRead,
    ];

    pub fn flag(self) -> Capabilities {
        match self {
            Capability::StorageRead => Capabilities::STORAGE_READ,
            Capability::StorageWrite => Capabilities::STORAGE_WRITE,
            Capability::PeerNetwork => Capabilities::PEER_NETWORK,
            Capability::MasterNetwork => Capabilities::MASTER_NETWORK,
            Capability::UiPanel => Capabilities::UI_PANEL,
            Capability::Notifications => Capabilities::NOTIFICATIONS,
            Capability::FilesystemRead => Capabilities::FILESYSTEM_READ,
            Capability::FilesystemWrite => Capabilities::FILESYSTEM_WRITE,
            Capability::SubprocessSpawn => Capabilities::SUBPROCESS_SPAWN,
            Capability::SystemInfoRead => Capabilities::SYSTEM_INFO_READ,
        }
    }

    pub fn bit(self) -> u64 {
        self.flag().bits()
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::StorageRead => "storage-read",
            Capability::StorageWrite => "storage-write",
            Capability::PeerNetwork => "peer-network",
            Capability::MasterNetwork => "master-network",
            Capability::UiPanel => "ui-panel",
            Capability::Notifications => "notifications",
            Capability::FilesystemRead => "filesystem-read",
            Capability::FilesystemWrite => "filesystem-write",
            Capability::SubprocessSpawn => "subprocess-spawn",
            Capability::SystemInfoRead => "system-info-read",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

impl From<Capability> for Capabilities {
    fn from(cap: Capability) -> Self {
        cap.flag()
    }
}

/// `true` iff every bit of `required` is set in `granted`.
pub fn satisfies(granted: u64, required: u64) -> bool {
    granted & required == required
}

/// Single-bit test.
pub fn has(granted: u64, capability: Capability) -> bool {
    granted & capability.bit() != 0
}

impl Capabilities {
    pub fn satisfies(self, required: Capabilities) -> bool {
        satisfies(self.bits(), required.bits())
    }

    pub fn has(self, capability: Capability) -> bool {
        has(self.bits(), capability)
    }

    /// Parse capability names, returning the set and the names that were not recognized.
    pub fn from_names<I, S>(names: I) -> (Capabilities, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut caps = Capabilities::empty();
        let mut unknown = Vec::new();
        for name in names {
            match name.as_ref().parse::<Capability>() {
                Ok(cap) => caps |= cap.flag(),
                Err(_) => unknown.push(name.as_ref().to_string()),
            }
        }
        (caps, unknown)
    }

    pub fn names(self) -> Vec<&'static str> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.has(*c))
            .map(Capability::name)
            .collect()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join(","))
    }
}

// ── Policy ─────────────────────────────────────────────────────

/// Host-side policy deciding the capability ceiling of each plugin.
#[derive(Debug, Clone, Default)]
pub struct CapabilityPolicy {
    mode: PolicyMode,
    allow: HashMap<String, Capabilities>,
}

impl CapabilityPolicy {
    pub fn new(mode: PolicyMode) -> Self {
        Self {
            mode,
            allow: HashMap::new(),
        }
    }

    pub fn least_privilege() -> Self {
        Self::new(PolicyMode::LeastPrivilege)
    }

    pub fn permissive() -> Self {
        Self::new(PolicyMode::Permissive)
    }

    /// Add capabilities to a plugin's allow-list.
    pub fn allow(mut self, plugin_id: impl Into<String>, caps: Capabilities) -> Self {
        *self.allow.entry(plugin_id.into()).or_default() |= caps;
        self
    }

    pub fn from_config(config: &keel_config::PluginsConfig) -> Self {
        let mut policy = Self::new(config.policy);
        for (id, names) in &config.grants {
            let (caps, unknown) = Capabilities::from_names(names);
            for name in unknown {
                warn!(plugin = %id, capability = %name, "ignoring unknown capability in grants");
            }
            policy = policy.allow(id.clone(), caps);
        }
        policy
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    /// The most a plugin may ever hold. `manifest` is the capability list of a
    /// manifest that passed signature verification, if any.
    pub fn ceiling(&self, plugin_id: &str, manifest: Option<Capabilities>) -> Capabilities {
        match self.mode {
            PolicyMode::Permissive => Capabilities::all(),
            PolicyMode::LeastPrivilege => {
                self.allow.get(plugin_id).copied().unwrap_or_default()
                    | manifest.unwrap_or_default()
            }
        }
    }
}

// ── Grant ──────────────────────────────────────────────────────

/// The capabilities actually authorized for one plugin instance.
#[derive(Debug)]
pub struct CapabilityGrant {
    plugin_id: String,
    ceiling: Capabilities,
    granted: RwLock<Capabilities>,
}

impl CapabilityGrant {
    /// Initial grant: what the plugin asked for, clipped to the ceiling.
    /// Unknown bits in `requested` are dropped.
    pub fn new(plugin_id: impl Into<String>, requested: u64, ceiling: Capabilities) -> Self {
        let granted = Capabilities::from_bits_truncate(requested) & ceiling;
        Self {
            plugin_id: plugin_id.into(),
            ceiling,
            granted: RwLock::new(granted),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn granted(&self) -> Capabilities {
        *self.granted.read()
    }

    pub fn ceiling(&self) -> Capabilities {
        self.ceiling
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.granted().has(capability)
    }

    /// `true` if any bit of `mask` is granted.
    pub fn has_any(&self, mask: u64) -> bool {
        self.granted().bits() & mask != 0
    }

    pub fn satisfies(&self, required: Capabilities) -> bool {
        self.granted().satisfies(required)
    }

    /// Runtime re-authorization. Widens the grant iff every requested bit is
    /// a known capability within the ceiling.
    pub fn request(&self, requested: u64) -> bool {
        let Some(requested) = Capabilities::from_bits(requested) else {
            debug!(
                plugin = %self.plugin_id,
                mask = requested,
                "capability request with unknown bits denied"
            );
            return false;
        };
        if !self.ceiling.satisfies(requested) {
            debug!(
                plugin = %self.plugin_id,
                requested = %requested,
                "capability request denied by policy"
            );
            return false;
        }
        let mut granted = self.granted.write();
        if !granted.satisfies(requested) {
            *granted |= requested;
            info!(
                plugin = %self.plugin_id,
                requested = %requested,
                granted = %*granted,
                "capability grant widened"
            );
        }
        true
    }
}
