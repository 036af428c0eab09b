use std::sync::Arc;

use keel_config::KeelConfig;
use keel_core::EventBus;
use keel_plugin::{CapabilityPolicy, PluginHost, PluginManager, TrustGate};

/// Load every plugin, report identity and grants, then unload without
/// initializing anything.
pub(super) fn cmd_plugins(config: &KeelConfig, json: bool) -> anyhow::Result<i32> {
    let plugins = &config.plugins;
    let host = Arc::new(
        PluginHost::new(EventBus::new(config.runtime.event_capacity))
            .headless(config.runtime.headless),
    );
    let mut manager = PluginManager::native(host)
        .with_trust(TrustGate::from_config(plugins))
        .with_policy(CapabilityPolicy::from_config(plugins));
    let report = manager.discover(&plugins.dir, &plugins.extension);
    let loaded = manager.plugins();

    if json {
        let value = serde_json::json!({
            "dir": plugins.dir,
            "policy": manager.policy().mode(),
            "plugins": loaded.iter().map(|p| serde_json::json!({
                "id": p.id,
                "name": p.name,
                "version": p.version,
                "path": p.path,
                "verified": p.verified,
                "requested": p.requested.names(),
                "granted": p.granted.names(),
            })).collect::<Vec<_>>(),
            "failures": report.failures.iter().map(|f| serde_json::json!({
                "path": f.path,
                "error": f.error.to_string(),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        if loaded.is_empty() {
            println!("No plugins found in {}.", plugins.dir.display());
        }
        for p in &loaded {
            let mark = if p.verified { "signed" } else { "unsigned" };
            println!("  {} v{} ({}) [{mark}]", p.id, p.version, p.name);
            println!("    requested: {}", p.requested);
            println!("    granted:   {}", p.granted);
        }
        for f in &report.failures {
            println!("  ! {}: {}", f.path.display(), f.error);
        }
    }

    Ok(if report.is_clean() { 0 } else { 1 })
}
