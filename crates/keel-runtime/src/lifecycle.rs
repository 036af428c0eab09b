use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::first_run::FirstRunMarker;
use keel_config::KeelConfig;
use keel_core::{Event, EventBus, KeelError, Result};
use keel_plugin::{
    CapabilityPolicy, HostServices, LoadFailure, ModuleLoader, NativeLoader, PluginHost,
    PluginManager, TrustGate,
};

/// What happened during [`Core::initialize`].
#[derive(Debug, Default)]
pub struct StartupReport {
    /// Ids that reached `Initialized`, in load order.
    pub initialized: Vec<String>,
    /// Ids that loaded but refused to initialize; already unloaded.
    pub refused: Vec<String>,
    pub failures: Vec<LoadFailure>,
    pub first_run: bool,
}

struct Running {
    manager: PluginManager,
    events: broadcast::Receiver<Event>,
}

impl Running {
    fn route(&self, event: Event) -> bool {
        match event {
            Event::Plugin {
                source,
                event_type,
                payload,
                ..
            } => {
                let delivered = self.manager.dispatch(Some(&source), &event_type, &payload);
                debug!(
                    source = %source,
                    event_type = %event_type,
                    delivered,
                    "plugin event dispatched"
                );
                true
            }
            _ => false,
        }
    }
}

/// The host process context: one plugin host and one plugin manager, created
/// by [`initialize`](Core::initialize) and torn down by [`shutdown`](Core::shutdown).
pub struct Core {
    config: KeelConfig,
    events: EventBus,
    services: HostServices,
    loader: Option<Arc<dyn ModuleLoader>>,
    running: Option<Running>,
}

impl Core {
    pub fn new(config: KeelConfig) -> Self {
        let events = EventBus::new(config.runtime.event_capacity);
        Self {
            config,
            events,
            services: HostServices::default(),
            loader: None,
            running: None,
        }
    }

    /// Services offered to plugins whose grant allows them.
    pub fn with_services(mut self, services: HostServices) -> Self {
        self.services = services;
        self
    }

    /// Replace the module loader (native shared libraries by default).
    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn config(&self) -> &KeelConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_initialized(&self) -> bool {
        self.running.is_some()
    }

    pub fn manager(&self) -> Option<&PluginManager> {
        self.running.as_ref().map(|r| &r.manager)
    }

    pub fn manager_mut(&mut self) -> Option<&mut PluginManager> {
        self.running.as_mut().map(|r| &mut r.manager)
    }

    /// Create the host and manager, then discover, load and initialize plugins.
    ///
    /// Rejected while already initialized.
    pub fn initialize(&mut self) -> Result<StartupReport> {
        if self.running.is_some() {
            return Err(KeelError::AlreadyInitialized);
        }
        let plugins = &self.config.plugins;
        info!(dir = ?plugins.dir, headless = self.config.runtime.headless, "initializing core");

        let host = Arc::new(
            PluginHost::new(self.events.clone())
                .with_services(self.services.clone())
                .headless(self.config.runtime.headless),
        );
        // Subscribe before any plugin runs so events from `initialize` are kept.
        let events = self.events.subscribe();
        let loader = self
            .loader
            .clone()
            .unwrap_or_else(|| Arc::new(NativeLoader) as Arc<dyn ModuleLoader>);
        let mut manager = PluginManager::new(loader, host)
            .with_trust(TrustGate::from_config(plugins))
            .with_policy(CapabilityPolicy::from_config(plugins));

        let discovery = manager.discover(&plugins.dir, &plugins.extension);
        manager.initialize_all();
        let refused = manager.unload_uninitialized();
        let initialized = manager.plugins().into_iter().map(|p| p.id).collect();

        let marker = FirstRunMarker::new(&self.config.runtime.resolved_config_dir());
        let first_run = marker.is_first_run();
        if first_run {
            if let Err(e) = marker.mark_initialized() {
                warn!(path = ?marker.path(), error = %e, "failed to write first-run marker");
            }
        }

        self.running = Some(Running { manager, events });
        let report = StartupReport {
            initialized,
            refused,
            failures: discovery.failures,
            first_run,
        };
        info!(
            initialized = report.initialized.len(),
            refused = report.refused.len(),
            failed = report.failures.len(),
            first_run,
            "core initialized"
        );
        Ok(report)
    }

    /// Dispatch every plugin event queued since the last call. Returns how
    /// many plugin events were routed.
    pub fn pump_events(&mut self) -> Result<usize> {
        let running = self.running.as_mut().ok_or(KeelError::NotInitialized)?;
        let mut routed = 0;
        loop {
            match running.events.try_recv() {
                Ok(event) => routed += usize::from(running.route(event)),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event pump lagged; oldest events dropped")
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        Ok(routed)
    }

    /// Route plugin events as they arrive until `shutdown` resolves.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let running = self.running.as_mut().ok_or(KeelError::NotInitialized)?;
        tokio::pin!(shutdown);
        loop {
            let received = tokio::select! {
                _ = &mut shutdown => break,
                received = running.events.recv() => received,
            };
            match received {
                Ok(event) => {
                    running.route(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event pump lagged; oldest events dropped")
                }
                Err(RecvError::Closed) => break,
            }
        }
        Ok(())
    }

    /// Shut down and unload every plugin, then drop the manager and host.
    pub fn shutdown(&mut self) -> Result<()> {
        let Running { mut manager, events } = self.running.take().ok_or(KeelError::NotInitialized)?;
        info!(plugins = manager.len(), "shutting down core");
        self.events.publish(Event::Shutdown);
        manager.shutdown_all();
        drop(events);
        drop(manager);
        info!("core shut down");
        Ok(())
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.shutdown();
        }
    }
}
