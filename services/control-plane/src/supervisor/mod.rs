//! Service supervisor.
//!
//! Registered units live in the `service_units` table. Operators (the CLI)
//! change the desired state there; the supervisor running in the daemon
//! reconciles the actual tasks against it on every health check and writes
//! the observed state back.
//!
//! Crashed units are restarted with backoff. After too many crash-restarts
//! inside the rolling window a unit is marked `degraded` and left alone
//! until an operator starts or restarts it.

mod launcher;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use skyway_reconcile::{BackoffPolicy, RestartWindow};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub use launcher::ServiceLauncher;

use crate::error::{Error, Result};
use crate::store::{DesiredState, ObservedState, ServiceUnit, StateStore, UnitKind};

/// A unit's main future. Resolving means the unit exited.
pub type UnitFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Builds the task for a unit kind.
pub trait Launcher: Send + Sync {
    fn launch(&self, name: &str, kind: &UnitKind, shutdown: watch::Receiver<bool>) -> anyhow::Result<UnitFuture>;
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub health_interval: Duration,

    /// Delay before a crash-restart, by number of recent restarts.
    pub backoff: BackoffPolicy,

    pub max_restarts: u32,

    pub restart_window: Duration,

    /// How long a stopping unit may take to exit before it is aborted.
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_restarts: skyway_reconcile::DEFAULT_MAX_RESTARTS,
            restart_window: skyway_reconcile::DEFAULT_RESTART_WINDOW,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Status line of one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub kind: String,
    pub desired: DesiredState,
    pub observed: ObservedState,
    /// Seconds since the current run started, while running.
    pub uptime_secs: Option<i64>,
    pub restart_count: u32,
    pub last_restart_at: Option<i64>,
}

impl UnitStatus {
    fn from_unit(unit: ServiceUnit, now: i64) -> Self {
        let uptime_secs = match unit.observed {
            ObservedState::Running => unit.started_at.map(|s| (now - s).max(0)),
            _ => None,
        };
        Self {
            name: unit.name,
            kind: unit.kind.to_string(),
            desired: unit.desired,
            observed: unit.observed,
            uptime_secs,
            restart_count: unit.restart_count,
            last_restart_at: unit.last_restart_at,
        }
    }
}

// =============================================================================
// Unit registry (store-only operations)
// =============================================================================

/// Desired-state operations that only touch the store.
///
/// The CLI uses these directly; a running daemon applies them on its next
/// health check.
#[derive(Clone)]
pub struct UnitRegistry {
    store: Arc<StateStore>,
}

impl UnitRegistry {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Register a unit with desired state `running`.
    pub fn register(&self, name: &str, kind: &UnitKind) -> Result<()> {
        if name.trim().is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::Validation(format!("invalid service name '{name}'")));
        }
        if let UnitKind::Controller { account } = kind {
            self.store.require_account(account)?;
        }
        self.store.insert_unit(name, kind, Utc::now().timestamp())?;
        info!(service = %name, %kind, "Service registered");
        Ok(())
    }

    pub fn status(&self) -> Result<Vec<UnitStatus>> {
        let now = Utc::now().timestamp();
        Ok(self
            .store
            .list_units()?
            .into_iter()
            .map(|u| UnitStatus::from_unit(u, now))
            .collect())
    }

    pub fn status_of(&self, name: &str) -> Result<UnitStatus> {
        Ok(UnitStatus::from_unit(self.get(name)?, Utc::now().timestamp()))
    }

    /// Desire `running`. A degraded unit is restarted.
    pub fn start(&self, name: &str) -> Result<()> {
        let unit = self.get(name)?;
        if unit.observed == ObservedState::Degraded {
            self.store.request_unit_restart(name, Utc::now().timestamp())?;
        } else {
            self.store
                .set_unit_desired(name, DesiredState::Running, Utc::now().timestamp())?;
        }
        Ok(())
    }

    /// Desire `stopped`. Stopping a stopped unit is a no-op.
    pub fn stop(&self, name: &str) -> Result<()> {
        self.store
            .set_unit_desired(name, DesiredState::Stopped, Utc::now().timestamp())?;
        Ok(())
    }

    /// Ask for a fresh run (desired becomes `running`).
    pub fn restart(&self, name: &str) -> Result<()> {
        Ok(self.store.request_unit_restart(name, Utc::now().timestamp())?)
    }

    fn get(&self, name: &str) -> Result<ServiceUnit> {
        self.store
            .get_unit(name)?
            .ok_or_else(|| Error::NotFound(format!("service {name}")))
    }
}

// =============================================================================
// Supervisor
// =============================================================================

#[derive(Default)]
struct UnitRuntime {
    task: Option<JoinHandle<anyhow::Result<()>>>,
    shutdown: Option<watch::Sender<bool>>,
    window: Option<RestartWindow>,
}

impl UnitRuntime {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Runs and health-checks registered units.
pub struct Supervisor {
    store: Arc<StateStore>,
    registry: UnitRegistry,
    launcher: Arc<dyn Launcher>,
    config: SupervisorConfig,
    units: Mutex<HashMap<String, Arc<AsyncMutex<UnitRuntime>>>>,
}

impl Supervisor {
    pub fn new(store: Arc<StateStore>, launcher: Arc<dyn Launcher>, config: SupervisorConfig) -> Self {
        Self {
            registry: UnitRegistry::new(store.clone()),
            store,
            launcher,
            config,
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, kind: &UnitKind) -> Result<()> {
        self.registry.register(name, kind)
    }

    pub fn status(&self) -> Result<Vec<UnitStatus>> {
        self.registry.status()
    }

    pub fn status_of(&self, name: &str) -> Result<UnitStatus> {
        self.registry.status_of(name)
    }

    /// Start a unit now. Clears a degraded state.
    pub async fn start(&self, name: &str) -> Result<()> {
        let unit = self.registry.get(name)?;
        let runtime = self.runtime(name);
        let mut rt = runtime.lock().await;

        let now = Utc::now().timestamp();
        self.store.set_unit_desired(name, DesiredState::Running, now)?;
        if rt.is_running() {
            return Ok(());
        }

        rt.window = None;
        self.spawn(&mut rt, &unit, Duration::ZERO)?;
        self.store
            .record_unit_observed(name, ObservedState::Running, Some(now), now)?;
        Ok(())
    }

    /// Stop a unit now. Stopping a stopped unit succeeds.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.registry.get(name)?;
        let runtime = self.runtime(name);
        let mut rt = runtime.lock().await;

        let now = Utc::now().timestamp();
        self.store.set_unit_desired(name, DesiredState::Stopped, now)?;
        self.halt(name, &mut rt).await;
        self.store
            .record_unit_observed(name, ObservedState::Stopped, None, now)?;
        Ok(())
    }

    /// Stop (if running) and start a unit now.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let unit = self.registry.get(name)?;
        let runtime = self.runtime(name);
        let mut rt = runtime.lock().await;

        let now = Utc::now().timestamp();
        self.store.set_unit_desired(name, DesiredState::Running, now)?;
        self.halt(name, &mut rt).await;
        rt.window = None;
        self.spawn(&mut rt, &unit, Duration::ZERO)?;
        self.store.clear_unit_restart_request(name)?;
        self.store
            .record_unit_observed(name, ObservedState::Running, Some(now), now)?;
        Ok(())
    }

    /// Kill a unit's task without telling the store, as a crash would.
    pub async fn abort_unit(&self, name: &str) -> Result<()> {
        self.registry.get(name)?;
        let runtime = self.runtime(name);
        let rt = runtime.lock().await;
        if let Some(task) = &rt.task {
            task.abort();
        }
        Ok(())
    }

    /// Reconcile every registered unit once.
    #[instrument(skip(self))]
    pub async fn check_health(&self) -> Result<()> {
        for unit in self.store.list_units()? {
            if let Err(e) = self.check_unit(&unit).await {
                error!(service = %unit.name, error = %e, "Health check failed");
            }
        }
        Ok(())
    }

    async fn check_unit(&self, unit: &ServiceUnit) -> Result<()> {
        let runtime = self.runtime(&unit.name);
        let mut rt = runtime.lock().await;

        // Re-read under the unit lock; the caller's copy may be stale.
        let Some(unit) = self.store.get_unit(&unit.name)? else {
            return Ok(());
        };
        let now = Utc::now().timestamp();
        let instant = Instant::now();

        if unit.desired == DesiredState::Stopped {
            if rt.is_running() {
                self.halt(&unit.name, &mut rt).await;
            }
            if unit.observed != ObservedState::Stopped {
                self.store
                    .record_unit_observed(&unit.name, ObservedState::Stopped, None, now)?;
            }
            return Ok(());
        }

        if unit.restart_requested {
            info!(service = %unit.name, "Operator restart");
            self.halt(&unit.name, &mut rt).await;
            rt.window = None;
            self.spawn(&mut rt, &unit, Duration::ZERO)?;
            self.store.clear_unit_restart_request(&unit.name)?;
            self.store
                .record_unit_observed(&unit.name, ObservedState::Running, Some(now), now)?;
            return Ok(());
        }

        if rt.is_running() {
            if unit.observed != ObservedState::Running {
                self.store
                    .record_unit_observed(&unit.name, ObservedState::Running, unit.started_at.or(Some(now)), now)?;
            }
            return Ok(());
        }

        if unit.observed == ObservedState::Degraded {
            return Ok(());
        }

        let Some(task) = rt.task.take() else {
            // Never started by this supervisor.
            self.spawn(&mut rt, &unit, Duration::ZERO)?;
            self.store
                .record_unit_observed(&unit.name, ObservedState::Running, Some(now), now)?;
            debug!(service = %unit.name, "Service started");
            return Ok(());
        };

        // The task finished on its own.
        match task.await {
            Ok(Ok(())) => warn!(service = %unit.name, "Service exited"),
            Ok(Err(e)) => error!(service = %unit.name, error = %e, "Service failed"),
            Err(e) => error!(service = %unit.name, error = %e, "Service crashed"),
        }
        rt.shutdown = None;

        let config = &self.config;
        let window = rt
            .window
            .get_or_insert_with(|| RestartWindow::new(config.max_restarts, config.restart_window));
        if window.is_exhausted(instant.into_std()) {
            warn!(
                service = %unit.name,
                restart_count = unit.restart_count,
                "Service exceeded max restarts, marking as degraded"
            );
            self.store
                .record_unit_observed(&unit.name, ObservedState::Degraded, None, now)?;
            return Ok(());
        }

        let delay = config.backoff.delay(window.recent(instant.into_std()));
        window.record(instant.into_std());
        info!(service = %unit.name, delay_ms = delay.as_millis() as u64, "Restarting crashed service");

        self.spawn(&mut rt, &unit, delay)?;
        self.store.record_unit_restart(&unit.name, now)?;
        self.store
            .record_unit_observed(&unit.name, ObservedState::Running, Some(now), now)?;
        Ok(())
    }

    /// Health-check on a fixed interval until shutdown, then stop all units.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.health_interval.as_secs(), "Starting supervisor");
        let mut interval = tokio::time::interval(self.config.health_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_health().await {
                        error!(error = %e, "Supervisor health check failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Supervisor shutting down");
                        break;
                    }
                }
            }
        }

        let names: Vec<String> = self.lock_units().keys().cloned().collect();
        for name in names {
            let runtime = self.runtime(&name);
            let mut rt = runtime.lock().await;
            self.halt(&name, &mut rt).await;
        }
    }

    fn lock_units(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<UnitRuntime>>>> {
        self.units
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn runtime(&self, name: &str) -> Arc<AsyncMutex<UnitRuntime>> {
        self.lock_units()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn spawn(&self, rt: &mut UnitRuntime, unit: &ServiceUnit, delay: Duration) -> Result<()> {
        let (tx, rx) = watch::channel(false);
        let future = self
            .launcher
            .launch(&unit.name, &unit.kind, rx)
            .map_err(|e| Error::Internal(format!("cannot launch {}: {e}", unit.name)))?;

        rt.task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            future.await
        }));
        rt.shutdown = Some(tx);
        Ok(())
    }

    async fn halt(&self, name: &str, rt: &mut UnitRuntime) {
        if let Some(tx) = rt.shutdown.take() {
            let _ = tx.send(true);
        }
        let Some(mut task) = rt.task.take() else {
            return;
        };
        if tokio::time::timeout(self.config.stop_timeout, &mut task).await.is_err() {
            warn!(service = %name, "Service did not stop in time, aborting");
            task.abort();
        }
    }
}
