//! Connection Coordinator - Lifecycle, Health Monitoring and Rollback
//!
//! The [`Coordinator`] sequences everything a connection needs:
//! - Dependency gate, profile lookup and config compilation
//! - Engine start, then (tunnel mode) device setup, helper start and routing
//! - Rollback of every step already taken when a later one fails
//! - Reconciliation of published status with the supervised processes
//!
//! ## Exclusion
//!
//! All mutating operations go through one async mutex guarding the
//! [`Session`]: the supervisor plus the active connection. A connect also
//! holds an in-flight flag so a second connect reports `Busy` instead of
//! queueing behind the first.
//!
//! Status is published on a `watch` channel, next to a snapshot of the
//! active SOCKS port; readers never take the session lock.
//!
//! ## Health Monitoring
//!
//! [`HealthMonitor::spawn`] runs [`Coordinator::reconcile`] on an interval.
//! A process that exits on its own is noticed on the next tick: status flips
//! to disconnected and whatever is still running or applied is torn down.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let coordinator = Arc::new(Coordinator::new(config, collaborators));
//! let _monitor = HealthMonitor::spawn(coordinator.clone(), Duration::from_secs(5));
//!
//! coordinator.connect("MyServer").await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::error::{ProcessError, Result, StateError};
use crate::store::{ProfileStore, SettingsStore};

use super::config::{self, Compiled};
use super::deps::DependencyGate;
use super::netstack::{NetworkPlan, NetworkState};
use super::probe::{ProbeReport, Prober};
use super::process::{LaunchSpec, Launcher, LogBuffer, Role, Supervisor, SupervisorConfig};
use super::settings::Mode;
use super::types::{ConnectionStatus, Profile};

/// Default health check interval (in milliseconds)
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 5000;

/// Engine document written to the runtime directory
pub const ENGINE_CONFIG_FILE: &str = "config.json";

/// Helper document written to the runtime directory
pub const HELPER_CONFIG_FILE: &str = "tun2socks.yaml";

/// Where the coordinator finds binaries and writes documents
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub runtime_dir: PathBuf,
    pub engine_bin: PathBuf,
    pub helper_bin: PathBuf,
    pub supervisor: SupervisorConfig,
}

/// External collaborators, injectable for tests
pub struct Collaborators {
    pub profiles: Arc<dyn ProfileStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub deps: Arc<dyn DependencyGate>,
    pub launcher: Arc<dyn Launcher>,
    pub network: Arc<dyn NetworkState>,
    pub prober: Arc<dyn Prober>,
}

/// The connection that is currently up
#[derive(Debug, Clone)]
struct ActiveConnection {
    profile: String,
    mode: Mode,
    plan: NetworkPlan,
}

/// State token for every mutating operation
pub struct Session {
    supervisor: Supervisor,
    active: Option<ActiveConnection>,
}

impl Session {
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

/// Clears the in-flight flag when the connect attempt ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Documents on disk for one connect
struct DocumentPaths {
    engine: PathBuf,
    helper: Option<PathBuf>,
}

/// Central coordinator for the connection lifecycle
pub struct Coordinator {
    session: Mutex<Session>,
    connecting: AtomicBool,
    status: watch::Sender<ConnectionStatus>,
    /// SOCKS port of the published connection, `None` while disconnected
    active_port: parking_lot::Mutex<Option<u16>>,
    engine_logs: Arc<LogBuffer>,
    helper_logs: Arc<LogBuffer>,
    config: CoordinatorConfig,
    profiles: Arc<dyn ProfileStore>,
    settings: Arc<dyn SettingsStore>,
    deps: Arc<dyn DependencyGate>,
    network: Arc<dyn NetworkState>,
    prober: Arc<dyn Prober>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, collaborators: Collaborators) -> Self {
        let supervisor = Supervisor::new(collaborators.launcher, config.supervisor.clone());
        let engine_logs = supervisor.process(Role::Engine).log_buffer();
        let helper_logs = supervisor.process(Role::Helper).log_buffer();
        let (status, _) = watch::channel(ConnectionStatus::disconnected());

        Self {
            session: Mutex::new(Session {
                supervisor,
                active: None,
            }),
            connecting: AtomicBool::new(false),
            status,
            active_port: parking_lot::Mutex::new(None),
            engine_logs,
            helper_logs,
            config,
            profiles: collaborators.profiles,
            settings: collaborators.settings,
            deps: collaborators.deps,
            network: collaborators.network,
            prober: collaborators.prober,
        }
    }

    // ==================== Status ====================

    /// Last published status
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn publish(&self, status: ConnectionStatus) {
        if !status.connected {
            *self.active_port.lock() = None;
        }
        self.status.send_replace(status);
    }

    fn publish_connected(&self, status: ConnectionStatus, socks_port: u16) {
        *self.active_port.lock() = Some(socks_port);
        self.status.send_replace(status);
    }

    /// Most recent captured output of one process, oldest first
    pub fn recent_logs(&self, role: Role, lines: usize) -> Vec<String> {
        match role {
            Role::Engine => self.engine_logs.tail(lines),
            Role::Helper => self.helper_logs.tail(lines),
        }
    }

    // ==================== Connect ====================

    /// Connect using the named profile and the current settings.
    ///
    /// An existing connection is torn down first. On failure everything this
    /// call started or applied is rolled back and status reads disconnected.
    pub async fn connect(&self, name: &str) -> Result<ConnectionStatus> {
        let _in_flight = InFlight::acquire(&self.connecting).ok_or(StateError::Busy)?;

        self.deps.require()?;
        let profile = self
            .profiles
            .get(name)?
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        let settings = self.settings.load();
        let compiled = config::compile(&profile, &settings)?;

        let mut session = self.session.lock().await;
        if session.active.is_some() || session.supervisor.running_count() > 0 {
            tracing::info!("replacing active connection");
            self.teardown(&mut session).await;
            self.publish(ConnectionStatus::disconnected());
        }

        let documents = self.write_documents(&compiled).await?;
        let plan = NetworkPlan::new(&settings, &profile);
        let mut network_touched = false;

        match self
            .bring_up(&mut session, &profile, &plan, &documents, settings.socks_port, &mut network_touched)
            .await
        {
            Ok(()) => {
                session.active = Some(ActiveConnection {
                    profile: profile.name.clone(),
                    mode: settings.mode,
                    plan,
                });
                let status = ConnectionStatus::connected(settings.mode, profile.name.clone());
                self.publish_connected(status.clone(), settings.socks_port);
                tracing::info!(profile = %profile.name, mode = %settings.mode, "connected");
                Ok(status)
            }
            Err(e) => {
                tracing::error!(profile = %profile.name, "connect failed, rolling back: {}", e);
                session.supervisor.stop_helper().await;
                if network_touched {
                    if let Err(revert) = self.network.revert(&plan).await {
                        tracing::warn!("rollback could not revert network state: {}", revert);
                    }
                }
                session.supervisor.stop_engine().await;
                self.publish(ConnectionStatus::disconnected());
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        session: &mut Session,
        profile: &Profile,
        plan: &NetworkPlan,
        documents: &DocumentPaths,
        socks_port: u16,
        network_touched: &mut bool,
    ) -> Result<()> {
        let engine = LaunchSpec::engine(&self.config.engine_bin, &documents.engine);
        session
            .supervisor
            .start_engine(&engine, Some(socks_port))
            .await?;
        tracing::debug!(server = %profile.address, "engine up");

        *network_touched = true;
        self.network.prepare(plan).await?;

        if let Some(helper_config) = &documents.helper {
            let helper = LaunchSpec::helper(&self.config.helper_bin, helper_config);
            session.supervisor.start_helper(&helper).await?;
        }

        self.network.apply(plan).await?;
        Ok(())
    }

    async fn write_documents(&self, compiled: &Compiled) -> Result<DocumentPaths> {
        let dir = &self.config.runtime_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ProcessError::WriteConfig {
                path: dir.clone(),
                source,
            })?;

        let engine = dir.join(ENGINE_CONFIG_FILE);
        write_document(&engine, &compiled.engine.to_json()?).await?;

        let helper = match &compiled.helper {
            Some(helper) => {
                let path = dir.join(HELPER_CONFIG_FILE);
                write_document(&path, &helper.to_json()?).await?;
                Some(path)
            }
            None => None,
        };

        Ok(DocumentPaths { engine, helper })
    }

    /// Stop helper, revert network state, stop engine
    async fn teardown(&self, session: &mut Session) {
        session.supervisor.stop_helper().await;
        if let Some(active) = session.active.take() {
            if let Err(e) = self.network.revert(&active.plan).await {
                tracing::warn!(profile = %active.profile, "failed to revert network state: {}", e);
            }
        }
        session.supervisor.stop_engine().await;
    }

    // ==================== Disconnect ====================

    /// Tear down the active connection. Idempotent.
    pub async fn disconnect(&self) -> ConnectionStatus {
        let mut session = self.session.lock().await;
        if session.active.is_none() && session.supervisor.running_count() == 0 {
            return self.status();
        }
        self.teardown(&mut session).await;
        self.publish(ConnectionStatus::disconnected());
        tracing::info!("disconnected");
        self.status()
    }

    // ==================== Test / Public IP ====================

    fn active_socks_port(&self) -> Option<u16> {
        *self.active_port.lock()
    }

    /// Probe through the local SOCKS listener. Status is left untouched.
    pub async fn test_connection(&self) -> Result<ProbeReport> {
        let port = self
            .active_socks_port()
            .ok_or(StateError::NotConnected)?;
        Ok(self.prober.probe(port).await?)
    }

    /// Public address, through the tunnel when connected
    pub async fn public_ip(&self) -> Result<String> {
        let port = self.active_socks_port();
        Ok(self.prober.public_ip(port).await?)
    }

    // ==================== Reconcile ====================

    /// Health-check the supervised processes. A crash flips status to
    /// disconnected and cleans up the rest of the connection.
    pub async fn reconcile(&self) -> ConnectionStatus {
        if !self.status().connected {
            return self.status();
        }

        let mut session = self.session.lock().await;
        let Some(active) = session.active.clone() else {
            return self.status();
        };

        let health = session.supervisor.health_check().await;
        let crashed = health.crashed().or_else(|| {
            // A tunnel without its helper routes nothing
            (active.mode == Mode::Tun && !session.supervisor.process(Role::Helper).is_running())
                .then_some(Role::Helper)
        });

        if let Some(role) = crashed {
            let code = session.supervisor.process(role).last_exit().and_then(|e| e.code);
            tracing::warn!(%role, ?code, profile = %active.profile, "connection lost");
            self.teardown(&mut session).await;
            self.publish(ConnectionStatus::disconnected());
        }
        self.status()
    }

    /// Runtime directory holding the compiled documents
    pub fn runtime_dir(&self) -> &Path {
        &self.config.runtime_dir
    }
}

async fn write_document(path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| ProcessError::WriteConfig {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

// ==================== Health Monitoring ====================

/// Handle for controlling a running health monitor
///
/// Dropping this handle will stop the health monitor.
pub struct HealthMonitorHandle {
    /// Abort handle for the monitoring task
    abort_handle: tokio::task::AbortHandle,
}

impl HealthMonitorHandle {
    /// Stop the health monitor
    pub fn stop(self) {
        self.abort_handle.abort();
    }

    /// Check if the monitor is still running
    pub fn is_running(&self) -> bool {
        !self.abort_handle.is_finished()
    }
}

impl Drop for HealthMonitorHandle {
    fn drop(&mut self) {
        self.abort_handle.abort();
    }
}

/// Periodic reconciliation of the coordinator
pub struct HealthMonitor;

impl HealthMonitor {
    /// Spawn a task that calls [`Coordinator::reconcile`] every `interval`.
    ///
    /// The task runs until the returned handle is stopped or dropped.
    pub fn spawn(coordinator: Arc<Coordinator>, interval: Duration) -> HealthMonitorHandle {
        let task = tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval_timer.tick().await;

                let was_connected = coordinator.status().connected;
                let status = coordinator.reconcile().await;
                if was_connected && !status.connected {
                    tracing::info!("health monitor observed disconnect");
                }
            }
        });

        HealthMonitorHandle {
            abort_handle: task.abort_handle(),
        }
    }
}
