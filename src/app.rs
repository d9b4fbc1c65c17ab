//! Command surface
//!
//! [`App`] wires the JSON stores, the dependency gate and the coordinator
//! together and exposes every user-facing command as one method. The CLI in
//! `main.rs` is a thin layer over it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result, StateError};
use crate::store::{self, JsonProfileStore, JsonSettingsStore, ProfileStore, SettingsStore};
use crate::vpn::{
    self, BinaryDependencies, Collaborators, CommandLauncher, Compiled, ConnectionStatus,
    Coordinator, CoordinatorConfig, DependencyGate, DepsStatus, HttpProber, ProbeReport, Profile,
    Role, Settings, SupervisorConfig, SystemNetwork,
};

/// Runtime documents directory under the config dir
pub const RUNTIME_DIR: &str = "run";

/// Binary directory under the config dir
pub const BIN_DIR: &str = "bin";

/// Filesystem layout used by [`App::open`]
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub bin_dir: PathBuf,
}

impl AppPaths {
    /// Runtime and binary directories nested under `config_dir`
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        Self {
            runtime_dir: config_dir.join(RUNTIME_DIR),
            bin_dir: config_dir.join(BIN_DIR),
            config_dir,
        }
    }

    /// Builder method to look for binaries elsewhere
    pub fn bin_dir(mut self, bin_dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = bin_dir.into();
        self
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new(store::default_config_dir())
    }
}

pub struct App {
    profiles: Arc<dyn ProfileStore>,
    settings: Arc<dyn SettingsStore>,
    deps: Arc<dyn DependencyGate>,
    coordinator: Arc<Coordinator>,
}

impl App {
    /// Production wiring: JSON stores, real binaries, `ip` and HTTP probes
    pub fn open(paths: AppPaths) -> Self {
        let deps = BinaryDependencies::new(&paths.bin_dir);
        let config = CoordinatorConfig {
            runtime_dir: paths.runtime_dir.clone(),
            engine_bin: deps.engine_path().to_path_buf(),
            helper_bin: deps.helper_path().to_path_buf(),
            supervisor: SupervisorConfig::default(),
        };
        tracing::debug!(config_dir = %paths.config_dir.display(), "opening app");

        Self::with_collaborators(
            config,
            Collaborators {
                profiles: Arc::new(JsonProfileStore::new(&paths.config_dir)),
                settings: Arc::new(JsonSettingsStore::new(&paths.config_dir)),
                deps: Arc::new(deps),
                launcher: Arc::new(CommandLauncher),
                network: Arc::new(SystemNetwork::default()),
                prober: Arc::new(HttpProber::new()),
            },
        )
    }

    pub fn with_collaborators(config: CoordinatorConfig, collaborators: Collaborators) -> Self {
        let profiles = collaborators.profiles.clone();
        let settings = collaborators.settings.clone();
        let deps = collaborators.deps.clone();
        Self {
            profiles,
            settings,
            deps,
            coordinator: Arc::new(Coordinator::new(config, collaborators)),
        }
    }

    /// Shared coordinator, for health monitoring and status subscriptions
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn runtime_dir(&self) -> &Path {
        self.coordinator.runtime_dir()
    }

    // ==================== Profiles ====================

    /// Parse a share link and save it, optionally under a different name.
    ///
    /// A profile with the same name is replaced.
    pub fn import_profile(&self, link: &str, name: Option<&str>) -> Result<Profile> {
        let mut profile = vpn::parse_vless_link(link)?;
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            profile.name = name.to_string();
        }
        self.profiles.save(profile.clone())?;
        tracing::info!(profile = %profile.name, network = %profile.network(), "imported profile");
        Ok(profile)
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>> {
        Ok(self.profiles.load_all()?)
    }

    pub fn profile(&self, name: &str) -> Result<Profile> {
        self.profiles
            .get(name)?
            .ok_or_else(|| StateError::NotFound(name.to_string()).into())
    }

    pub fn delete_profile(&self, name: &str) -> Result<()> {
        if !self.profiles.delete(name)? {
            return Err(StateError::NotFound(name.to_string()).into());
        }
        tracing::info!(profile = %name, "deleted profile");
        Ok(())
    }

    /// Share link for a stored profile
    pub fn export_link(&self, name: &str) -> Result<String> {
        Ok(self.profile(name)?.to_link())
    }

    /// Documents `connect` would write for `name` with the current settings
    pub fn render_config(&self, name: &str) -> Result<Compiled> {
        let profile = self.profile(name)?;
        Ok(vpn::compile(&profile, &self.settings.load())?)
    }

    // ==================== Connection ====================

    pub async fn connect(&self, name: &str) -> Result<ConnectionStatus> {
        self.coordinator.connect(name).await
    }

    pub async fn disconnect(&self) -> ConnectionStatus {
        self.coordinator.disconnect().await
    }

    pub async fn test_connection(&self) -> Result<ProbeReport> {
        self.coordinator.test_connection().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.coordinator.status()
    }

    pub async fn public_ip(&self) -> Result<String> {
        self.coordinator.public_ip().await
    }

    pub fn recent_logs(&self, role: Role, lines: usize) -> Vec<String> {
        self.coordinator.recent_logs(role, lines)
    }

    pub fn deps_status(&self) -> DepsStatus {
        self.deps.status()
    }

    // ==================== Settings ====================

    pub fn settings(&self) -> Settings {
        self.settings.load()
    }

    /// Set one field from its JSON value. Takes effect on the next connect.
    pub fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<Settings> {
        let updated = self
            .settings
            .load()
            .with_field(key, value)
            .map_err(|e| Error::InvalidSetting(e.to_string()))?;
        self.settings.save(&updated)?;
        tracing::info!(key, "setting updated");
        Ok(updated)
    }

    pub fn reset_settings(&self) -> Result<Settings> {
        Ok(self.settings.reset()?)
    }
}
