//! JSON-file persistence for profiles and settings
//!
//! Both stores live under the config directory (`~/.config/raydeck` on
//! Linux). Writes go to a temporary sibling file that is then renamed over
//! the target, so a crash mid-write never leaves a truncated store behind.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::StoreError;
use crate::vpn::{Profile, Settings};

pub const PROFILES_FILE: &str = "profiles.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// Application directory under the platform config dir
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("raydeck")
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Serialize `value` and atomically replace `path` with it
fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

// ==================== Profiles ====================

/// Saved profiles, keyed by name
pub trait ProfileStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<Profile>, StoreError>;

    /// Insert, or replace the profile with the same name
    fn save(&self, profile: Profile) -> Result<(), StoreError>;

    /// Returns whether a profile was removed
    fn delete(&self, name: &str) -> Result<bool, StoreError>;

    fn get(&self, name: &str) -> Result<Option<Profile>, StoreError> {
        Ok(self.load_all()?.into_iter().find(|p| p.name == name))
    }
}

/// All profiles in a single `profiles.json` array
#[derive(Debug)]
pub struct JsonProfileStore {
    path: PathBuf,
    lock: parking_lot::Mutex<()>,
}

impl JsonProfileStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(PROFILES_FILE),
            lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<Profile>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(io_error(&self.path))?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl ProfileStore for JsonProfileStore {
    fn load_all(&self) -> Result<Vec<Profile>, StoreError> {
        let _guard = self.lock.lock();
        self.read()
    }

    fn save(&self, profile: Profile) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut profiles = self.read()?;
        match profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
        write_atomic(&self.path, &profiles)
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock();
        let mut profiles = self.read()?;
        let before = profiles.len();
        profiles.retain(|p| p.name != name);
        if profiles.len() == before {
            return Ok(false);
        }
        write_atomic(&self.path, &profiles)?;
        Ok(true)
    }
}

// ==================== Settings ====================

/// The single process-wide settings record
pub trait SettingsStore: Send + Sync {
    /// Stored settings with defaults filled in and numeric fields clamped
    fn load(&self) -> Settings;

    fn save(&self, settings: &Settings) -> Result<(), StoreError>;

    fn reset(&self) -> Result<Settings, StoreError> {
        let settings = Settings::default();
        self.save(&settings)?;
        Ok(settings)
    }
}

#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Settings {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "unreadable settings, using defaults: {}", e);
                return Settings::default();
            }
        };
        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => settings.sanitize(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "corrupt settings, using defaults: {}", e);
                Settings::default()
            }
        }
    }

    fn save(&self, settings: &Settings) -> Result<(), StoreError> {
        write_atomic(&self.path, &settings.clone().sanitize())
    }
}
