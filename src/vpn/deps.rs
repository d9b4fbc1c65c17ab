//! Presence and version of the external binaries
//!
//! Installation is out of scope; the gate only answers whether the engine
//! and helper binaries exist and are executable.

use std::path::{Path, PathBuf};

use crate::error::DependencyError;

use super::types::{BinaryStatus, DepsStatus};

pub const ENGINE_BINARY: &str = "xray";
pub const HELPER_BINARY: &str = "tun2socks";

/// Pinned xray-core release
pub const ENGINE_VERSION: &str = "1.8.24";

/// Pinned tun2socks release
pub const HELPER_VERSION: &str = "2.5.2";

/// Reports whether required binaries are present
pub trait DependencyGate: Send + Sync {
    fn status(&self) -> DepsStatus;

    /// `DependenciesMissing` naming every absent binary
    fn require(&self) -> Result<DepsStatus, DependencyError> {
        let status = self.status();
        if status.all_installed {
            Ok(status)
        } else {
            Err(DependencyError::DependenciesMissing(status.missing()))
        }
    }
}

/// Checks the engine and helper paths on disk
#[derive(Debug, Clone)]
pub struct BinaryDependencies {
    engine: PathBuf,
    helper: PathBuf,
}

impl BinaryDependencies {
    /// Expect both binaries under `bin_dir`
    pub fn new(bin_dir: &Path) -> Self {
        Self {
            engine: bin_dir.join(ENGINE_BINARY),
            helper: bin_dir.join(HELPER_BINARY),
        }
    }

    pub fn with_paths(engine: impl Into<PathBuf>, helper: impl Into<PathBuf>) -> Self {
        Self {
            engine: engine.into(),
            helper: helper.into(),
        }
    }

    pub fn engine_path(&self) -> &Path {
        &self.engine
    }

    pub fn helper_path(&self) -> &Path {
        &self.helper
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn binary_status(name: &str, path: &Path, version: &str) -> BinaryStatus {
    let installed = is_executable(path);
    if !installed {
        tracing::debug!(path = %path.display(), "{} not installed", name);
    }
    BinaryStatus {
        name: name.to_string(),
        installed,
        version: version.to_string(),
    }
}

impl DependencyGate for BinaryDependencies {
    fn status(&self) -> DepsStatus {
        DepsStatus::new(
            binary_status(ENGINE_BINARY, &self.engine, ENGINE_VERSION),
            binary_status(HELPER_BINARY, &self.helper, HELPER_VERSION),
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Gate with a fixed answer
    pub struct FixedDependencies {
        pub engine: bool,
        pub helper: bool,
    }

    impl FixedDependencies {
        pub fn installed() -> Self {
            Self {
                engine: true,
                helper: true,
            }
        }
    }

    impl DependencyGate for FixedDependencies {
        fn status(&self) -> DepsStatus {
            let status = |name: &str, installed: bool| BinaryStatus {
                name: name.to_string(),
                installed,
                version: String::new(),
            };
            DepsStatus::new(
                status(ENGINE_BINARY, self.engine),
                status(HELPER_BINARY, self.helper),
            )
        }
    }
}
