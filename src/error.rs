//! Error types for profile parsing, config compilation and process supervision.
//!
//! Every component owns a small `thiserror` enum; [`Error`] wraps them so the
//! coordinator and the command surface can return a single result type.

use std::path::PathBuf;

use thiserror::Error;

use crate::vpn::process::Role;

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type returned across the coordinator boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unknown settings key or a value of the wrong shape
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// Malformed share link. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Link does not start with `vless://`
    #[error("invalid scheme: expected a vless:// link")]
    InvalidScheme,

    /// Missing credential, missing host or an unusable port
    #[error("malformed authority: {0}")]
    MalformedAuthority(String),

    /// Credential is not a well-formed UUID
    #[error("invalid credential: {0:?} is not a UUID")]
    InvalidCredential(String),

    #[error("unknown transport type: {0}")]
    UnknownNetwork(String),

    #[error("unknown security type: {0}")]
    UnknownSecurity(String),

    /// A parameter required by the (network, security) pair is absent
    #[error("missing required parameter: {0}")]
    MissingRequiredParameter(&'static str),

    #[error("unsupported combination: {network} over {security}")]
    UnsupportedCombination { network: String, security: String },
}

/// Invalid profile/settings combination. Indicates a data problem.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("SOCKS and HTTP listeners both use port {0}")]
    PortConflict(u16),

    #[error("no stanza builder for {network} over {security}")]
    UnsupportedCombination { network: String, security: String },

    #[error("failed to render document: {0}")]
    Render(#[from] serde_json::Error),
}

/// Start/stop/health failures of a supervised process.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to launch {role} ({program}): {source}")]
    Spawn {
        role: Role,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process died inside the start grace window
    #[error("{role} exited during startup (code {code:?}): {output}")]
    ExitedDuringStartup {
        role: Role,
        code: Option<i32>,
        output: String,
    },

    #[error("{role} did not open its listener on port {port} in time")]
    ListenerNotReady { role: Role, port: u16 },

    /// Helper start requested before the engine reached `Running`
    #[error("engine must be running before the routing helper is started")]
    EngineNotRunning,

    #[error("failed to signal {role}: {source}")]
    Signal {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connection probe failed: {0}")]
    Probe(String),
}

/// Required binaries are not installed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("dependencies missing: {}", .0.join(", "))]
    DependenciesMissing(Vec<String>),
}

/// Caller logic errors, surfaced immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// A connection attempt is already in flight
    #[error("a connection attempt is already in progress")]
    Busy,

    #[error("{0} is already running")]
    AlreadyRunning(Role),

    #[error("profile not found: {0}")]
    NotFound(String),

    #[error("not connected")]
    NotConnected,
}

/// OS routing state could not be applied or reverted.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("`{0}` timed out")]
    Timeout(String),

    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tunnel mode is not supported on this platform")]
    Unsupported,
}

/// Profile/settings persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failure is a caller logic error rather than a data or
    /// process problem.
    pub fn is_state_error(&self) -> bool {
        matches!(self, Error::State(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_message_names_field() {
        let err = ParseError::MissingRequiredParameter("publicKey");
        assert_eq!(err.to_string(), "missing required parameter: publicKey");
    }

    #[test]
    fn test_dependency_error_lists_binaries() {
        let err = DependencyError::DependenciesMissing(vec!["xray".into(), "tun2socks".into()]);
        assert_eq!(err.to_string(), "dependencies missing: xray, tun2socks");
    }

    #[test]
    fn test_error_from_conversions() {
        let err: Error = StateError::Busy.into();
        assert!(err.is_state_error());
        assert_eq!(err.to_string(), "a connection attempt is already in progress");

        let err: Error = CompileError::PortConflict(1080).into();
        assert!(!err.is_state_error());
        assert!(matches!(err, Error::Compile(CompileError::PortConflict(1080))));
    }
}
