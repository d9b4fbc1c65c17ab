//! VPN module for profile handling, config compilation and connection
//! supervision
//!
//! This module contains the profile model and link parser, the engine/helper
//! config compiler, the process supervisor and the connection coordinator.

pub mod config;
pub mod deps;
pub mod link;
pub mod manager;
pub mod netstack;
pub mod probe;
pub mod process;
pub mod settings;
pub mod types;

// Re-export commonly used types for convenience
pub use settings::{DomainStrategy, LogLevel, Mode, Settings};
pub use types::{
    BinaryStatus, ConnectionStatus, DepsStatus, Network, Profile, Security, SecurityKind, Transport,
};

pub use config::{compile, Compiled};
pub use deps::{BinaryDependencies, DependencyGate};
pub use link::parse_vless_link;
pub use manager::{Collaborators, Coordinator, CoordinatorConfig, HealthMonitor, HealthMonitorHandle};
pub use netstack::{NetworkPlan, NetworkState, SystemNetwork};
pub use probe::{HttpProber, ProbeReport, Prober};
pub use process::{CommandLauncher, Launcher, Role, SupervisorConfig};
