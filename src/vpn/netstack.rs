//! Operating-system network state for the two routing modes
//!
//! - Tunnel mode: creates the tun device, pins a host route to the proxy
//!   server through the original gateway, then points the default route at
//!   the device. Linux only, via `ip`.
//! - Proxy mode: writes a shell profile snippet exporting the proxy
//!   environment variables.
//!
//! Every external command runs with a bounded timeout. Revert is best effort:
//! each step runs even when an earlier one fails, and reverting state that was
//! never applied is not an error.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::NetworkError;

use super::config::LISTEN_ADDR;
use super::settings::{Mode, Settings};
use super::types::Profile;

/// Name of the tun device handed to the routing helper
pub const TUN_INTERFACE: &str = "tun0";

/// Address assigned to the tun device (benchmarking range, never routed)
pub const TUN_ADDRESS: &str = "198.18.0.1/15";

/// Metric of the default route through the tun device
const TUN_ROUTE_METRIC: &str = "1";

/// Shell profile snippet written in proxy mode
pub const PROXY_ENV_PATH: &str = "/etc/profile.d/raydeck_proxy.sh";

/// Bound on any single route command
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

/// What to apply for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPlan {
    Tun {
        interface: String,
        address: String,
        mtu: u16,
        /// Proxy server host, excluded from the tunnel by a host route
        server: String,
        server_port: u16,
    },
    Proxy {
        socks_port: u16,
        http_port: u16,
    },
}

impl NetworkPlan {
    pub fn new(settings: &Settings, profile: &Profile) -> Self {
        match settings.mode {
            Mode::Tun => NetworkPlan::Tun {
                interface: TUN_INTERFACE.to_string(),
                address: TUN_ADDRESS.to_string(),
                mtu: settings.tun_mtu,
                server: profile.address.clone(),
                server_port: profile.port,
            },
            Mode::Proxy => NetworkPlan::Proxy {
                socks_port: settings.socks_port,
                http_port: settings.http_port,
            },
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            NetworkPlan::Tun { .. } => Mode::Tun,
            NetworkPlan::Proxy { .. } => Mode::Proxy,
        }
    }
}

/// Applies and reverts OS routing state
#[async_trait]
pub trait NetworkState: Send + Sync {
    /// Tun: create and configure the device. Proxy: write the environment file.
    async fn prepare(&self, plan: &NetworkPlan) -> Result<(), NetworkError>;

    /// Tun: install the server host route and the default route. Runs after
    /// the helper has attached to the device. Proxy: nothing.
    async fn apply(&self, plan: &NetworkPlan) -> Result<(), NetworkError>;

    /// Undo `prepare` and `apply`, best effort
    async fn revert(&self, plan: &NetworkPlan) -> Result<(), NetworkError>;
}

/// Content of the proxy environment snippet
pub fn proxy_env_content(socks_port: u16, http_port: u16) -> String {
    let http = format!("http://{LISTEN_ADDR}:{http_port}");
    let socks = format!("socks5://{LISTEN_ADDR}:{socks_port}");
    format!(
        "#!/bin/sh\n\
         export http_proxy=\"{http}\"\n\
         export https_proxy=\"{http}\"\n\
         export HTTP_PROXY=\"{http}\"\n\
         export HTTPS_PROXY=\"{http}\"\n\
         export all_proxy=\"{socks}\"\n\
         export ALL_PROXY=\"{socks}\"\n"
    )
}

/// Extract the gateway from `ip route show default` output
pub fn parse_default_gateway(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "via" {
                return words
                    .next()
                    .filter(|gw| gw.parse::<IpAddr>().is_ok())
                    .map(str::to_string);
            }
        }
        None
    })
}

/// Resolve the proxy server to IPv4 addresses for host routes
async fn resolve_server(server: &str, port: u16) -> Vec<IpAddr> {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return vec![ip];
    }
    match tokio::net::lookup_host((server, port)).await {
        Ok(addrs) => {
            let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).filter(IpAddr::is_ipv4).collect();
            ips.dedup();
            ips
        }
        Err(e) => {
            tracing::warn!(server, "failed to resolve server for host route: {}", e);
            Vec::new()
        }
    }
}

/// [`NetworkState`] that shells out to `ip` and writes the profile snippet
pub struct SystemNetwork {
    env_path: PathBuf,
    command_timeout: Duration,
    /// Host routes installed by the last `apply`
    host_routes: Mutex<Vec<String>>,
}

impl Default for SystemNetwork {
    fn default() -> Self {
        Self::new(PROXY_ENV_PATH)
    }
}

impl SystemNetwork {
    pub fn new(env_path: impl Into<PathBuf>) -> Self {
        Self {
            env_path: env_path.into(),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            host_routes: Mutex::new(Vec::new()),
        }
    }

    /// Builder method to set the per-command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn env_path(&self) -> &Path {
        &self.env_path
    }

    /// Run `ip <args>` with a bounded wait, returning stdout
    async fn ip(&self, args: &[&str]) -> Result<String, NetworkError> {
        let command = format!("ip {}", args.join(" "));
        tracing::debug!("{}", command);

        let output = tokio::process::Command::new("ip")
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.command_timeout, output)
            .await
            .map_err(|_| NetworkError::Timeout(command.clone()))??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(NetworkError::Command {
                command,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Run a revert step, logging instead of failing
    async fn ip_quiet(&self, args: &[&str], first_error: &mut Option<NetworkError>) {
        if let Err(e) = self.ip(args).await {
            tracing::debug!("revert step failed: {}", e);
            if first_error.is_none() && !matches!(e, NetworkError::Command { .. }) {
                *first_error = Some(e);
            }
        }
    }

    async fn write_env_file(&self, socks_port: u16, http_port: u16) -> Result<(), NetworkError> {
        tokio::fs::write(&self.env_path, proxy_env_content(socks_port, http_port)).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.env_path, std::fs::Permissions::from_mode(0o644)).await?;
        }
        tracing::info!(path = %self.env_path.display(), "proxy environment written");
        Ok(())
    }

    async fn remove_env_file(&self) -> Result<(), NetworkError> {
        match tokio::fs::remove_file(&self.env_path).await {
            Ok(()) => {
                tracing::info!(path = %self.env_path.display(), "proxy environment removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl NetworkState for SystemNetwork {
    async fn prepare(&self, plan: &NetworkPlan) -> Result<(), NetworkError> {
        match plan {
            NetworkPlan::Proxy {
                socks_port,
                http_port,
            } => self.write_env_file(*socks_port, *http_port).await,
            NetworkPlan::Tun {
                interface,
                address,
                mtu,
                ..
            } => {
                if !cfg!(target_os = "linux") {
                    return Err(NetworkError::Unsupported);
                }
                let (interface, address) = (interface.as_str(), address.as_str());
                let mtu = mtu.to_string();
                self.ip(&["tuntap", "add", "mode", "tun", "dev", interface]).await?;
                self.ip(&["addr", "add", address, "dev", interface]).await?;
                self.ip(&["link", "set", "dev", interface, "up"]).await?;
                if let Err(e) = self.ip(&["link", "set", "dev", interface, "mtu", mtu.as_str()]).await {
                    tracing::warn!("keeping default MTU: {}", e);
                }
                tracing::info!(interface, "tun device up");
                Ok(())
            }
        }
    }

    async fn apply(&self, plan: &NetworkPlan) -> Result<(), NetworkError> {
        let NetworkPlan::Tun {
            interface,
            server,
            server_port,
            ..
        } = plan
        else {
            return Ok(());
        };
        let interface = interface.as_str();

        let default_route = self.ip(&["route", "show", "default"]).await?;
        match parse_default_gateway(&default_route) {
            Some(gateway) => {
                for ip in resolve_server(server, *server_port).await {
                    let target = format!("{ip}/32");
                    match self.ip(&["route", "add", target.as_str(), "via", gateway.as_str()]).await {
                        Ok(_) => self.host_routes.lock().push(target),
                        Err(e) => tracing::warn!("server host route not installed: {}", e),
                    }
                }
            }
            None => tracing::warn!("no default gateway found, server traffic may loop"),
        }

        self.ip(&["route", "add", "default", "dev", interface, "metric", TUN_ROUTE_METRIC])
            .await?;
        tracing::info!(interface, "default route through tunnel");
        Ok(())
    }

    async fn revert(&self, plan: &NetworkPlan) -> Result<(), NetworkError> {
        match plan {
            NetworkPlan::Proxy { .. } => self.remove_env_file().await,
            NetworkPlan::Tun { interface, .. } => {
                if !cfg!(target_os = "linux") {
                    return Ok(());
                }
                let interface = interface.as_str();
                let mut first_error = None;
                self.ip_quiet(&["route", "del", "default", "dev", interface], &mut first_error)
                    .await;
                let host_routes = std::mem::take(&mut *self.host_routes.lock());
                for target in &host_routes {
                    self.ip_quiet(&["route", "del", target.as_str()], &mut first_error).await;
                }
                self.ip_quiet(&["link", "set", "dev", interface, "down"], &mut first_error)
                    .await;
                self.ip_quiet(&["tuntap", "del", "mode", "tun", "dev", interface], &mut first_error)
                    .await;
                tracing::info!(interface, "tunnel routing reverted");
                first_error.map_or(Ok(()), Err)
            }
        }
    }
}
