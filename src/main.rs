//! raydeck command-line client

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use raydeck::app::{App, AppPaths};
use raydeck::logging;
use raydeck::vpn::manager::DEFAULT_HEALTH_CHECK_INTERVAL_MS;
use raydeck::vpn::{HealthMonitor, Role};

#[derive(Parser)]
#[command(name = "raydeck")]
#[command(about = "VLESS profile manager and xray/tun2socks supervisor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (profiles, settings, runtime documents)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Directory holding the xray and tun2socks binaries
    #[arg(long, global = true)]
    bin_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = logging::DEFAULT_LEVEL)]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a vless:// share link
    Import {
        link: String,
        /// Save under this name instead of the link fragment
        #[arg(long)]
        name: Option<String>,
    },
    /// List saved profiles
    List,
    /// Delete a saved profile
    Delete { name: String },
    /// Print the share link of a saved profile
    Export { name: String },
    /// Print the documents a connect would write
    ShowConfig {
        name: String,
        /// Print the tun2socks document instead of the xray one
        #[arg(long)]
        helper: bool,
    },
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
    /// Report whether the required binaries are installed
    Deps,
    /// Look up the public address without connecting
    Ip,
    /// Connect with a profile and stay in the foreground until interrupted
    Run {
        name: String,
        /// Probe the connection once it is up
        #[arg(long)]
        test: bool,
        /// Health check interval in milliseconds
        #[arg(long, default_value_t = DEFAULT_HEALTH_CHECK_INTERVAL_MS)]
        interval: u64,
        /// Captured output lines printed when the connection drops
        #[arg(long, default_value_t = 20)]
        log_lines: usize,
        /// Which process output to print when the connection drops
        #[arg(long, value_enum)]
        logs: Option<LogSource>,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print all settings as JSON
    Get,
    /// Set one field; the value is read as JSON, else as a plain string
    Set { key: String, value: String },
    /// Restore the defaults
    Reset,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogSource {
    Engine,
    Helper,
    All,
}

impl LogSource {
    fn roles(self) -> &'static [Role] {
        match self {
            LogSource::Engine => &[Role::Engine],
            LogSource::Helper => &[Role::Helper],
            LogSource::All => &[Role::Engine, Role::Helper],
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `"proxy"` and `proxy` both mean the string; `true` and `1080` keep their JSON type
fn setting_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn print_logs(app: &App, source: LogSource, lines: usize) {
    for role in source.roles() {
        let captured = app.recent_logs(*role, lines);
        if captured.is_empty() {
            continue;
        }
        println!("---- {role} ----");
        for line in captured {
            println!("{line}");
        }
    }
}

async fn run(
    app: &App,
    name: &str,
    test: bool,
    interval: Duration,
    logs: Option<LogSource>,
    log_lines: usize,
) -> Result<()> {
    let status = app
        .connect(name)
        .await
        .with_context(|| format!("failed to connect with {name}"))?;
    print_json(&status)?;

    let _monitor = HealthMonitor::spawn(app.coordinator().clone(), interval);

    if test {
        match app.test_connection().await {
            Ok(report) => info!(
                status = report.status,
                latency_ms = report.latency_ms,
                "connection test passed"
            ),
            Err(e) => warn!("connection test failed: {}", e),
        }
    }

    let mut updates = app.coordinator().subscribe();
    let still_up = updates.borrow_and_update().connected;
    let dropped = !still_up || loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, disconnecting");
                break false;
            }
            changed = updates.changed() => {
                let connected = changed.is_ok() && updates.borrow_and_update().connected;
                if !connected {
                    break true;
                }
            }
        }
    };

    let status = app.disconnect().await;
    if dropped {
        error!("connection lost");
        print_logs(app, logs.unwrap_or(LogSource::All), log_lines);
    } else if let Some(source) = logs {
        print_logs(app, source, log_lines);
    }
    print_json(&status)?;

    if dropped {
        anyhow::bail!("connection with {name} dropped");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log);

    let mut paths = cli.config_dir.map(AppPaths::new).unwrap_or_default();
    if let Some(bin_dir) = cli.bin_dir {
        paths = paths.bin_dir(bin_dir);
    }
    let app = App::open(paths);

    match cli.command {
        Command::Import { link, name } => {
            let profile = app.import_profile(&link, name.as_deref())?;
            println!("imported {}", profile.name);
        }
        Command::List => {
            for profile in app.list_profiles()? {
                println!(
                    "{}\t{}:{}\t{}/{}",
                    profile.name,
                    profile.address,
                    profile.port,
                    profile.network(),
                    profile.security_kind()
                );
            }
        }
        Command::Delete { name } => {
            app.delete_profile(&name)?;
            println!("deleted {name}");
        }
        Command::Export { name } => println!("{}", app.export_link(&name)?),
        Command::ShowConfig { name, helper } => {
            let compiled = app.render_config(&name)?;
            let document = if helper {
                compiled
                    .helper
                    .context("no helper document in proxy mode")?
                    .to_json()?
            } else {
                compiled.engine.to_json()?
            };
            println!("{}", String::from_utf8_lossy(&document));
        }
        Command::Settings { action } => match action.unwrap_or(SettingsAction::Get) {
            SettingsAction::Get => print_json(&app.settings())?,
            SettingsAction::Set { key, value } => {
                print_json(&app.set_setting(&key, setting_value(&value))?)?
            }
            SettingsAction::Reset => print_json(&app.reset_settings()?)?,
        },
        Command::Deps => {
            let status = app.deps_status();
            print_json(&status)?;
            if !status.all_installed {
                anyhow::bail!("missing: {}", status.missing().join(", "));
            }
        }
        Command::Ip => println!("{}", app.public_ip().await?),
        Command::Run {
            name,
            test,
            interval,
            log_lines,
            logs,
        } => run(&app, &name, test, Duration::from_millis(interval), logs, log_lines).await?,
    }

    Ok(())
}
