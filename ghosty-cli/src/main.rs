//! Ghosty Command Line Interface
//!
//! Front end for the orchestration core: runs a session until interrupted,
//! inspects interfaces and service state, and manages the config file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ghosty_core::{
    EventBus, GhostyConfig, HostMonitor, LocalHost, Mode, Orchestrator, SimulatedHost,
    StartRequest, SystemHost, TeardownReport,
};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "ghosty",
    about = "Ghosty - reversible MAC spoofing, VPN tunnel and Tor circuit rotation",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Dry run against an in-memory host; nothing on this machine changes
    #[arg(long, global = true)]
    simulate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Activate a mode and keep it up until Ctrl-C
    Run {
        /// Layers to activate
        #[arg(short, long, value_enum, default_value = "basic")]
        mode: ModeArg,
        /// Network interface to modify
        #[arg(short, long)]
        interface: String,
        /// Tunnel client configuration file (tunneled and full modes)
        #[arg(long)]
        tunnel_config: Option<PathBuf>,
        /// Tunnel credentials file
        #[arg(long)]
        auth: Option<PathBuf>,
        /// Specific hardware address instead of a random one
        #[arg(long)]
        address: Option<String>,
        /// Do not sample the interface in the background
        #[arg(long)]
        no_monitor: bool,
    },
    /// Show tunnel and anonymity service status
    Status,
    /// List network interfaces and their hardware addresses
    Interfaces,
    /// Show the hardware address of an interface
    Mac {
        /// Interface name
        interface: String,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Validate the configuration
    Validate,
    /// Write an example configuration file
    Init {
        /// Output path (`.toml` or `.json`)
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Hardware address change only
    Basic,
    /// Address change and VPN tunnel
    Tunneled,
    /// Address change, tunnel, Tor and circuit rotation
    Full,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Basic => Mode::Basic,
            ModeArg::Tunneled => Mode::Tunneled,
            ModeArg::Full => Mode::FullAnonymity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Events are printed as they arrive; the core's own log stays quieter
    let filter = if cli.verbose {
        "ghosty=debug,ghosty_core=debug"
    } else {
        "ghosty=info,ghosty_core=warn"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = if let Some(config_path) = &cli.config {
        GhostyConfig::load_from_file(config_path).context("Failed to load configuration file")?
    } else {
        GhostyConfig::load_default().context("Failed to load default configuration")?
    };

    let host: Arc<dyn SystemHost> = if cli.simulate {
        info!("Simulating host: no system changes will be made");
        Arc::new(SimulatedHost::with_defaults())
    } else {
        Arc::new(LocalHost::new(config.identity.sysfs_net_dir.clone()))
    };

    let result = match cli.command {
        Commands::Run {
            mode,
            interface,
            tunnel_config,
            auth,
            address,
            no_monitor,
        } => {
            let mut request = StartRequest::new(mode.into(), interface);
            if let Some(tunnel_config) = tunnel_config {
                request = request.with_tunnel(tunnel_config, auth);
            }
            if let Some(address) = address {
                request = request.with_address(address);
            }
            handle_run(host, &config, request, !no_monitor).await
        }
        Commands::Status => handle_status(host, &config).await,
        Commands::Interfaces => handle_interfaces(host).await,
        Commands::Mac { interface } => handle_mac(host, &interface).await,
        Commands::Config { action } => handle_config_action(&config, action),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn handle_run(
    host: Arc<dyn SystemHost>,
    config: &GhostyConfig,
    request: StartRequest,
    monitor: bool,
) -> Result<()> {
    if request.mode.uses_tunnel() && request.tunnel_config.is_none() {
        bail!("--tunnel-config is required for {} mode", request.mode);
    }

    let events = EventBus::new();
    let printer = spawn_event_printer(&events);
    let orchestrator = Orchestrator::new(host.clone(), config, events.clone());

    let monitor = monitor.then(|| {
        HostMonitor::spawn(
            host,
            request.interface.clone(),
            orchestrator.subscribe(),
            events.clone(),
            config.monitor.sample_interval(),
        )
    });

    // Listen before activating: an interrupt during start must not kill
    // the process with the host half modified.
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let (started, interrupted) = start_guarded(orchestrator.start(request), interrupt.as_mut()).await;
    if let Err(e) = started {
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        drop(orchestrator);
        finish_printer(printer, events).await;
        return Err(e).context("Activation failed");
    }

    if !interrupted {
        println!("Running. Press Ctrl-C to stop and restore.");
        if let Err(e) = interrupt.await {
            // Still tear down rather than leave the host modified
            warn!("Failed to listen for Ctrl-C: {}", e);
        }
    }

    println!();
    let report = orchestrator.stop().await;
    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    drop(orchestrator);
    finish_printer(printer, events).await;
    print_report(&report);

    Ok(())
}

/// Drive `start` to completion even when `interrupt` fires first. Returns
/// the start result and whether the interrupt has already fired.
async fn start_guarded<S, I>(start: S, mut interrupt: Pin<&mut I>) -> (S::Output, bool)
where
    S: Future,
    I: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(start);
    tokio::select! {
        result = &mut start => (result, false),
        signal = interrupt.as_mut() => {
            match signal {
                Ok(()) => println!("Interrupted; finishing activation before restoring"),
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
            (start.await, true)
        }
    }
}

async fn handle_status(host: Arc<dyn SystemHost>, config: &GhostyConfig) -> Result<()> {
    let orchestrator = Orchestrator::new(host, config, EventBus::new());
    let status = orchestrator.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn handle_interfaces(host: Arc<dyn SystemHost>) -> Result<()> {
    let interfaces = host
        .list_interfaces()
        .await
        .context("Failed to list network interfaces")?;

    if interfaces.is_empty() {
        println!("No network interfaces found");
    }
    for interface in interfaces {
        match host.hardware_address(&interface).await {
            Ok(address) => println!("{:<16} {}", interface, address),
            Err(e) => println!("{:<16} unavailable ({})", interface, e),
        }
    }
    Ok(())
}

async fn handle_mac(host: Arc<dyn SystemHost>, interface: &str) -> Result<()> {
    let address = host
        .hardware_address(interface)
        .await
        .with_context(|| format!("Network interface not found: {}", interface))?;
    println!("{}", address);
    Ok(())
}

fn handle_config_action(config: &GhostyConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
        }
        ConfigAction::Validate => match config.validate() {
            Ok(()) => println!("Configuration is valid"),
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                return Err(e.into());
            }
        },
        ConfigAction::Init { output } => {
            let config_path = match output {
                Some(path) => path,
                None => GhostyConfig::default_config_paths()
                    .into_iter()
                    .next()
                    .context("No default configuration location available")?,
            };
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }

            GhostyConfig::create_example_config(&config_path)?;
            println!("Example configuration created: {}", config_path.display());
        }
    }

    Ok(())
}

fn spawn_event_printer(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => println!("{}", event),
                Err(RecvError::Lagged(skipped)) => warn!("{} events were dropped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Drop the last event sender and let the printer drain the backlog
async fn finish_printer(printer: JoinHandle<()>, events: EventBus) {
    drop(events);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;
}

fn print_report(report: &TeardownReport) {
    for outcome in &report.outcomes {
        match &outcome.warning {
            None => println!("  ✓ {}", outcome.step),
            Some(warning) => println!("  ⚠ {}: {}", outcome.step, warning),
        }
    }
    if report.is_clean() {
        println!("Stopped. Original state restored.");
    } else {
        println!("Stopped with warnings.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupt_during_start_waits_for_start() {
        let start = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "started"
        };
        let interrupt = std::future::ready(Ok(()));
        tokio::pin!(interrupt);

        let begun = tokio::time::Instant::now();
        let (result, interrupted) = start_guarded(start, interrupt.as_mut()).await;
        assert_eq!(result, "started");
        assert!(interrupted);
        assert!(begun.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_start_without_interrupt() {
        let interrupt = std::future::pending::<std::io::Result<()>>();
        tokio::pin!(interrupt);

        let (result, interrupted) = start_guarded(async { 7 }, interrupt.as_mut()).await;
        assert_eq!(result, 7);
        assert!(!interrupted);
    }
}
