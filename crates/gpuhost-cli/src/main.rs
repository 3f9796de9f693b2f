//! gpuhost CLI - reach notebook services on a shared GPU host

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::ConfigManager;
use gpuhost_control::{ForwardingRequest, GpuHost, GpuHostConfig, ShutdownReport};
use gpuhost_remote::{Credentials, Provision};

#[derive(Parser, Debug)]
#[command(name = "gpuhost")]
#[command(about = "Forward services running in GPU host workloads to local ports", long_about = None)]
#[command(version = env!("GPUHOST_VERSION"))]
#[command(long_version = concat!(env!("GPUHOST_VERSION"), "\nCommit: ", env!("GPUHOST_GIT_HASH"), "\nBuilt: ", env!("GPUHOST_BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.gpuhost/config.yml)
    #[arg(long, env = "GPUHOST_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// GPU host address, overrides server.host
    #[arg(long, env = "GPUHOST_HOST", global = true)]
    host: Option<String>,

    /// SSH port of the GPU host, overrides server.port
    #[arg(long, global = true)]
    ssh_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a workload's notebook and forward it to a local port until interrupted
    Connect {
        #[command(flatten)]
        login: LoginArgs,
        /// Workload (container) name
        #[arg(short, long)]
        workload: String,
        /// Framework used to create the workload when it does not exist
        #[arg(long, requires = "framework_version")]
        framework: Option<String>,
        /// Framework version used to create the workload
        #[arg(long, requires = "framework")]
        framework_version: Option<String>,
        /// Forward an already running service instead of starting one
        #[arg(long)]
        no_launch: bool,
    },
    /// List workloads and GPU utilisation on the host
    Workloads {
        #[command(flatten)]
        login: LoginArgs,
    },
    /// Show which local ports in the configured range are held, and by what
    Ports {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Kill whatever holds ports in the configured range
    CleanupPorts,
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write a config file with the defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Account on the GPU host
    #[arg(short, long, env = "GPUHOST_USER")]
    user: String,

    /// Password for the account
    #[arg(long, env = "GPUHOST_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key to log in with instead of a password
    #[arg(short = 'i', long, conflicts_with = "password")]
    identity_file: Option<PathBuf>,
}

impl LoginArgs {
    fn credentials(&self) -> Credentials {
        match (&self.password, &self.identity_file) {
            (Some(password), _) => Credentials::Password(password.clone()),
            (None, Some(path)) => Credentials::IdentityFile(path.clone()),
            (None, None) => Credentials::Agent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Connect {
            ref login,
            ref workload,
            ref framework,
            ref framework_version,
            no_launch,
        } => {
            let mut request = ForwardingRequest::new(workload.as_str());
            if let (Some(framework), Some(version)) = (framework, framework_version) {
                request = request.with_provision(Provision {
                    framework: framework.clone(),
                    version: version.clone(),
                });
            }
            if no_launch {
                request = request.without_launch();
            }
            handle_connect(config, login, request).await
        }
        Commands::Workloads { ref login } => handle_workloads(config, login).await,
        Commands::Ports { json } => handle_ports(config, json).await,
        Commands::CleanupPorts => handle_cleanup_ports(config).await,
        Commands::Config { ref command } => match command {
            ConfigCommands::Show => handle_config_show(&config),
            ConfigCommands::Init { force } => handle_config_init(cli.config.clone(), *force),
        },
    }
}

fn load_config(cli: &Cli) -> Result<GpuHostConfig> {
    let mut config = ConfigManager::load(cli.config.as_deref())?;
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.ssh_port {
        config.server.port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn handle_connect(
    config: GpuHostConfig,
    login: &LoginArgs,
    request: ForwardingRequest,
) -> Result<()> {
    let host = GpuHost::new(config)?;
    let id = host
        .create_session(&login.user, login.credentials())
        .await
        .context("Failed to connect to the GPU host")?;

    let forwarding = match host.establish_forwarding(&id, &request).await {
        Ok(forwarding) => forwarding,
        Err(e) => {
            host.close_session(&id).await;
            return Err(e).context(format!("Failed to forward workload {}", request.workload));
        }
    };

    println!(
        "✅ {} is reachable at {}",
        request.workload,
        service_url(forwarding.local_port, forwarding.token.as_deref())
    );
    println!(
        "   Forwarding localhost:{} -> {}:{} (GPU {})",
        forwarding.local_port,
        forwarding.remote_host,
        forwarding.remote_port,
        forwarding.gpu.unwrap_or(0)
    );
    println!("   Press Ctrl+C to disconnect");

    host.start_expiry_sweeper();
    match wait_for_shutdown_signal().await {
        Ok(()) => info!("Shutdown signal received, cleaning up"),
        Err(e) => error!("Error listening for shutdown signal: {}", e),
    }

    let report = host.shutdown().await;
    print_shutdown_report(&report);
    Ok(())
}

async fn handle_workloads(config: GpuHostConfig, login: &LoginArgs) -> Result<()> {
    let host = GpuHost::new(config)?;
    let id = host
        .create_session(&login.user, login.credentials())
        .await
        .context("Failed to connect to the GPU host")?;

    let listed = host.list_workloads(&id).await;
    let gpus = host.gpu_usage(&id).await;
    host.close_session(&id).await;

    let workloads = listed.context("Failed to list workloads")?;
    if workloads.is_empty() {
        println!("No workloads");
    } else {
        println!("{:<24} {:<16} {:<10} STATUS", "NAME", "FRAMEWORK", "VERSION");
        for w in &workloads {
            println!("{:<24} {:<16} {:<10} {}", w.name, w.framework, w.version, w.status);
        }
    }

    match gpus {
        Ok(gpus) if !gpus.is_empty() => {
            println!();
            println!("{:<4} {:>6} {:>18}", "GPU", "UTIL", "MEMORY (MiB)");
            for gpu in &gpus {
                println!(
                    "{:<4} {:>5}% {:>8}/{:<9}",
                    gpu.index, gpu.utilization, gpu.memory_used, gpu.memory_total
                );
            }
        }
        Ok(_) => println!("\nNo GPUs reported"),
        Err(e) => println!("\nGPU usage unavailable: {}", e),
    }
    Ok(())
}

async fn handle_ports(config: GpuHostConfig, json: bool) -> Result<()> {
    let range = config.ports.local_range;
    let host = GpuHost::new(config)?;
    let usage = host.port_report().await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&usage).context("Failed to serialize port report")?
        );
        return Ok(());
    }

    if usage.is_empty() {
        println!("All ports in {} are free", range);
        return Ok(());
    }
    println!("{} of {} ports in {} are in use:", usage.len(), range.len(), range);
    for port in &usage {
        println!("\n{}:\n{}", port.port, port.holders.trim_end());
    }
    Ok(())
}

async fn handle_cleanup_ports(config: GpuHostConfig) -> Result<()> {
    let range = config.ports.local_range;
    let host = GpuHost::new(config)?;
    let freed = host.cleanup_ports().await;

    if freed.is_empty() {
        println!("Nothing to clean up in {}", range);
    } else {
        let ports: Vec<String> = freed.iter().map(u16::to_string).collect();
        println!("✅ Freed {} port(s): {}", freed.len(), ports.join(", "));
    }
    Ok(())
}

fn handle_config_show(config: &GpuHostConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}

fn handle_config_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => ConfigManager::get_config_path()?,
    };
    if path.exists() && !force {
        anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
    }

    ConfigManager::save(&GpuHostConfig::default(), &path)?;
    println!("✅ Wrote default configuration to {:?}", path);
    Ok(())
}

fn print_shutdown_report(report: &ShutdownReport) {
    println!(
        "Disconnected: {} session(s) cleaned, {} abandoned, {} port(s) swept in {}ms",
        report.cleaned.len(),
        report.abandoned.len(),
        report.swept_ports.len(),
        report.elapsed_millis
    );
    if report.deadline_exceeded {
        println!("⚠️  Shutdown deadline was reached; some cleanup may be incomplete");
    }
}

/// SIGINT or SIGTERM on unix, Ctrl+C elsewhere
/// Local URL of the forwarded service, with its access token when it has one
fn service_url(local_port: u16, token: Option<&str>) -> String {
    match token {
        Some(token) => format!("http://localhost:{}/?token={}", local_port, token),
        None => format!("http://localhost:{}", local_port),
    }
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
