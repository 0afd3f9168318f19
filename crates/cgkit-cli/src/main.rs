use anyhow::{Context, Result};
use byte_unit::{Byte, UnitType};
use cgkit_core::config::{LogConfig, ManagerKind, VersionSetting};
use cgkit_core::{CgroupControl, Config, Metrics, Resources, VERSION};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use colored::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// cgkit - cgroup resource control
///
/// Creates, configures, inspects and removes cgroups on v1 and v2
/// hierarchies, directly or through systemd.
#[derive(Parser, Debug)]
#[command(name = "cgkit")]
#[command(version = VERSION)]
#[command(about = "Unified cgroup v1/v2 resource control", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "/etc/cgkit/config.toml")]
    config: PathBuf,

    /// cgroupfs mount point (overrides config)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Hierarchy version (overrides config)
    #[arg(long, global = true, value_enum)]
    cgroup_version: Option<VersionArg>,

    /// Create and remove cgroups as systemd transient units
    #[arg(long, global = true)]
    systemd: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a cgroup and apply resource limits
    Create {
        /// Cgroup path relative to the root, e.g. machine.slice/web
        path: String,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Apply resource limits to an existing cgroup
    Apply {
        path: String,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Show resource usage statistics
    Stat {
        path: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a cgroup
    Destroy { path: String },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path for config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum VersionArg {
    Auto,
    V1,
    V2,
}

impl From<VersionArg> for VersionSetting {
    fn from(arg: VersionArg) -> Self {
        match arg {
            VersionArg::Auto => VersionSetting::Auto,
            VersionArg::V1 => VersionSetting::V1,
            VersionArg::V2 => VersionSetting::V2,
        }
    }
}

/// Resource limits given on the command line. They override the values
/// from `--resources`.
#[derive(Args, Debug, Default)]
struct LimitArgs {
    /// TOML file with a full resource specification
    #[arg(short, long)]
    resources: Option<PathBuf>,

    /// CPU weight (v2, 1-10000)
    #[arg(long)]
    cpu_weight: Option<u64>,

    /// CPU shares (v1)
    #[arg(long)]
    cpu_shares: Option<u64>,

    /// CFS quota in microseconds per period, -1 for unlimited
    #[arg(long, allow_hyphen_values = true)]
    cpu_quota: Option<i64>,

    /// CFS period in microseconds
    #[arg(long)]
    cpu_period: Option<u64>,

    /// Allowed CPUs, e.g. 0-3,6
    #[arg(long)]
    cpus: Option<String>,

    /// Allowed memory nodes
    #[arg(long)]
    mems: Option<String>,

    /// Memory limit, e.g. 512MiB or max
    #[arg(long, allow_hyphen_values = true, value_parser = parse_bytes)]
    memory: Option<i64>,

    /// Memory plus swap limit, e.g. 1GiB or max
    #[arg(long, allow_hyphen_values = true, value_parser = parse_bytes)]
    memory_swap: Option<i64>,

    /// Soft memory limit
    #[arg(long, value_parser = parse_bytes)]
    memory_reservation: Option<i64>,

    /// Swappiness (v1, 0-100)
    #[arg(long)]
    swappiness: Option<i64>,

    /// Maximum number of tasks, -1 for unlimited
    #[arg(long, allow_hyphen_values = true)]
    pids_limit: Option<i64>,

    /// Block I/O weight (10-1000)
    #[arg(long)]
    blkio_weight: Option<u16>,
}

impl LimitArgs {
    fn to_resources(&self) -> Result<Resources> {
        let mut resources = match &self.resources {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read resources file {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Invalid resources file {}", path.display()))?
            }
            None => Resources::default(),
        };

        if let Some(weight) = self.cpu_weight {
            resources.cpu.weight = weight;
        }
        if let Some(shares) = self.cpu_shares {
            resources.cpu.shares = shares;
        }
        if let Some(quota) = self.cpu_quota {
            resources.cpu.quota = quota;
        }
        if let Some(period) = self.cpu_period {
            resources.cpu.period = period;
        }
        if let Some(cpus) = &self.cpus {
            resources.cpuset.cpus = cpus.clone();
        }
        if let Some(mems) = &self.mems {
            resources.cpuset.mems = mems.clone();
        }
        if let Some(limit) = self.memory {
            resources.memory.limit = limit;
        }
        if let Some(swap) = self.memory_swap {
            resources.memory.swap = swap;
        }
        if let Some(reservation) = self.memory_reservation {
            resources.memory.reservation = reservation;
        }
        if self.swappiness.is_some() {
            resources.memory.swappiness = self.swappiness;
        }
        if self.pids_limit.is_some() {
            resources.pids.limit = self.pids_limit;
        }
        if let Some(weight) = self.blkio_weight {
            resources.blkio.weight = weight;
        }

        Ok(resources)
    }
}

/// `512MiB` → bytes; `max` and `-1` mean unlimited.
fn parse_bytes(value: &str) -> Result<i64, String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("max") || value == "-1" {
        return Ok(-1);
    }

    let bytes = Byte::parse_str(value, true).map_err(|e| format!("invalid size {:?}: {}", value, e))?;
    i64::try_from(bytes.as_u64()).map_err(|_| format!("size {:?} is too large", value))
}

fn format_bytes(bytes: u64) -> String {
    if bytes == u64::MAX {
        return "unlimited".to_string();
    }
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{:.1}", adjusted)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::GenerateConfig { output } => return generate_config(output),
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "cgkit", &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(&cli)?;
    // Flushes the file writer on drop.
    let _guard = init_logging(&config.logging, cli.verbose)?;
    debug!(?config, "Configuration loaded");

    match &cli.command {
        Commands::Create { path, limits } => {
            let resources = limits.to_resources()?;
            let control = open(&config, path)?;
            control
                .create(&resources)
                .with_context(|| format!("Failed to create cgroup {}", path))?;
            println!("{} {}", "✅ Created".green().bold(), control.paths());
        }
        Commands::Apply { path, limits } => {
            let resources = limits.to_resources()?;
            let control = open(&config, path)?;
            control
                .apply(&resources)
                .with_context(|| format!("Failed to apply limits to {}", path))?;
            println!("{} {}", "✅ Applied limits to".green().bold(), control.paths());
        }
        Commands::Stat { path, json } => {
            let control = open(&config, path)?;
            let metrics = control
                .stat()
                .with_context(|| format!("Failed to read statistics of {}", path))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                print_metrics(&control, &metrics);
            }
        }
        Commands::Destroy { path } => {
            let control = open(&config, path)?;
            control
                .destroy()
                .with_context(|| format!("Failed to destroy cgroup {}", path))?;
            println!("{} {}", "🗑  Destroyed".yellow().bold(), control.paths());
        }
        Commands::GenerateConfig { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn open(config: &Config, path: &str) -> Result<CgroupControl> {
    let control = CgroupControl::from_config(config, path)
        .with_context(|| format!("Failed to open cgroup {}", path))?;
    info!(cgroup = %control.paths(), version = %control.version(), delegated = control.is_delegated(), "Opened cgroup");
    Ok(control)
}

/// Load configuration from file or use defaults, then apply flag overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        Config::load_from_file(&cli.config)
            .with_context(|| format!("Failed to load configuration file {}", cli.config.display()))?
    } else {
        Config::default()
    };

    if let Some(root) = &cli.root {
        config.cgroup.root = root.clone();
    }
    if let Some(version) = cli.cgroup_version {
        config.cgroup.version = version.into();
    }
    if cli.systemd {
        config.cgroup.manager = ManagerKind::Systemd;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;
    Ok(config)
}

/// Generate default configuration file
fn generate_config(output: &Path) -> Result<()> {
    Config::default()
        .save_to_file(output)
        .map_err(|e| anyhow::anyhow!("Failed to save configuration file: {}", e))?;
    println!("{} {}", "✅ Configuration written to".green(), output.display());
    Ok(())
}

fn print_metrics(control: &CgroupControl, metrics: &Metrics) {
    println!(
        "{} {} ({})",
        "=== cgroup".green().bold(),
        control.paths().to_string().bold(),
        control.version()
    );

    println!("\n{}", "CPU:".cyan());
    println!("  Total:   {:.3}s", metrics.cpu.total_usage as f64 / 1e9);
    println!("  Kernel:  {:.3}s", metrics.cpu.usage_in_kernelmode as f64 / 1e9);
    if !metrics.cpu.percpu_usage.is_empty() {
        println!("  Per CPU: {} cpus", metrics.cpu.percpu_usage.len());
    }

    println!("\n{}", "Memory:".cyan());
    println!("  Usage:   {}", format_bytes(metrics.memory.usage));
    let limit = format_bytes(metrics.memory.limit);
    if metrics.memory.is_limited() {
        println!("  Limit:   {}", limit);
    } else {
        println!("  Limit:   {}", limit.yellow());
    }

    println!("\n{}", "Block I/O:".cyan());
    println!("  Read:    {}", format_bytes(metrics.blkio.total("read")));
    println!("  Write:   {}", format_bytes(metrics.blkio.total("write")));

    println!("\n{}", "PIDs:".cyan());
    println!("  Current: {}", metrics.pids.current);
    println!();
}

/// Initialize logging to stderr, plus a daily-rotated file when configured
fn init_logging(logging: &LogConfig, verbose: u8) -> Result<Option<WorkerGuard>> {
    let level = match verbose {
        0 => logging.level.to_lowercase(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let (file_layer, guard) = match &logging.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, &logging.file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false),
        )
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .init();

    Ok(guard)
}
