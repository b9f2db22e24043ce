use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const TIMEOUT_MIN_MS: u32 = 100;
pub const TIMEOUT_MAX_MS: u32 = 10_000;
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

#[derive(Parser, Debug)]
#[command(name = "pinglog")]
#[command(about = "Continuous ICMP latency monitor with durable probe history", long_about = None)]
pub struct CliArgs {
    /// Target host or address to probe (repeatable)
    #[arg(short, long, value_name = "HOST")]
    target: Vec<String>,

    /// Per-attempt echo timeout in milliseconds (bounded to 100-10000)
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u32,

    /// Probe log database path (defaults to the platform data directory)
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Seconds between stats snapshots printed to stdout
    #[arg(long, default_value_t = 5)]
    report_interval: u64,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("at least one --target is required")]
    NoTargets,
    #[error("could not determine a database directory")]
    NoDataDir,
}

#[derive(Clone, Debug)]
pub struct AppSettings {
    pub targets: Vec<String>,
    pub timeout_ms: u32,
    pub db_path: PathBuf,
    pub report_interval: Duration,
}

pub fn load_from_cli() -> Result<AppSettings, SettingsError> {
    let args = CliArgs::parse();
    from_args(args)
}

pub fn from_args(args: CliArgs) -> Result<AppSettings, SettingsError> {
    if args.target.is_empty() {
        return Err(SettingsError::NoTargets);
    }

    let db_path = match args.db_path {
        Some(path) => path,
        None => default_db_path().ok_or(SettingsError::NoDataDir)?,
    };

    Ok(AppSettings {
        targets: args.target,
        timeout_ms: clamp_timeout_ms(args.timeout_ms),
        db_path,
        report_interval: Duration::from_secs(args.report_interval.max(1)),
    })
}

/// Bound a requested timeout to the sane probing range.
pub fn clamp_timeout_ms(value: u32) -> u32 {
    value.clamp(TIMEOUT_MIN_MS, TIMEOUT_MAX_MS)
}

fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("pinglog").join("pinglog.db"))
}
