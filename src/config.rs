//! Configuration module for rpc-stress.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::rpc::Procedure;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the stress client
#[derive(Parser, Debug)]
#[command(name = "rpc-stress")]
#[command(author = "rpc-stress authors")]
#[command(version = "0.1.0")]
#[command(about = "Drives concurrent ONC RPC sum calls and reports latency", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server to call (e.g., 127.0.0.1:5050)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Run duration in seconds (unlimited if not set)
    #[arg(short, long)]
    pub runtime: Option<u64>,

    /// Number of concurrent connections
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Seconds to wait for each reply (defaults to 0.2s per job, at least 10s)
    #[arg(long)]
    pub job_timeout: Option<f64>,

    /// Upper bound on calls per connection
    #[arg(long)]
    pub max_calls: Option<u32>,

    /// Abort after this many errors
    #[arg(long)]
    pub max_errors: Option<u64>,

    /// Upper bound on integers per call
    #[arg(long)]
    pub max_ints: Option<usize>,

    /// Stop after this many connections have been opened
    #[arg(long)]
    pub connections: Option<u64>,

    /// Seed for payloads and send sizes
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print one activity character per connection per iteration
    #[arg(short, long)]
    pub trace: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target server configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address of the sum service
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

/// Load shape configuration
#[derive(Debug, Deserialize)]
pub struct RunConfig {
    /// Run duration in seconds
    pub runtime: Option<u64>,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Per-reply timeout in seconds
    pub job_timeout: Option<f64>,
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,
    #[serde(default = "default_max_errors")]
    pub max_errors: u64,
    #[serde(default = "default_max_ints")]
    pub max_ints: usize,
    pub connections: Option<u64>,
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            jobs: default_jobs(),
            job_timeout: None,
            max_calls: default_max_calls(),
            max_errors: default_max_errors(),
            max_ints: default_max_ints(),
            connections: None,
            seed: None,
        }
    }
}

/// Remote procedure to call
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_program")]
    pub program: u32,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_procedure")]
    pub procedure: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            version: default_version(),
            procedure: default_procedure(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Print the per-connection activity line
    #[serde(default)]
    pub trace: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            trace: false,
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:5050".to_string()
}

fn default_jobs() -> usize {
    128
}

fn default_max_calls() -> u32 {
    32
}

fn default_max_errors() -> u64 {
    256
}

fn default_max_ints() -> usize {
    65536
}

fn default_program() -> u32 {
    0x3123_0000
}

fn default_version() -> u32 {
    2
}

fn default_procedure() -> u32 {
    9 // SUMPROC
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Shortest job timeout picked when none is configured.
const MIN_JOB_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-job share of the computed job timeout.
const JOB_TIMEOUT_PER_JOB: Duration = Duration::from_millis(200);

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub runtime: Option<Duration>,
    pub jobs: usize,
    pub job_timeout: Option<Duration>,
    pub max_calls: u32,
    pub max_errors: u64,
    pub max_ints: usize,
    pub connections: Option<u64>,
    pub seed: Option<u64>,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub trace: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point to.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let runtime = cli.runtime.or(file.run.runtime);
        let job_timeout = cli.job_timeout.or(file.run.job_timeout);

        let config = Config {
            server: cli.server.unwrap_or(file.server.address),
            runtime: runtime.map(Duration::from_secs),
            jobs: cli.jobs.unwrap_or(file.run.jobs),
            job_timeout: job_timeout.map(seconds).transpose()?,
            max_calls: cli.max_calls.unwrap_or(file.run.max_calls),
            max_errors: cli.max_errors.unwrap_or(file.run.max_errors),
            max_ints: cli.max_ints.unwrap_or(file.run.max_ints),
            connections: cli.connections.or(file.run.connections),
            seed: cli.seed.or(file.run.seed),
            program: file.protocol.program,
            version: file.protocol.version,
            procedure: file.protocol.procedure,
            trace: cli.trace || file.logging.trace,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("jobs", self.jobs as u64),
            ("max_calls", u64::from(self.max_calls)),
            ("max_errors", self.max_errors),
            ("max_ints", self.max_ints as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.runtime.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Invalid("runtime must be positive".into()));
        }
        if self.server.is_empty() {
            return Err(ConfigError::Invalid("server address is empty".into()));
        }
        Ok(())
    }

    /// Time allowed for each request cycle.
    ///
    /// An explicit setting wins; otherwise 0.2s per job, at least 10s.
    pub fn job_timeout(&self) -> Duration {
        self.job_timeout.unwrap_or_else(|| {
            let jobs = self.jobs.min(u32::MAX as usize) as u32;
            JOB_TIMEOUT_PER_JOB
                .saturating_mul(jobs)
                .max(MIN_JOB_TIMEOUT)
        })
    }

    /// Remote procedure every job calls.
    pub fn target(&self) -> Procedure {
        Procedure {
            program: self.program,
            version: self.version,
            procedure: self.procedure,
        }
    }
}

fn seconds(value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::Invalid(format!(
            "job_timeout must be a positive number of seconds, got {value}"
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| ConfigError::Invalid(format!("job_timeout out of range: {e}")))
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let cli = CliArgs::try_parse_from(std::iter::once("rpc-stress").chain(args.iter().copied()))
            .unwrap();
        Config::from_args(cli)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.address, "127.0.0.1:5050");
        assert_eq!(config.run.jobs, 128);
        assert_eq!(config.run.max_calls, 32);
        assert_eq!(config.run.max_errors, 256);
        assert_eq!(config.run.max_ints, 65536);
        assert_eq!(config.protocol.program, 0x3123_0000);
        assert_eq!(config.protocol.procedure, 9);
        assert!(config.run.runtime.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            address = "10.0.0.1:6000"

            [run]
            runtime = 60
            jobs = 16
            job_timeout = 2.5
            max_calls = 4
            seed = 99

            [protocol]
            procedure = 3

            [logging]
            level = "debug"
            trace = true
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.address, "10.0.0.1:6000");
        assert_eq!(config.run.runtime, Some(60));
        assert_eq!(config.run.jobs, 16);
        assert_eq!(config.run.job_timeout, Some(2.5));
        assert_eq!(config.run.max_calls, 4);
        assert_eq!(config.run.max_errors, 256);
        assert_eq!(config.run.seed, Some(99));
        assert_eq!(config.protocol.procedure, 3);
        assert_eq!(config.protocol.version, 2);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.trace);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            address = "10.0.0.1:6000"
            [run]
            jobs = 16
            max_calls = 4
            "#,
        )
        .unwrap();
        let cli = CliArgs::try_parse_from(["rpc-stress", "-j", "3", "--server", "localhost:7000"])
            .unwrap();

        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.jobs, 3);
        assert_eq!(config.server, "localhost:7000");
        assert_eq!(config.max_calls, 4);
    }

    #[test]
    fn test_cli_flags() {
        let config = parse(&[
            "-r", "30", "--job-timeout", "0.5", "--connections", "10", "--seed", "1", "-t",
            "--log-level", "debug",
        ])
        .unwrap();
        assert_eq!(config.runtime, Some(Duration::from_secs(30)));
        assert_eq!(config.job_timeout(), Duration::from_millis(500));
        assert_eq!(config.connections, Some(10));
        assert_eq!(config.seed, Some(1));
        assert!(config.trace);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_job_timeout_default_has_floor() {
        let config = parse(&["-j", "4"]).unwrap();
        assert_eq!(config.job_timeout(), Duration::from_secs(10));

        let config = parse(&["-j", "200"]).unwrap();
        assert_eq!(config.job_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn test_explicit_job_timeout_skips_floor() {
        let config = parse(&["--job-timeout", "1"]).unwrap();
        assert_eq!(config.job_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(matches!(parse(&["-j", "0"]), Err(ConfigError::Invalid(_))));
        assert!(matches!(parse(&["--max-calls", "0"]), Err(ConfigError::Invalid(_))));
        assert!(matches!(parse(&["-r", "0"]), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            parse(&["--job-timeout", "0"]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let err = parse(&["-c", "/nonexistent/rpc-stress.toml"]).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err.to_string().contains("/nonexistent/rpc-stress.toml"));
    }

    #[test]
    fn test_target_procedure() {
        let config = parse(&[]).unwrap();
        let target = config.target();
        assert_eq!(target.program, 0x3123_0000);
        assert_eq!(target.version, 2);
        assert_eq!(target.procedure, 9);
    }
}
