use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_ENV: &str = "STATUS_AGENT_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub watcher: WatcherConfig,
    pub pipeline: PipelineConfig,
    pub sink: SinkConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct InputConfig {
    /// Status file written by the monitoring daemon.
    pub path: Option<String>,
    /// Read the current file at startup instead of waiting for a replacement.
    pub load_on_start: bool,
    /// Read the file once and exit.
    pub oneshot: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    /// Regex matched against event paths; defaults to the input's exact path.
    pub filter: Option<String>,
    pub rewatch_delay_ms: u64,
    pub rewatch_max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub parsers: usize,
    pub uploaders: usize,
    pub file_channel_capacity: usize,
    pub block_channel_capacity: usize,
    pub point_channel_capacity: usize,
    pub error_channel_capacity: usize,
    pub eof_channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub url: String,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
    /// Skip sink writes entirely.
    pub noop: bool,
    /// Print every point as JSON on stdout.
    pub dump_json: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen: Option<SocketAddr>,
}

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REWATCH_DELAY_MS: u64 = 1_000;
const DEFAULT_REWATCH_MAX_ATTEMPTS: u32 = 86_400;
const DEFAULT_FILE_CHANNEL_CAPACITY: usize = 1;
const DEFAULT_BLOCK_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_POINT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 10;
const DEFAULT_EOF_CHANNEL_CAPACITY: usize = 16;
const DEFAULT_SINK_URL: &str = "http://localhost:8086";
const DEFAULT_SINK_TIMEOUT_MS: u64 = 10_000;

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            filter: None,
            rewatch_delay_ms: DEFAULT_REWATCH_DELAY_MS,
            rewatch_max_attempts: DEFAULT_REWATCH_MAX_ATTEMPTS,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let workers = default_workers(available_cpus());
        Self {
            parsers: workers,
            uploaders: workers,
            file_channel_capacity: DEFAULT_FILE_CHANNEL_CAPACITY,
            block_channel_capacity: DEFAULT_BLOCK_CHANNEL_CAPACITY,
            point_channel_capacity: DEFAULT_POINT_CHANNEL_CAPACITY,
            error_channel_capacity: DEFAULT_ERROR_CHANNEL_CAPACITY,
            eof_channel_capacity: DEFAULT_EOF_CHANNEL_CAPACITY,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SINK_URL.to_string(),
            database: None,
            username: None,
            password: None,
            timeout_ms: DEFAULT_SINK_TIMEOUT_MS,
            noop: false,
            dump_json: false,
            tags: BTreeMap::new(),
        }
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pool size for `cpus` processors.
pub fn default_workers(cpus: usize) -> usize {
    cpus.max(1) * 2
}

/// Command line flags. Flags override values from the configuration file.
#[derive(Debug, Parser, Default)]
#[command(name = "status-agent", version, about)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Status file to watch
    #[arg(short, long)]
    pub input: Option<String>,

    /// Number of CPUs to size the worker pools for
    #[arg(short, long)]
    pub cpus: Option<usize>,

    /// Don't push any data to the sink, just print the JSON output
    #[arg(short, long)]
    pub noop: bool,

    /// Print every point as JSON
    #[arg(long)]
    pub json: bool,

    /// Read the input once in the foreground and exit
    #[arg(short, long)]
    pub oneshot: bool,

    /// Load the input on start instead of waiting for it to be replaced
    #[arg(short = 'O', long = "onstart")]
    pub load_on_start: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub debug: bool,

    /// InfluxDB URL
    #[arg(short = 'H', long = "host")]
    pub host: Option<String>,

    /// InfluxDB user name
    #[arg(short, long)]
    pub username: Option<String>,

    /// InfluxDB password
    #[arg(short, long)]
    pub password: Option<String>,

    /// InfluxDB database
    #[arg(short = 'D', long)]
    pub database: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Loads the configured file (if any), then applies command line flags.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(input) = &cli.input {
            self.input.path = Some(input.clone());
        }
        if let Some(cpus) = cli.cpus.filter(|cpus| *cpus > 0) {
            self.pipeline.parsers = default_workers(cpus);
            self.pipeline.uploaders = default_workers(cpus);
        }
        if cli.noop {
            self.sink.noop = true;
            self.sink.dump_json = true;
        }
        self.sink.dump_json |= cli.json;
        self.input.oneshot |= cli.oneshot;
        self.input.load_on_start |= cli.load_on_start;
        if let Some(host) = &cli.host {
            self.sink.url = host.clone();
        }
        if let Some(username) = &cli.username {
            self.sink.username = Some(username.clone());
        }
        if let Some(password) = &cli.password {
            self.sink.password = Some(password.clone());
        }
        if let Some(database) = &cli.database {
            self.sink.database = Some(database.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        let has_input = self
            .input
            .path
            .as_ref()
            .map(|path| !path.trim().is_empty())
            .unwrap_or(false);
        if !has_input {
            bail!("an input status file must be configured");
        }

        let has_database = self
            .sink
            .database
            .as_ref()
            .map(|db| !db.trim().is_empty())
            .unwrap_or(false);
        if !self.sink.noop && !has_database {
            bail!("sink configuration requires a database unless noop is set");
        }

        let pipeline = &self.pipeline;
        for (name, value) in [
            ("parsers", pipeline.parsers),
            ("uploaders", pipeline.uploaders),
            ("file_channel_capacity", pipeline.file_channel_capacity),
            ("block_channel_capacity", pipeline.block_channel_capacity),
            ("point_channel_capacity", pipeline.point_channel_capacity),
            ("error_channel_capacity", pipeline.error_channel_capacity),
            ("eof_channel_capacity", pipeline.eof_channel_capacity),
        ] {
            if value == 0 {
                bail!("pipeline.{name} must be at least 1");
            }
        }
        Ok(())
    }

    /// Input path with `~` expanded.
    pub fn input_path(&self) -> Option<PathBuf> {
        self.input.path.as_ref().map(|path| {
            let expanded = shellexpand::tilde(path);
            PathBuf::from(expanded.as_ref())
        })
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rewatch_delay(&self) -> Duration {
        Duration::from_millis(self.rewatch_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.sink.url, "http://localhost:8086");
        assert_eq!(config.pipeline.error_channel_capacity, 10);
        assert!(config.pipeline.parsers >= 2);
        assert_eq!(config.watcher.rewatch_delay(), Duration::from_secs(1));
        assert!(!config.input.oneshot);
    }

    #[test]
    fn parses_sections() {
        let config = Config::from_toml(
            r#"
            [input]
            path = "/var/cache/nagios/status.dat"
            load_on_start = true

            [pipeline]
            parsers = 3
            uploaders = 5

            [sink]
            database = "nagios"
            tags = { site = "lab" }

            [metrics]
            listen = "127.0.0.1:9100"
            "#,
        )
        .unwrap();
        assert!(config.input.load_on_start);
        assert_eq!(config.pipeline.parsers, 3);
        assert_eq!(config.pipeline.uploaders, 5);
        assert_eq!(config.sink.tags["site"], "lab");
        assert_eq!(
            config.metrics.listen,
            Some("127.0.0.1:9100".parse().unwrap())
        );
        config.validate().unwrap();
    }

    #[test]
    fn cli_flags_override_the_file() {
        let mut config = Config::from_toml("[sink]\ndatabase = \"a\"").unwrap();
        let cli = Cli {
            input: Some("~/status.dat".to_string()),
            cpus: Some(3),
            noop: true,
            oneshot: true,
            database: Some("b".to_string()),
            ..Cli::default()
        };
        config.apply_cli(&cli);
        assert_eq!(config.pipeline.parsers, 6);
        assert_eq!(config.pipeline.uploaders, 6);
        assert!(config.sink.noop && config.sink.dump_json);
        assert!(config.input.oneshot);
        assert_eq!(config.sink.database.as_deref(), Some("b"));
        assert_eq!(config.input.path.as_deref(), Some("~/status.dat"));
    }

    #[test]
    fn validation_rejects_incomplete_configs() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.input.path = Some("/tmp/status.dat".to_string());
        assert!(config.validate().is_err(), "database required without noop");

        config.sink.noop = true;
        config.validate().unwrap();

        config.pipeline.uploaders = 0;
        assert!(config.validate().is_err());
    }
}
