use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use lib_parking::{Channel, LotId, RealtimeConfig};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "parking_watch.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Console watcher for live parking-lot updates", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PARKING_ORIGIN", help = "Origin of the parking backend, e.g. https://parking.example.com.")]
    pub origin: Option<String>,

    #[clap(long, env = "PARKING_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PARKING_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PARKING_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PARKING_SUBSCRIBE", value_delimiter = ',', help = "Comma-separated lot ids to subscribe to.")]
    pub subscribe: Option<Vec<String>>,

    #[clap(long, env = "PARKING_LOT", help = "Watch a single lot over its own channel.")]
    pub lot: Option<String>,

    #[clap(long, action = ArgAction::SetTrue, help = "Fetch and print the --lot over HTTP before streaming.")]
    #[serde(default)]
    pub fetch_lot: bool,

    #[clap(long, help = "Book the given spot for one hour, print the payment path and exit.")]
    pub book_spot: Option<i64>,

    #[clap(long, env = "PARKING_API_TOKEN", help = "Bearer token for the REST API.")]
    pub api_token: Option<String>,

    #[clap(long, env = "PARKING_HEARTBEAT_SECONDS", help = "Seconds between heartbeats while connected.")]
    pub heartbeat_seconds: Option<u64>,

    #[clap(long, env = "PARKING_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds; attempt N waits N times this.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "PARKING_MAX_RECONNECT_ATTEMPTS", help = "Reconnect attempts before giving up.")]
    pub max_reconnect_attempts: Option<u32>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            origin: other.origin.or(self.origin),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            subscribe: other.subscribe.or(self.subscribe),
            lot: other.lot.or(self.lot),
            fetch_lot: other.fetch_lot || self.fetch_lot,
            book_spot: other.book_spot.or(self.book_spot),
            api_token: other.api_token.or(self.api_token),
            heartbeat_seconds: other.heartbeat_seconds.or(self.heartbeat_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
        }
    }

    fn defaults() -> Config {
        let realtime = RealtimeConfig::default();
        Config {
            origin: Some(realtime.origin),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            heartbeat_seconds: Some(realtime.heartbeat_interval.as_secs()),
            reconnect_base_delay_ms: Some(realtime.reconnect_base_delay.as_millis() as u64),
            max_reconnect_attempts: Some(realtime.max_reconnect_attempts),
            ..Default::default()
        }
    }

    pub fn origin(&self) -> &str {
        self.origin.as_deref().unwrap_or("http://localhost:8000")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// The lot bound by `--lot`, if any.
    pub fn focus_lot(&self) -> Option<LotId> {
        self.lot.as_deref().map(parse_lot_id)
    }

    /// Lots to subscribe to after startup.
    pub fn subscriptions(&self) -> Vec<LotId> {
        self.subscribe
            .iter()
            .flatten()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(parse_lot_id)
            .collect()
    }

    /// Settings for the realtime client.
    pub fn realtime_config(&self) -> Result<RealtimeConfig> {
        let defaults = RealtimeConfig::default();
        let config = RealtimeConfig {
            origin: self.origin().to_string(),
            channel: self.focus_lot().map(Channel::Lot).unwrap_or_default(),
            heartbeat_interval: self
                .heartbeat_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            reconnect_base_delay: self
                .reconnect_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_base_delay),
            max_reconnect_attempts: self.max_reconnect_attempts.unwrap_or(defaults.max_reconnect_attempts),
        };
        if config.reconnect_base_delay.is_zero() {
            bail!("reconnect base delay must be greater than zero");
        }
        // Fail fast on a bad origin rather than inside the client.
        config.endpoint()?;
        Ok(config)
    }
}

fn parse_lot_id(s: &str) -> LotId {
    s.parse().unwrap_or_else(|never: Infallible| match never {})
}

fn read_config_file(path: &Path) -> Option<Config> {
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(file_config) => Some(file_config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Where the JSON config file is looked for: the explicit path, then the
/// working directory, then the user config directory.
fn config_file_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => {
            let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
            if let Some(dir) = dirs::config_dir() {
                candidates.push(dir.join(CONFIG_FILE_NAME));
            }
            candidates
        }
    }
}

/// Defaults, overridden by the config file, overridden by env and CLI.
pub fn resolve(cli: Config) -> Config {
    let mut current_config = Config::defaults();

    let file = config_file_candidates(cli.config_path.as_deref())
        .into_iter()
        .find(|path| path.exists());
    match file {
        Some(path) => {
            if let Some(file_config) = read_config_file(&path) {
                log::info!("Loaded config file {}", path.display());
                current_config = current_config.merge(file_config);
            }
        }
        None => log::info!("No config file found. Using defaults and environment/CLI variables."),
    }

    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}
