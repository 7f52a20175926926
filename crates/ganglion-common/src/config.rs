//! Configuration management for Ganglion
//!
//! Values are read from an optional configuration file and from environment
//! variables prefixed with `GANGLION` (nested keys separated by `__`, e.g.
//! `GANGLION__RABBITMQ__PREFETCH_COUNT=20`). Every accessor falls back to a
//! default when the key is absent.

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};

use crate::error::{GanglionError, Result};

pub const CONFIG_FILE: &str = "conf/ganglion";
pub const ENV_PREFIX: &str = "GANGLION";

pub const LOCK_BACKEND: &str = "ganglion.lock.backend";
pub const LOCK_PATH_PREFIX: &str = "ganglion.lock.path_prefix";
pub const LEADER_PATH_PREFIX: &str = "ganglion.leader.path_prefix";
pub const CLUSTERED: &str = "ganglion.clustered";
pub const SHUTDOWN_GRACE_MS: &str = "ganglion.shutdown.grace_ms";

pub const GRAPH_PROPERTY_QUEUE: &str = "ganglion.queue.graph_property";
pub const LONG_RUNNING_PROCESS_QUEUE: &str = "ganglion.queue.long_running_process";

pub const BROKER_ADDRESSES: &str = "rabbitmq.addresses";
pub const BROADCAST_EXCHANGE_NAME: &str = "rabbitmq.broadcast_exchange_name";
pub const PREFETCH_COUNT: &str = "rabbitmq.prefetch_count";
pub const DELIVERY_MODE: &str = "rabbitmq.delivery_mode";

pub const LOG_PATH: &str = "ganglion.logs.path";
pub const LOG_CONSOLE: &str = "ganglion.logs.console";
pub const LOG_FILE: &str = "ganglion.logs.file";
pub const LOG_LEVEL: &str = "ganglion.logs.level";

pub const DEFAULT_LOCK_PATH_PREFIX: &str = "/ganglion/locks";
pub const DEFAULT_LEADER_PATH_PREFIX: &str = "/ganglion/leaders";
pub const DEFAULT_GRAPH_PROPERTY_QUEUE: &str = "graphProperty";
pub const DEFAULT_LONG_RUNNING_PROCESS_QUEUE: &str = "longRunningProcess";
pub const DEFAULT_BROADCAST_EXCHANGE_NAME: &str = "exBroadcast";
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
pub const DEFAULT_BROKER_PORT: u16 = 5672;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;

/// Which lock backend a process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockBackendKind {
    #[default]
    Distributed,
    SingleProcess,
    Local,
    NoOp,
}

impl LockBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockBackendKind::Distributed => "distributed",
            LockBackendKind::SingleProcess => "single-process",
            LockBackendKind::Local => "local",
            LockBackendKind::NoOp => "noop",
        }
    }
}

impl Display for LockBackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LockBackendKind {
    type Err = GanglionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "distributed" | "zookeeper" | "curator" => Ok(LockBackendKind::Distributed),
            "single-process" | "single_process" | "singleprocess" => {
                Ok(LockBackendKind::SingleProcess)
            }
            "local" => Ok(LockBackendKind::Local),
            "noop" | "no-op" | "none" => Ok(LockBackendKind::NoOp),
            other => Err(GanglionError::Config(format!(
                "unknown lock backend '{}'",
                other
            ))),
        }
    }
}

/// One broker endpoint in `host[:port]` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl Default for BrokerAddress {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_BROKER_PORT)
    }
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`; the port defaults to
    /// 5672. A bare IPv6 literal without brackets is taken as a host.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let invalid_port =
            || GanglionError::Config(format!("invalid port in broker address '{}'", value));

        let (host, port) = if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                GanglionError::Config(format!("unclosed '[' in broker address '{}'", value))
            })?;
            let port = match tail {
                "" => DEFAULT_BROKER_PORT,
                _ => tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(invalid_port)?,
            };
            (host, port)
        } else {
            match value.split_once(':') {
                Some((host, port)) if !port.contains(':') => {
                    (host, port.parse::<u16>().map_err(|_| invalid_port())?)
                }
                _ => (value, DEFAULT_BROKER_PORT),
            }
        };

        if host.is_empty() {
            return Err(GanglionError::Config(format!(
                "missing host in broker address '{}'",
                value
            )));
        }

        Ok(Self::new(host, port))
    }

    /// Parse a comma separated list of addresses, skipping blank entries.
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        value
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl Display for BrokerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl From<Config> for Configuration {
    fn from(config: Config) -> Self {
        Configuration { config }
    }
}

impl Configuration {
    /// Load `conf/ganglion.{yml,toml,json}` (optional) and the environment.
    pub fn new() -> Result<Self> {
        Self::load(Path::new(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(Configuration { config })
    }

    /// Build from explicit key/value overrides only.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut builder = Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(key, value)?;
        }

        Ok(Configuration {
            config: builder.build()?,
        })
    }

    // ========================================================================
    // Coordination
    // ========================================================================

    pub fn lock_backend(&self) -> Result<LockBackendKind> {
        match self.config.get_string(LOCK_BACKEND) {
            Ok(v) => v.parse(),
            Err(_) => Ok(LockBackendKind::default()),
        }
    }

    pub fn lock_path_prefix(&self) -> String {
        self.config
            .get_string(LOCK_PATH_PREFIX)
            .unwrap_or(DEFAULT_LOCK_PATH_PREFIX.to_string())
    }

    pub fn leader_path_prefix(&self) -> String {
        self.config
            .get_string(LEADER_PATH_PREFIX)
            .unwrap_or(DEFAULT_LEADER_PATH_PREFIX.to_string())
    }

    pub fn is_clustered(&self) -> bool {
        self.config.get_bool(CLUSTERED).unwrap_or(false)
    }

    pub fn shutdown_grace(&self) -> Duration {
        let ms = self
            .config
            .get_int(SHUTDOWN_GRACE_MS)
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS as i64);
        Duration::from_millis(ms.max(0) as u64)
    }

    // ========================================================================
    // Work queues
    // ========================================================================

    pub fn graph_property_queue(&self) -> String {
        self.config
            .get_string(GRAPH_PROPERTY_QUEUE)
            .unwrap_or(DEFAULT_GRAPH_PROPERTY_QUEUE.to_string())
    }

    pub fn long_running_process_queue(&self) -> String {
        self.config
            .get_string(LONG_RUNNING_PROCESS_QUEUE)
            .unwrap_or(DEFAULT_LONG_RUNNING_PROCESS_QUEUE.to_string())
    }

    // ========================================================================
    // Broker
    // ========================================================================

    /// Broker endpoints; `localhost:5672` when none are configured.
    pub fn broker_addresses(&self) -> Result<Vec<BrokerAddress>> {
        let addresses = match self.config.get_array(BROKER_ADDRESSES) {
            Ok(values) => values
                .into_iter()
                .map(|v| {
                    v.into_string()
                        .map_err(GanglionError::from)
                        .and_then(|s| BrokerAddress::parse(&s))
                })
                .collect::<Result<Vec<_>>>()?,
            Err(_) => match self.config.get_string(BROKER_ADDRESSES) {
                Ok(v) => BrokerAddress::parse_list(&v)?,
                Err(_) => Vec::new(),
            },
        };

        if addresses.is_empty() {
            return Ok(vec![BrokerAddress::new("localhost", DEFAULT_BROKER_PORT)]);
        }
        Ok(addresses)
    }

    pub fn broadcast_exchange_name(&self) -> String {
        self.config
            .get_string(BROADCAST_EXCHANGE_NAME)
            .unwrap_or(DEFAULT_BROADCAST_EXCHANGE_NAME.to_string())
    }

    pub fn prefetch_count(&self) -> u16 {
        self.config
            .get_int(PREFETCH_COUNT)
            .ok()
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_PREFETCH_COUNT)
    }

    pub fn delivery_mode(&self) -> u8 {
        self.config
            .get_int(DELIVERY_MODE)
            .ok()
            .and_then(|v| u8::try_from(v).ok())
            .filter(|v| *v == 1 || *v == 2)
            .unwrap_or(DELIVERY_MODE_PERSISTENT)
    }

    // ========================================================================
    // Logging
    // ========================================================================

    pub fn log_path(&self) -> Option<String> {
        self.config.get_string(LOG_PATH).ok()
    }

    pub fn log_console(&self) -> bool {
        self.config.get_bool(LOG_CONSOLE).unwrap_or(true)
    }

    pub fn log_file(&self) -> bool {
        self.config.get_bool(LOG_FILE).unwrap_or(false)
    }

    pub fn log_level(&self) -> String {
        self.config
            .get_string(LOG_LEVEL)
            .unwrap_or("info".to_string())
    }
}
