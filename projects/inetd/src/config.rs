//! Configuration of the daemon itself.
//!
//! The services come from inetd.conf. Knobs of the daemon (throttling,
//! sockets, shutdown, logging) come from an optional TOML settings file,
//! every value in there has a default. Command line flags win over the file.

use log::LevelFilter;

use crate::dispatcher::DEFAULT_DATAGRAM_SETTLE;
use crate::entrypoints::CliArgs;
use crate::sockets::CONN_QUEUE_SIZE;
use crate::throttle::ThrottlePolicy;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONF_PATH: &str = "/etc/inetd.conf";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Longest interval any setting may ask for
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct LoggingConfig {
    pub log_to_stdout: bool,
    pub level: LevelFilter,
    /// Name every log line is tagged with
    pub prog_name: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub prog_name: String,
    pub conf_path: PathBuf,
    pub services_db: PathBuf,
    pub backlog: i32,
    pub throttle: ThrottlePolicy,
    pub datagram_settle: Duration,
    pub shutdown_grace: Duration,
    pub dry_run: bool,
}

impl Config {
    /// Defaults for everything but the service file
    #[must_use]
    pub fn new(prog_name: &str, conf_path: PathBuf) -> Self {
        Self {
            prog_name: prog_name.to_owned(),
            conf_path,
            services_db: PathBuf::from(crate::platform::servent::DEFAULT_SERVICES_DB),
            backlog: CONN_QUEUE_SIZE,
            throttle: ThrottlePolicy::default(),
            datagram_settle: DEFAULT_DATAGRAM_SETTLE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            dry_run: false,
        }
    }
}

#[derive(serde::Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub throttle: ThrottleSettings,
    pub sockets: SocketSettings,
    pub shutdown: ShutdownSettings,
    pub logging: LoggingSettings,
}

#[derive(serde::Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleSettings {
    pub max_failures: usize,
    pub window_secs: u64,
    pub backoff_secs: u64,
    pub min_runtime_ms: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        let policy = ThrottlePolicy::default();
        Self {
            max_failures: policy.max_failures,
            window_secs: policy.window.as_secs(),
            backoff_secs: policy.backoff.as_secs(),
            min_runtime_ms: policy.min_runtime.as_millis() as u64,
        }
    }
}

#[derive(serde::Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct SocketSettings {
    pub backlog: i32,
    pub datagram_settle_ms: u64,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            backlog: CONN_QUEUE_SIZE,
            datagram_settle_ms: DEFAULT_DATAGRAM_SETTLE.as_millis() as u64,
        }
    }
}

#[derive(serde::Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownSettings {
    pub grace_secs: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
        }
    }
}

#[derive(serde::Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Read(PathBuf, std::io::Error),
    Toml(PathBuf, toml::de::Error),
    BadLevel(String),
    BadValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Read(path, e) => write!(f, "could not read settings {path:?}: {e}"),
            Self::Toml(path, e) => write!(f, "invalid settings in {path:?}: {e}"),
            Self::BadLevel(level) => write!(f, "unknown log level {level:?}"),
            Self::BadValue(field, reason) => write!(f, "invalid value for {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn parse_settings(content: &str, path: &Path) -> Result<Settings, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Toml(path.to_owned(), e))
}

fn read_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
    parse_settings(&content, path)
}

fn parse_level(level: &str) -> Result<LevelFilter, ConfigError> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| ConfigError::BadLevel(level.to_owned()))
}

fn interval(field: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value > MAX_INTERVAL {
        return Err(ConfigError::BadValue(
            field,
            format!("{value:?} is longer than {MAX_INTERVAL:?}"),
        ));
    }
    Ok(value)
}

/// Basename of argv[0], the name the daemon tags its diagnostics with
#[must_use]
pub fn prog_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned())
}

/// Merge defaults, the settings file and the command line
pub fn build_config(
    args: &CliArgs,
    settings: Settings,
    prog_name: &str,
) -> Result<(LoggingConfig, Config), ConfigError> {
    if settings.sockets.backlog <= 0 {
        return Err(ConfigError::BadValue(
            "sockets.backlog",
            format!("{} is not a positive number", settings.sockets.backlog),
        ));
    }

    let level = match args.log_level.as_deref().or(settings.logging.level.as_deref()) {
        Some(level) => parse_level(level)?,
        None => LevelFilter::Info,
    };

    let mut config = Config::new(prog_name, args.conf_path.clone());
    config.services_db = args.services_db.clone();
    config.dry_run = args.dry_run;
    config.backlog = settings.sockets.backlog;
    config.datagram_settle = interval(
        "sockets.datagram_settle_ms",
        Duration::from_millis(settings.sockets.datagram_settle_ms),
    )?;
    config.shutdown_grace = interval(
        "shutdown.grace_secs",
        Duration::from_secs(settings.shutdown.grace_secs),
    )?;
    config.throttle = ThrottlePolicy {
        max_failures: settings.throttle.max_failures,
        window: interval(
            "throttle.window_secs",
            Duration::from_secs(settings.throttle.window_secs),
        )?,
        backoff: interval(
            "throttle.backoff_secs",
            Duration::from_secs(settings.throttle.backoff_secs),
        )?,
        min_runtime: interval(
            "throttle.min_runtime_ms",
            Duration::from_millis(settings.throttle.min_runtime_ms),
        )?,
    };

    let logging_config = LoggingConfig {
        log_to_stdout: true,
        level,
        prog_name: prog_name.to_owned(),
    };
    Ok((logging_config, config))
}

pub fn load_config(args: &CliArgs) -> Result<(LoggingConfig, Config), ConfigError> {
    let settings = match &args.settings {
        Some(path) => read_settings(path)?,
        None => Settings::default(),
    };
    build_config(args, settings, &prog_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("inetd").chain(extra.iter().copied()))
    }

    #[test]
    fn defaults_without_settings() {
        let (logging, config) = build_config(&args(&[]), Settings::default(), "inetd").unwrap();
        assert_eq!(logging.level, LevelFilter::Info);
        assert_eq!(logging.prog_name, "inetd");
        assert_eq!(config.conf_path, PathBuf::from(DEFAULT_CONF_PATH));
        assert_eq!(config.backlog, 32);
        assert_eq!(config.throttle, ThrottlePolicy::default());
        assert_eq!(config.datagram_settle, Duration::from_secs(1));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(!config.dry_run);
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let settings = parse_settings(
            r#"
[throttle]
max_failures = 3
backoff_secs = 2

[sockets]
datagram_settle_ms = 250

[logging]
level = "debug"
"#,
            Path::new("test.toml"),
        )
        .unwrap();
        let (logging, config) =
            build_config(&args(&["/tmp/inetd.conf"]), settings, "inetd").unwrap();
        assert_eq!(logging.level, LevelFilter::Debug);
        assert_eq!(config.conf_path, PathBuf::from("/tmp/inetd.conf"));
        assert_eq!(config.throttle.max_failures, 3);
        assert_eq!(config.throttle.backoff, Duration::from_secs(2));
        // untouched fields keep their defaults
        assert_eq!(config.throttle.window, Duration::from_secs(10));
        assert_eq!(config.datagram_settle, Duration::from_millis(250));
    }

    #[test]
    fn command_line_level_wins() {
        let settings = parse_settings("[logging]\nlevel = \"debug\"\n", Path::new("t")).unwrap();
        let (logging, _) =
            build_config(&args(&["--log-level", "trace"]), settings, "inetd").unwrap();
        assert_eq!(logging.level, LevelFilter::Trace);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            parse_settings("[throttle]\nmax_fails = 3\n", Path::new("t")),
            Err(ConfigError::Toml(..))
        ));
        assert!(matches!(
            build_config(&args(&["--log-level", "loud"]), Settings::default(), "inetd"),
            Err(ConfigError::BadLevel(_))
        ));
        let settings = parse_settings("[sockets]\nbacklog = 0\n", Path::new("t")).unwrap();
        assert!(matches!(
            build_config(&args(&[]), settings, "inetd"),
            Err(ConfigError::BadValue("sockets.backlog", _))
        ));
    }

    #[test]
    fn rejects_intervals_longer_than_a_day() {
        for (content, field) in [
            (
                "[throttle]\nbackoff_secs = 9223372036854775807\n",
                "throttle.backoff_secs",
            ),
            (
                "[sockets]\ndatagram_settle_ms = 9223372036854775807\n",
                "sockets.datagram_settle_ms",
            ),
            ("[shutdown]\ngrace_secs = 86401\n", "shutdown.grace_secs"),
        ] {
            let settings = parse_settings(content, Path::new("t")).unwrap();
            match build_config(&args(&[]), settings, "inetd") {
                Err(ConfigError::BadValue(reported, _)) => assert_eq!(reported, field),
                other => panic!("expected BadValue for {field}, got {other:?}"),
            }
        }

        let settings = parse_settings("[throttle]\nbackoff_secs = 86400\n", Path::new("t")).unwrap();
        let (_, config) = build_config(&args(&[]), settings, "inetd").unwrap();
        assert_eq!(config.throttle.backoff, MAX_INTERVAL);
    }

    #[test]
    fn missing_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let cli = args(&["--settings", missing.to_str().unwrap()]);
        assert!(matches!(load_config(&cli), Err(ConfigError::Read(..))));
    }
}
