//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{Capacity, StrategyKind};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "rendercache";
const ENV_PREFIX: &str = "RENDERCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_REVALIDATE_AFTER_SECS: u64 = 60;
const DEFAULT_CACHE_MAX_ENTRIES: i64 = 1000;

/// Command-line arguments for the rendercache binary.
#[derive(Debug, Parser)]
#[command(
    name = "rendercache",
    version,
    about = "Server-rendered pages with per-route cache strategies"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RENDERCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the demonstration site over HTTP.
    Serve(Box<ServeArgs>),
    /// Print registered routes with their resolved strategies.
    Routes(RoutesArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RoutesArgs {
    #[command(flatten)]
    pub render: RenderOverrides,

    /// Emit JSON instead of a table.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the strategy used by routes without one (fresh|cache-once|cache-with-revalidation|static-shell).
    #[arg(long = "default-strategy", value_name = "STRATEGY")]
    pub default_strategy: Option<String>,

    /// Override the default revalidation interval.
    #[arg(long = "default-revalidate-after-seconds", value_name = "SECONDS")]
    pub default_revalidate_after_seconds: Option<u64>,

    /// Override the per-store entry limit; -1 or 0 disables the limit.
    #[arg(
        long = "cache-max-entries",
        value_name = "COUNT",
        allow_negative_numbers = true
    )]
    pub cache_max_entries: Option<i64>,

    /// Toggle all caching; when off every route renders fresh.
    #[arg(
        long = "caching-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub caching_enabled: Option<bool>,

    /// Expire cache-once entries after this many seconds.
    #[arg(long = "cache-once-ttl-seconds", value_name = "SECONDS")]
    pub cache_once_ttl_seconds: Option<u64>,

    /// Delay retries of a failed background revalidation.
    #[arg(long = "revalidate-failure-cooldown-seconds", value_name = "SECONDS")]
    pub revalidate_failure_cooldown_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    /// Upper bound for both connection draining and revalidation draining.
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub default_strategy: StrategyKind,
    pub default_revalidate_after: Duration,
    pub cache_once_ttl: Option<Duration>,
    pub cache_capacity: Capacity,
    pub caching_enabled: bool,
    pub revalidate_failure_cooldown: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Routes(args)) => raw.apply_render_overrides(&args.render),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        self.apply_render_overrides(&overrides.render);
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(strategy) = overrides.default_strategy.as_ref() {
            self.render.default_strategy = Some(strategy.clone());
        }
        if let Some(seconds) = overrides.default_revalidate_after_seconds {
            self.render.default_revalidate_after_seconds = Some(seconds);
        }
        if let Some(limit) = overrides.cache_max_entries {
            self.render.cache_max_entries = Some(limit);
        }
        if let Some(enabled) = overrides.caching_enabled {
            self.render.caching_enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.cache_once_ttl_seconds {
            self.render.cache_once_ttl_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.revalidate_failure_cooldown_seconds {
            self.render.revalidate_failure_cooldown_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            render,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            render: build_render_settings(render)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let default_strategy = match render.default_strategy {
        Some(value) => StrategyKind::from_str(&value)
            .map_err(|reason| LoadError::invalid("render.default_strategy", reason))?,
        None => StrategyKind::default(),
    };

    let revalidate_secs = render
        .default_revalidate_after_seconds
        .unwrap_or(DEFAULT_REVALIDATE_AFTER_SECS);
    if revalidate_secs == 0 {
        return Err(LoadError::invalid(
            "render.default_revalidate_after_seconds",
            "must be greater than zero",
        ));
    }

    let cache_capacity = Capacity::from_max_entries(
        render
            .cache_max_entries
            .unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
    )
    .map_err(|err| LoadError::invalid("render.cache_max_entries", err.to_string()))?;

    let cache_once_ttl = match render.cache_once_ttl_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "render.cache_once_ttl_seconds",
                "must be greater than zero when set",
            ));
        }
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => None,
    };

    Ok(RenderSettings {
        default_strategy,
        default_revalidate_after: Duration::from_secs(revalidate_secs),
        cache_once_ttl,
        cache_capacity,
        caching_enabled: render.caching_enabled.unwrap_or(true),
        revalidate_failure_cooldown: Duration::from_secs(
            render.revalidate_failure_cooldown_seconds.unwrap_or(0),
        ),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    default_strategy: Option<String>,
    default_revalidate_after_seconds: Option<u64>,
    cache_max_entries: Option<i64>,
    caching_enabled: Option<bool>,
    cache_once_ttl_seconds: Option<u64>,
    revalidate_failure_cooldown_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert_eq!(settings.render.default_strategy, StrategyKind::Fresh);
        assert_eq!(
            settings.render.default_revalidate_after,
            Duration::from_secs(60)
        );
        assert_eq!(
            settings.render.cache_capacity,
            Capacity::Bounded(NonZeroUsize::new(1000).expect("non-zero"))
        );
        assert!(settings.render.caching_enabled);
        assert_eq!(settings.render.cache_once_ttl, None);
        assert_eq!(settings.render.revalidate_failure_cooldown, Duration::ZERO);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.render.default_strategy = Some("cache-once".to_string());

        let overrides = ServeOverrides {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            render: RenderOverrides {
                default_strategy: Some("cache-with-revalidation".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(
            settings.render.default_strategy,
            StrategyKind::CacheWithRevalidation
        );
    }

    #[test]
    fn unbounded_sentinels_are_accepted() {
        for limit in [-1, 0] {
            let mut raw = RawSettings::default();
            raw.render.cache_max_entries = Some(limit);
            let settings = Settings::from_raw(raw).expect("valid settings");
            assert_eq!(settings.render.cache_capacity, Capacity::Unbounded);
        }
    }

    #[test]
    fn other_negative_limits_are_rejected() {
        let mut raw = RawSettings::default();
        raw.render.cache_max_entries = Some(-5);
        let error = Settings::from_raw(raw).expect_err("negative limit rejected");
        assert!(matches!(
            error,
            LoadError::Invalid {
                key: "render.cache_max_entries",
                ..
            }
        ));
    }

    #[test]
    fn zero_revalidation_interval_is_rejected() {
        let mut raw = RawSettings::default();
        raw.render.default_revalidate_after_seconds = Some(0);
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn unknown_default_strategy_is_rejected() {
        let mut raw = RawSettings::default();
        raw.render.default_strategy = Some("sometimes".to_string());
        let error = Settings::from_raw(raw).expect_err("unknown strategy rejected");
        assert!(error.to_string().contains("render.default_strategy"));
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["rendercache"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "rendercache",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--cache-max-entries",
            "-1",
            "--caching-enabled",
            "false",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(serve.overrides.render.cache_max_entries, Some(-1));
                assert_eq!(serve.overrides.render.caching_enabled, Some(false));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_routes_arguments() {
        let args = CliArgs::parse_from([
            "rendercache",
            "routes",
            "--json",
            "--default-strategy",
            "cache-once",
        ]);

        match args.command.expect("routes command") {
            Command::Routes(routes) => {
                assert!(routes.json);
                assert_eq!(routes.render.default_strategy.as_deref(), Some("cache-once"));
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
