//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{
    CliArgs, Command, CreateArgs, DeleteArgs, FetchArgs, GlobalOverrides, RecentArgs, UpdateArgs,
    WatchArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sentinel";
const ENV_PREFIX: &str = "SENTINEL";

const DEFAULT_COLLECTION_PATH: &str = "/api/bans";
const DEFAULT_STATISTICS_PATH: &str = "/api/bans/statistics";
const DEFAULT_ITEM_PATH: &str = "/api/ban/{id}";
const DEFAULT_HEALTH_PATH: &str = "/healthcheck";
const DEFAULT_EVENTS_PATH: &str = "/events";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COLLECTION_TTL_SECS: u64 = 300;
const DEFAULT_AGGREGATE_TTL_SECS: u64 = 60;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECENT_LIMIT: usize = 10;
const DEFAULT_CONFIRM_REFRESH_DELAY_MS: u64 = 2_000;

/// Placeholder substituted with the record id in the item path.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendSettings,
    pub cache: CacheSettings,
    pub realtime: RealtimeSettings,
    pub reconcile: ReconcileSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Required by every command that talks to the backend.
    pub base_url: Option<Url>,
    pub paths: EndpointPaths,
    pub session_cookie: Option<String>,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

/// Backend paths, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPaths {
    pub collection: String,
    pub statistics: String,
    /// Contains [`ID_PLACEHOLDER`].
    pub item: String,
    pub health: String,
    pub events: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION_PATH.to_string(),
            statistics: DEFAULT_STATISTICS_PATH.to_string(),
            item: DEFAULT_ITEM_PATH.to_string(),
            health: DEFAULT_HEALTH_PATH.to_string(),
            events: DEFAULT_EVENTS_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub collection_ttl: Duration,
    pub aggregate_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub enabled: bool,
    pub heartbeat: Duration,
    /// Upper bound on opening the push stream, response headers included.
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub decrement_dated_counters: bool,
    pub recent_limit: usize,
    /// Zero disables the refresh that follows a mutation.
    pub confirm_refresh_delay: Duration,
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

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Some(Command::Watch(args)) = cli.command.as_ref() {
        raw.apply_watch_overrides(args);
    }

    Settings::from_raw(raw)
}

/// Parse the process arguments and resolve settings against them.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    backend: RawBackendSettings,
    cache: RawCacheSettings,
    realtime: RawRealtimeSettings,
    reconcile: RawReconcileSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.backend_url.as_ref() {
            self.backend.base_url = Some(url.clone());
        }
        if let Some(cookie) = overrides.session_cookie.as_ref() {
            self.backend.session_cookie = Some(cookie.clone());
        }
        if let Some(token) = overrides.api_token.as_ref() {
            self.backend.api_token = Some(token.clone());
        }
        if let Some(seconds) = overrides.request_timeout_seconds {
            self.backend.request_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.collection_ttl_seconds {
            self.cache.collection_ttl_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.aggregate_ttl_seconds {
            self.cache.aggregate_ttl_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_watch_overrides(&mut self, overrides: &WatchArgs) {
        if let Some(enabled) = overrides.realtime {
            self.realtime.enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.heartbeat_seconds {
            self.realtime.heartbeat_seconds = Some(seconds);
        }
        if let Some(flag) = overrides.decrement_dated_counters {
            self.reconcile.decrement_dated_counters = Some(flag);
        }
        if let Some(delay) = overrides.confirm_refresh_delay_ms {
            self.reconcile.confirm_refresh_delay_ms = Some(delay);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            backend,
            cache,
            realtime,
            reconcile,
            logging,
        } = raw;

        Ok(Self {
            backend: build_backend_settings(backend)?,
            cache: build_cache_settings(cache)?,
            realtime: build_realtime_settings(realtime)?,
            reconcile: build_reconcile_settings(reconcile)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let base_url = match non_empty(backend.base_url) {
        Some(value) => {
            let url = Url::parse(&value)
                .map_err(|err| LoadError::invalid("backend.base_url", err.to_string()))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "backend.base_url",
                    format!("unsupported scheme `{}`", url.scheme()),
                ));
            }
            Some(url)
        }
        None => None,
    };

    let defaults = EndpointPaths::default();
    let paths = EndpointPaths {
        collection: endpoint_path(
            backend.collection_path,
            defaults.collection,
            "backend.collection_path",
        )?,
        statistics: endpoint_path(
            backend.statistics_path,
            defaults.statistics,
            "backend.statistics_path",
        )?,
        item: endpoint_path(backend.item_path, defaults.item, "backend.item_path")?,
        health: endpoint_path(backend.health_path, defaults.health, "backend.health_path")?,
        events: endpoint_path(backend.events_path, defaults.events, "backend.events_path")?,
    };
    if !paths.item.contains(ID_PLACEHOLDER) {
        return Err(LoadError::invalid(
            "backend.item_path",
            format!("must contain `{ID_PLACEHOLDER}`"),
        ));
    }

    let timeout_secs = backend
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "backend.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(BackendSettings {
        base_url,
        paths,
        session_cookie: non_empty(backend.session_cookie),
        api_token: non_empty(backend.api_token),
        request_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let collection_ttl = positive_seconds(
        cache
            .collection_ttl_seconds
            .unwrap_or(DEFAULT_COLLECTION_TTL_SECS),
        "cache.collection_ttl_seconds",
    )?;
    let aggregate_ttl = positive_seconds(
        cache
            .aggregate_ttl_seconds
            .unwrap_or(DEFAULT_AGGREGATE_TTL_SECS),
        "cache.aggregate_ttl_seconds",
    )?;

    Ok(CacheSettings {
        collection_ttl,
        aggregate_ttl,
    })
}

fn build_realtime_settings(realtime: RawRealtimeSettings) -> Result<RealtimeSettings, LoadError> {
    let heartbeat = positive_seconds(
        realtime.heartbeat_seconds.unwrap_or(DEFAULT_HEARTBEAT_SECS),
        "realtime.heartbeat_seconds",
    )?;
    let connect_timeout = positive_seconds(
        realtime
            .connect_timeout_seconds
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        "realtime.connect_timeout_seconds",
    )?;

    Ok(RealtimeSettings {
        enabled: realtime.enabled.unwrap_or(true),
        heartbeat,
        connect_timeout,
    })
}

fn build_reconcile_settings(
    reconcile: RawReconcileSettings,
) -> Result<ReconcileSettings, LoadError> {
    let recent_limit = reconcile.recent_limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    if recent_limit == 0 {
        return Err(LoadError::invalid(
            "reconcile.recent_limit",
            "must be greater than zero",
        ));
    }

    Ok(ReconcileSettings {
        decrement_dated_counters: reconcile.decrement_dated_counters.unwrap_or(false),
        recent_limit,
        confirm_refresh_delay: Duration::from_millis(
            reconcile
                .confirm_refresh_delay_ms
                .unwrap_or(DEFAULT_CONFIRM_REFRESH_DELAY_MS),
        ),
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

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn endpoint_path(
    value: Option<String>,
    default: String,
    key: &'static str,
) -> Result<String, LoadError> {
    let path = non_empty(value).unwrap_or(default);
    if !path.starts_with('/') {
        return Err(LoadError::invalid(key, "path must start with `/`"));
    }
    Ok(path)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    base_url: Option<String>,
    collection_path: Option<String>,
    statistics_path: Option<String>,
    item_path: Option<String>,
    health_path: Option<String>,
    events_path: Option<String>,
    session_cookie: Option<String>,
    api_token: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    collection_ttl_seconds: Option<u64>,
    aggregate_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRealtimeSettings {
    enabled: Option<bool>,
    heartbeat_seconds: Option<u64>,
    connect_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawReconcileSettings {
    decrement_dated_counters: Option<bool>,
    recent_limit: Option<usize>,
    confirm_refresh_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[cfg(test)]
mod tests;
