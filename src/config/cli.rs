use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::domain::RecordId;

/// Command-line arguments for the sentinel-sync binary.
#[derive(Debug, Parser)]
#[command(
    name = "sentinel-sync",
    version,
    about = "Mirror of a moderation-record collection kept in sync with its backend"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SENTINEL_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Load the view, follow the push channel and log every change.
    Watch(WatchArgs),
    /// Print the record collection.
    List(FetchArgs),
    /// Print the aggregate statistics.
    Stats(FetchArgs),
    /// Print the most recently created records.
    Recent(RecentArgs),
    /// Probe the backend health endpoint.
    Health,
    /// Create a record.
    Create(CreateArgs),
    /// Patch the reason or captured message of a record.
    Update(UpdateArgs),
    /// Delete a record.
    Delete(DeleteArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the backend base URL.
    #[arg(long = "backend-url", value_name = "URL", global = true)]
    pub backend_url: Option<String>,

    /// Session cookie sent with every request (raw `Cookie` header value).
    #[arg(
        long = "session-cookie",
        env = "SENTINEL_SESSION_COOKIE",
        value_name = "COOKIE",
        global = true,
        hide_env_values = true
    )]
    pub session_cookie: Option<String>,

    /// Bearer token sent with every request.
    #[arg(
        long = "api-token",
        env = "SENTINEL_API_TOKEN",
        value_name = "TOKEN",
        global = true,
        hide_env_values = true
    )]
    pub api_token: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "request-timeout-seconds", value_name = "SECONDS", global = true)]
    pub request_timeout_seconds: Option<u64>,

    /// Override the collection freshness window.
    #[arg(long = "collection-ttl-seconds", value_name = "SECONDS", global = true)]
    pub collection_ttl_seconds: Option<u64>,

    /// Override the aggregate freshness window.
    #[arg(long = "aggregate-ttl-seconds", value_name = "SECONDS", global = true)]
    pub aggregate_ttl_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchArgs {
    /// Toggle the push channel; without it the view only refreshes on the heartbeat cadence.
    #[arg(
        long = "realtime",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub realtime: Option<bool>,

    /// Override the heartbeat interval.
    #[arg(long = "heartbeat-seconds", value_name = "SECONDS")]
    pub heartbeat_seconds: Option<u64>,

    /// Decrement today/this-month counters on removal when the record's creation date allows.
    #[arg(
        long = "decrement-dated-counters",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub decrement_dated_counters: Option<bool>,

    /// Override the delay of the refresh that follows a mutation (0 disables).
    #[arg(long = "confirm-refresh-delay-ms", value_name = "MILLIS")]
    pub confirm_refresh_delay_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct FetchArgs {
    /// Bypass the freshness window.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RecentArgs {
    /// Number of records to print; defaults to `reconcile.recent_limit`.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct CreateArgs {
    #[arg(long = "member-id", value_name = "ID")]
    pub member_id: String,

    #[arg(long, value_name = "NAME")]
    pub username: String,

    #[arg(long = "display-name", value_name = "NAME")]
    pub display_name: Option<String>,

    #[arg(long = "server-id", value_name = "ID")]
    pub server_id: String,

    #[arg(long = "server-name", value_name = "NAME")]
    pub server_name: String,

    #[arg(long, value_name = "TEXT")]
    pub reason: Option<String>,

    #[arg(long = "captured-message", value_name = "TEXT", default_value = "")]
    pub captured_message: String,
}

#[derive(Debug, Args, Clone)]
pub struct UpdateArgs {
    #[arg(value_name = "ID")]
    pub id: RecordId,

    #[arg(long, value_name = "TEXT")]
    pub reason: Option<String>,

    #[arg(long = "captured-message", value_name = "TEXT")]
    pub captured_message: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct DeleteArgs {
    #[arg(value_name = "ID")]
    pub id: RecordId,
}
