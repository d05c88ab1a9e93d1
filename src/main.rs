use std::{process, sync::Arc, time::Duration};

use serde::Serialize;
use sentinel_sync::{
    application::{
        error::{AppError, SyncError},
        repos::HealthProbe,
        repository::{RecordRepository, RepositoryConfig, ViewResult},
    },
    config::{self, Command, CreateArgs, DeleteArgs, FetchArgs, RecentArgs, UpdateArgs},
    domain::{NewRecord, RecordPatch},
    infra::{backend::HttpBackend, telemetry},
    realtime::{ChannelConfig, ConnectionState, ConnectionStatus, RealtimeChannel},
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval_at},
};
use tracing::{Dispatch, Level, debug, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(Command::Watch(config::WatchArgs::default()));

    telemetry::init(&settings.logging)?;

    let backend = Arc::new(HttpBackend::from_settings(&settings.backend)?);
    let mut repository_config = RepositoryConfig::from(&settings);
    if !matches!(command, Command::Watch(_)) {
        // One-shot commands exit before a delayed refresh could land.
        repository_config.confirm_refresh_delay = Duration::ZERO;
    }
    let repository = RecordRepository::new(backend.clone(), repository_config);

    match command {
        Command::Watch(_) => run_watch(&settings, backend, repository).await,
        Command::List(args) => run_list(&repository, args).await,
        Command::Stats(args) => run_stats(&repository, args).await,
        Command::Recent(args) => run_recent(&repository, args).await,
        Command::Health => run_health(backend.as_ref()).await,
        Command::Create(args) => run_create(&repository, args).await,
        Command::Update(args) => run_update(&repository, args).await,
        Command::Delete(args) => run_delete(&repository, args).await,
    }
}

async fn run_watch(
    settings: &config::Settings,
    backend: Arc<HttpBackend>,
    repository: RecordRepository,
) -> Result<(), AppError> {
    let channel = if settings.realtime.enabled {
        let transport = backend.push_transport()?;
        Some(RealtimeChannel::new(
            Arc::new(transport),
            backend.clone(),
            ChannelConfig::from(&settings.realtime),
        ))
    } else {
        None
    };
    let _subscriptions = channel
        .as_ref()
        .map(|channel| repository.attach(channel))
        .unwrap_or_default();

    repository.refresh_stale().await;
    if let Some(channel) = channel.as_ref() {
        channel.connect();
    }

    let heartbeat = settings.realtime.heartbeat;
    let mut ticker = interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut revisions = repository.watch_revision();
    let mut status = channel.as_ref().map(RealtimeChannel::watch_status);
    let mut refreshing: Option<JoinHandle<()>> = None;

    info!(
        records = repository.records().len(),
        total = repository.aggregate().total,
        realtime = channel.is_some(),
        "Watching record collection"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                let revision = *revisions.borrow_and_update();
                let aggregate = repository.aggregate();
                info!(
                    revision,
                    records = repository.records().len(),
                    total = aggregate.total,
                    today = aggregate.today,
                    this_month = aggregate.this_month,
                    "View changed"
                );
            }
            Some(current) = next_status(&mut status) => {
                info!(
                    state = current.state.as_str(),
                    health = ?current.health.as_ref().map(|report| report.status),
                    error = current.last_error.as_deref(),
                    "Channel status"
                );
            }
            _ = ticker.tick() => {
                if refreshing.as_ref().is_none_or(JoinHandle::is_finished) {
                    refreshing = Some(repository.spawn_refresh());
                } else {
                    debug!("Previous refresh still running");
                }
                if let Some(channel) = channel.as_ref()
                    && channel.state() == ConnectionState::Disconnected
                {
                    info!("Reconnecting push channel");
                    channel.reconnect();
                }
            }
        }
    }

    if let Some(refresh) = refreshing {
        refresh.abort();
    }
    if let Some(channel) = channel.as_ref() {
        channel.disconnect();
    }
    Ok(())
}

async fn next_status(
    receiver: &mut Option<watch::Receiver<ConnectionStatus>>,
) -> Option<ConnectionStatus> {
    match receiver {
        Some(receiver) => match receiver.changed().await {
            Ok(()) => Some(receiver.borrow_and_update().clone()),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn run_list(repository: &RecordRepository, args: FetchArgs) -> Result<(), AppError> {
    let records = into_result(repository.fetch_collection(args.force).await)?;
    print_json(&records)
}

async fn run_stats(repository: &RecordRepository, args: FetchArgs) -> Result<(), AppError> {
    let aggregate = into_result(repository.fetch_aggregate(args.force).await)?;
    print_json(&aggregate)
}

async fn run_recent(repository: &RecordRepository, args: RecentArgs) -> Result<(), AppError> {
    into_result(repository.fetch_collection(false).await)?;
    let limit = args.limit.unwrap_or(repository.config().recent_limit);
    print_json(&repository.recent(limit))
}

async fn run_health(probe: &dyn HealthProbe) -> Result<(), AppError> {
    let report = probe.check().await?;
    print_json(&report)
}

async fn run_create(repository: &RecordRepository, args: CreateArgs) -> Result<(), AppError> {
    let CreateArgs {
        member_id,
        username,
        display_name,
        server_id,
        server_name,
        reason,
        captured_message,
    } = args;
    let response = repository
        .create(NewRecord {
            member_id,
            username,
            display_name,
            server_id,
            server_name,
            reason,
            captured_message,
        })
        .await?;
    print_json(&response)
}

async fn run_update(repository: &RecordRepository, args: UpdateArgs) -> Result<(), AppError> {
    let mut patch = RecordPatch::new();
    if let Some(reason) = args.reason {
        patch = patch.reason(reason);
    }
    if let Some(message) = args.captured_message {
        patch = patch.captured_message(message);
    }
    let ack = repository.update(args.id, patch).await?;
    print_json(&ack)
}

async fn run_delete(repository: &RecordRepository, args: DeleteArgs) -> Result<(), AppError> {
    let ack = repository.delete(args.id).await?;
    print_json(&ack)
}

fn into_result<T>(result: ViewResult<T>) -> Result<T, SyncError> {
    match result.error {
        Some(err) => Err(err),
        None => Ok(result.value),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
