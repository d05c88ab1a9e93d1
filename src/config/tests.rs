use super::*;

#[test]
fn defaults_cover_every_section() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert!(settings.backend.base_url.is_none());
    assert_eq!(settings.backend.paths, EndpointPaths::default());
    assert_eq!(settings.backend.request_timeout, Duration::from_secs(30));
    assert_eq!(settings.cache.collection_ttl, Duration::from_secs(300));
    assert_eq!(settings.cache.aggregate_ttl, Duration::from_secs(60));
    assert!(settings.realtime.enabled);
    assert_eq!(settings.realtime.heartbeat, Duration::from_secs(30));
    assert_eq!(settings.realtime.connect_timeout, Duration::from_secs(30));
    assert!(!settings.reconcile.decrement_dated_counters);
    assert_eq!(settings.reconcile.recent_limit, 10);
    assert_eq!(
        settings.reconcile.confirm_refresh_delay,
        Duration::from_millis(2_000)
    );
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.backend.base_url = Some("http://file.example".to_string());
    raw.cache.collection_ttl_seconds = Some(900);
    raw.logging.level = Some("info".to_string());

    let overrides = GlobalOverrides {
        backend_url: Some("https://cli.example".to_string()),
        collection_ttl_seconds: Some(120),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(
        settings.backend.base_url.as_ref().map(Url::as_str),
        Some("https://cli.example/")
    );
    assert_eq!(settings.cache.collection_ttl, Duration::from_secs(120));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn watch_overrides_apply_realtime_and_reconcile_knobs() {
    let mut raw = RawSettings::default();
    raw.apply_watch_overrides(&WatchArgs {
        realtime: Some(false),
        heartbeat_seconds: Some(5),
        decrement_dated_counters: Some(true),
        confirm_refresh_delay_ms: Some(0),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(!settings.realtime.enabled);
    assert_eq!(settings.realtime.heartbeat, Duration::from_secs(5));
    assert!(settings.reconcile.decrement_dated_counters);
    assert!(settings.reconcile.confirm_refresh_delay.is_zero());
}

#[test]
fn zero_windows_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.aggregate_ttl_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero ttl");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.aggregate_ttl_seconds",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.realtime.heartbeat_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.realtime.connect_timeout_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.reconcile.recent_limit = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn item_path_must_carry_id_placeholder() {
    let mut raw = RawSettings::default();
    raw.backend.item_path = Some("/api/ban".to_string());
    let err = Settings::from_raw(raw).expect_err("missing placeholder");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "backend.item_path",
            ..
        }
    ));
}

#[test]
fn base_url_must_be_http() {
    let mut raw = RawSettings::default();
    raw.backend.base_url = Some("ftp://example.com".to_string());
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.backend.base_url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("blank url is unset");
    assert!(settings.backend.base_url.is_none());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.apply_global_overrides(&GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_watch_command() {
    let args = CliArgs::parse_from(["sentinel-sync"]);
    let command = args.command.unwrap_or(Command::Watch(WatchArgs::default()));
    assert!(matches!(command, Command::Watch(_)));
}

#[test]
fn parse_update_arguments() {
    let args = CliArgs::parse_from([
        "sentinel-sync",
        "update",
        "42",
        "--reason",
        "raid",
        "--backend-url",
        "http://localhost:5000",
    ]);

    assert_eq!(
        args.overrides.backend_url.as_deref(),
        Some("http://localhost:5000")
    );
    match args.command.expect("update command") {
        Command::Update(update) => {
            assert_eq!(update.id, 42);
            assert_eq!(update.reason.as_deref(), Some("raid"));
            assert!(update.captured_message.is_none());
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_create_arguments() {
    let args = CliArgs::parse_from([
        "sentinel-sync",
        "create",
        "--member-id",
        "123",
        "--username",
        "spammer",
        "--server-id",
        "456",
        "--server-name",
        "guild",
    ]);

    match args.command.expect("create command") {
        Command::Create(create) => {
            assert_eq!(create.member_id, "123");
            assert!(create.reason.is_none());
            assert_eq!(create.captured_message, "");
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn explicit_config_file_is_layered_under_cli() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(
        &mut file,
        br#"
[backend]
base_url = "http://file.example:5000"
collection_path = "/v2/records"

[cache]
collection_ttl_seconds = 600

[reconcile]
recent_limit = 25
"#,
    )
    .expect("write config");

    let mut args = CliArgs::parse_from(["sentinel-sync", "--collection-ttl-seconds", "90", "list"]);
    args.config_file = Some(file.path().to_path_buf());
    let settings = load(&args).expect("settings load");

    assert_eq!(
        settings.backend.base_url.as_ref().map(Url::as_str),
        Some("http://file.example:5000/")
    );
    assert_eq!(settings.backend.paths.collection, "/v2/records");
    assert_eq!(settings.cache.collection_ttl, Duration::from_secs(90));
    assert_eq!(settings.reconcile.recent_limit, 25);
}

#[test]
fn missing_explicit_config_file_is_an_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut args = CliArgs::parse_from(["sentinel-sync", "health"]);
    args.config_file = Some(dir.path().join("absent.toml"));

    assert!(matches!(load(&args), Err(LoadError::Build(_))));
}
