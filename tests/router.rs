use quarry::error::QuarryError;
use quarry::postgres::RetryPolicy;
use quarry::prelude::*;

use crate::common::{Event, Script, ScriptedConnector, User, config, init_tracing, router};

mod common;

const TOML: &str = r#"
    timezone = "Asia/Tokyo"

    [databases.main]
    TYPE = "WRITE"
    USER = "app"
    DB = "app"

    [databases.ro1]
    TYPE = "READ"
    USER = "app"
    DB = "app"
    HOST = "ro1"

    [databases.ro2]
    TYPE = "READ"
    USER = "app"
    DB = "app"
    HOST = "ro2"
"#;

#[test]
fn layout_is_checked_on_construction() {
    let script = Script::new();

    let two_writers = config().database("other", ConnectionConfig::new(Role::Write, "u", "d"));
    let err = ConnectionRouter::with_connector(two_writers, ScriptedConnector::new(&script))
        .unwrap_err();
    assert!(matches!(err, QuarryError::MultipleWriteConnections));

    let no_reader =
        RouterConfig::new().database("primary", ConnectionConfig::new(Role::Write, "u", "d"));
    let err =
        ConnectionRouter::with_connector(no_reader, ScriptedConnector::new(&script)).unwrap_err();
    assert!(matches!(err, QuarryError::ReadConnectionNotAvailable));
}

#[tokio::test]
async fn reads_and_writes_go_to_their_roles() {
    let script = Script::new();
    let router = router(&script).await;

    assert_eq!(router.read().unwrap().name(), "replica");
    assert_eq!(router.read().unwrap().role(), Role::Read);
    assert_eq!(router.write().unwrap().name(), "primary");
    assert_eq!(router.using("primary").unwrap().role(), Role::Write);
}

#[tokio::test]
async fn reads_spread_over_every_reader() {
    init_tracing();
    let script = Script::new();
    let config = RouterConfig::from_toml_str(TOML).unwrap();
    let router = ConnectionRouter::with_connector(config, ScriptedConnector::new(&script)).unwrap();
    router.connect().await.unwrap();

    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..200 {
        seen.insert(router.read().unwrap().name().to_string());
    }
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), ["ro1", "ro2"]);
    assert_eq!(router.write().unwrap().name(), "main");
}

#[tokio::test]
async fn unknown_names_are_rejected() {
    let script = Script::new();
    let router = router(&script).await;

    assert!(matches!(
        router.using("archive"),
        Err(QuarryError::InvalidConnectionName(name)) if name == "archive"
    ));
    let err = User::objects(&router).unwrap().using("archive").unwrap_err();
    assert!(matches!(err, QuarryError::InvalidConnectionName(_)));
}

#[tokio::test]
async fn nothing_is_usable_before_connect() {
    let script = Script::new();
    let router =
        ConnectionRouter::with_connector(config(), ScriptedConnector::new(&script)).unwrap();

    assert!(matches!(router.read(), Err(QuarryError::Config(_))));
    assert!(matches!(router.using("primary"), Err(QuarryError::Config(_))));
    assert!(router.transaction().await.is_err());
    assert_eq!(script.connect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_retries_with_a_fixed_delay() {
    init_tracing();
    let script = Script::new();
    script.fail_connects(2);
    let router =
        ConnectionRouter::with_connector(config(), ScriptedConnector::new(&script)).unwrap();

    let started = tokio::time::Instant::now();
    router.connect().await.unwrap();

    assert_eq!(script.connect_attempts(), 4);
    assert_eq!(started.elapsed().as_secs(), 4);
    assert!(router.write().is_ok());
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_the_last_attempt() {
    init_tracing();
    let script = Script::new();
    script.fail_connects(10);
    let config = config().retry(RetryPolicy {
        max_retries: 2,
        retry_delay_secs: 1,
    });
    let router = ConnectionRouter::with_connector(config, ScriptedConnector::new(&script)).unwrap();

    match router.connect().await.unwrap_err() {
        QuarryError::ConnectionFailed {
            name,
            attempts,
            source,
        } => {
            assert_eq!(name, "primary");
            assert_eq!(attempts, 2);
            assert_eq!(source.name, "ConnectionRefused");
        }
        other => panic!("expected ConnectionFailed, got {other:?}"),
    }
    assert_eq!(script.connect_attempts(), 2);
}

#[tokio::test]
async fn connect_is_idempotent() {
    let script = Script::new();
    let router = router(&script).await;

    router.connect().await.unwrap();
    assert_eq!(script.connect_attempts(), 2);
}

#[tokio::test]
async fn close_releases_every_connection() {
    let script = Script::new();
    let router = router(&script).await;

    router.close().await;
    let mut closed: Vec<Event> = script.events();
    closed.sort_by_key(|event| format!("{event:?}"));
    assert_eq!(
        closed,
        [Event::Close("primary".into()), Event::Close("replica".into())]
    );
    assert!(matches!(router.write(), Err(QuarryError::Config(_))));

    router.close().await;
    assert_eq!(script.events().len(), 2);
}

#[tokio::test]
async fn now_follows_the_configured_zone() {
    let script = Script::new();
    let router = ConnectionRouter::with_connector(
        config().timezone("Asia/Tokyo"),
        ScriptedConnector::new(&script),
    )
    .unwrap();

    assert_eq!(router.timezone(), chrono_tz::Asia::Tokyo);
    match router.now_value() {
        Value::TimestampTz(ts) => assert_eq!(ts.offset().local_minus_utc(), 9 * 3600),
        other => panic!("expected a timestamp, got {other:?}"),
    }
}

#[tokio::test]
async fn sessions_get_the_resolved_zone() {
    let script = Script::new();
    let router = ConnectionRouter::with_connector(
        config().timezone("Mars/Olympus"),
        ScriptedConnector::new(&script),
    )
    .unwrap();
    router.connect().await.unwrap();

    assert_eq!(router.timezone(), chrono_tz::UTC);
    assert_eq!(script.timezones(), ["UTC", "UTC"]);
}
