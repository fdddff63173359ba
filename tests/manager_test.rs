mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{entry, fast_policy, invalid_entry, manager_with, MockFactory};
use dbbridge_lib::config::{ManagerPolicy, SecurityPolicy};
use dbbridge_lib::db::registry::ConnectionState;
use dbbridge_lib::security::{AuditFilter, SecurityEventKind};
use dbbridge_lib::DbError;
use tokio::time::Instant;

fn assert_elapsed(started: Instant, expected_ms: u64) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(expected_ms)
            && elapsed < Duration::from_millis(expected_ms + 50),
        "elapsed {:?}, expected about {} ms",
        elapsed,
        expected_ms
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_skipped() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager_with(factory, fast_policy(), SecurityPolicy::default());

    let outcomes = manager
        .initialize(&[entry("a"), invalid_entry("broken"), entry("b")])
        .await;
    assert_eq!(outcomes.len(), 3);
    let broken = outcomes.iter().find(|(id, _)| id == "broken").unwrap();
    assert!(matches!(broken.1, Err(DbError::Configuration { .. })));

    let status = manager.get_status(None).await.unwrap();
    let ids: Vec<&str> = status.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(status.iter().all(|s| s.state == ConnectionState::Connected));
    assert_eq!(manager.current_id().await.as_deref(), Some("a"));
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_with_linear_delay() {
    let factory = Arc::new(MockFactory::default());
    factory.state("a").failing_connects.store(2, Ordering::SeqCst);
    let manager = manager_with(factory.clone(), fast_policy(), SecurityPolicy::default());

    let started = Instant::now();
    let outcomes = manager.initialize(&[entry("a")]).await;
    assert!(outcomes[0].1.is_ok());
    // 1000ms after attempt 1, 2000ms after attempt 2
    assert_elapsed(started, 3000);
    assert_eq!(factory.state("a").connect_calls(), 3);

    let metrics = manager.gate().metrics(Some("a"));
    assert_eq!(metrics.connection_attempts, 3);
    assert_eq!(metrics.connection_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_leave_connection_failed() {
    let factory = Arc::new(MockFactory::default());
    factory.state("down").failing_connects.store(10, Ordering::SeqCst);
    let manager = manager_with(factory.clone(), fast_policy(), SecurityPolicy::default());

    let started = Instant::now();
    let outcomes = manager.initialize(&[entry("down")]).await;
    assert!(matches!(outcomes[0].1, Err(DbError::Connection(_))));
    assert_elapsed(started, 3000);
    assert_eq!(factory.state("down").connect_calls(), 3);

    let status = &manager.get_status(Some("down")).await.unwrap()[0];
    assert!(matches!(status.state, ConnectionState::Failed(_)));
    assert_eq!(status.last_error.as_deref(), Some("Connection error: connection refused"));
    assert!(manager.current_id().await.is_none());

    assert_eq!(
        manager.query("SELECT 1", &[], None).await.unwrap_err(),
        DbError::NoCurrentConnection
    );
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_isolated_between_connections() {
    let factory = Arc::new(MockFactory::default());
    factory.state("first").failing_connects.store(10, Ordering::SeqCst);
    let manager = manager_with(factory, fast_policy(), SecurityPolicy::default());

    let started = Instant::now();
    manager.initialize(&[entry("first"), entry("second")]).await;
    // attempts run concurrently: the whole batch settles on the failing one's schedule
    assert_elapsed(started, 3000);
    assert_eq!(manager.current_id().await.as_deref(), Some("second"));
}

#[tokio::test(start_paused = true)]
async fn test_switch_connection() {
    let factory = Arc::new(MockFactory::default());
    factory.state("down").failing_connects.store(10, Ordering::SeqCst);
    let manager = manager_with(factory, fast_policy(), SecurityPolicy::default());
    manager
        .initialize(&[entry("a"), entry("b"), entry("down")])
        .await;

    let status = manager.switch("b").await.unwrap();
    assert!(status.is_current);
    assert_eq!(manager.current_id().await.as_deref(), Some("b"));

    assert_eq!(
        manager.switch("down").await.unwrap_err(),
        DbError::InactiveConnection("down".to_string())
    );
    assert_eq!(
        manager.switch("missing").await.unwrap_err(),
        DbError::NotFound("missing".to_string())
    );
    assert_eq!(manager.current_id().await.as_deref(), Some("b"));
}

#[tokio::test(start_paused = true)]
async fn test_query_results_are_truncated() {
    let factory = Arc::new(MockFactory::default());
    factory.state("big").rows.store(5000, Ordering::SeqCst);
    let manager = manager_with(factory, fast_policy(), SecurityPolicy::default());
    manager.initialize(&[entry("big")]).await;

    let result = manager
        .query("SELECT * FROM events", &[], Some("big"))
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1000);
    assert_eq!(result.total_rows, 5000);
    assert!(result.truncated);

    let events = manager.gate().filter_events(&AuditFilter {
        kind: Some(SecurityEventKind::QueryExecuted),
        ..Default::default()
    });
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].details.as_ref().unwrap()["truncated"], true);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_query_never_reaches_adapter() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager_with(factory.clone(), fast_policy(), SecurityPolicy::default());
    manager.initialize(&[entry("a")]).await;

    let err = manager
        .query("SELECT * FROM users UNION SELECT password FROM admins", &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::QueryBlocked { .. }));
    assert_eq!(factory.state("a").queries.load(Ordering::SeqCst), 0);

    let metrics = manager.gate().metrics(Some("a"));
    assert_eq!(metrics.queries_blocked, 1);
    assert_eq!(metrics.suspicious_activity, 1);
    assert_eq!(metrics.queries_executed, 0);

    let policy_err = manager.query("DROP TABLE users", &[], None).await.unwrap_err();
    assert!(matches!(policy_err, DbError::QueryBlocked { .. }));
    assert_eq!(manager.gate().metrics(Some("a")).queries_blocked, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_applies_per_connection() {
    let factory = Arc::new(MockFactory::default());
    let security = SecurityPolicy {
        rate_limit_max: 2,
        ..Default::default()
    };
    let manager = manager_with(factory, fast_policy(), security);
    manager.initialize(&[entry("a"), entry("b")]).await;

    manager.query("SELECT 1", &[], Some("a")).await.unwrap();
    manager.query("SELECT 1", &[], Some("a")).await.unwrap();
    let err = manager.query("SELECT 1", &[], Some("a")).await.unwrap_err();
    assert!(matches!(err, DbError::RateLimited { limit: 2, .. }));
    assert!(manager.query("SELECT 1", &[], Some("b")).await.is_ok());

    tokio::time::advance(Duration::from_millis(60_001)).await;
    assert!(manager.query("SELECT 1", &[], Some("a")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_query_on_disconnected_connection() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager_with(factory, fast_policy(), SecurityPolicy::default());
    manager.initialize(&[entry("a"), entry("b")]).await;

    manager.disconnect("a").await.unwrap();
    assert_eq!(manager.current_id().await.as_deref(), Some("b"));
    assert_eq!(
        manager.query("SELECT 1", &[], Some("a")).await.unwrap_err(),
        DbError::InactiveConnection("a".to_string())
    );
    let failed = manager.gate().filter_events(&AuditFilter {
        kind: Some(SecurityEventKind::QueryFailed),
        backend_id: Some("a".to_string()),
        ..Default::default()
    });
    assert_eq!(failed.len(), 1);

    assert_eq!(
        manager
            .query("SELECT 1", &[], Some("missing"))
            .await
            .unwrap_err()
            .code(),
        "not_found"
    );
    let missing = manager.gate().filter_events(&AuditFilter {
        kind: Some(SecurityEventKind::QueryFailed),
        backend_id: Some("missing".to_string()),
        ..Default::default()
    });
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].query.as_deref(), Some("SELECT 1"));

    manager.reconnect("a").await.unwrap();
    assert!(manager.query("SELECT 1", &[], Some("a")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_health_check_reconnects_unhealthy_connection() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager_with(factory.clone(), fast_policy(), SecurityPolicy::default());
    manager.initialize(&[entry("a")]).await;
    assert_eq!(factory.state("a").connect_calls(), 1);

    factory.state("a").healthy.store(false, Ordering::SeqCst);
    manager.run_health_checks().await;

    assert_eq!(factory.state("a").connect_calls(), 2);
    let failed = manager.gate().filter_events(&AuditFilter {
        kind: Some(SecurityEventKind::HealthCheckFailed),
        ..Default::default()
    });
    assert_eq!(failed.len(), 1);
    let status = &manager.get_status(Some("a")).await.unwrap()[0];
    assert_eq!(status.state, ConnectionState::Connected);
    assert!(status.last_checked.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_health_loop_runs_on_interval_and_stops_on_close() {
    let factory = Arc::new(MockFactory::default());
    let policy = ManagerPolicy {
        health_check_interval_ms: 1000,
        ..fast_policy()
    };
    let manager = manager_with(factory.clone(), policy, SecurityPolicy::default());
    manager.initialize(&[entry("a")]).await;
    factory.state("a").healthy.store(false, Ordering::SeqCst);

    assert!(manager.start_health_checks());
    assert!(!manager.start_health_checks());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(factory.state("a").connect_calls(), 3);

    manager.close().await;
    assert!(manager.get_status(None).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(factory.state("a").connect_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_health_checks_disabled_by_zero_interval() {
    let manager = manager_with(
        Arc::new(MockFactory::default()),
        fast_policy(),
        SecurityPolicy::default(),
    );
    assert!(!manager.start_health_checks());
}

#[tokio::test(start_paused = true)]
async fn test_test_all_and_unsupported_introspection() {
    let factory = Arc::new(MockFactory::default());
    factory.state("down").failing_connects.store(10, Ordering::SeqCst);
    let manager = manager_with(factory, fast_policy(), SecurityPolicy::default());
    manager.initialize(&[entry("up"), entry("down")]).await;

    let tests = manager.test_all().await;
    assert_eq!(tests.len(), 2);
    assert!(tests[0].healthy);
    assert!(!tests[1].healthy);
    assert!(tests[1].error.is_some());

    assert!(matches!(
        manager.list_databases(Some("up")).await,
        Err(DbError::UnsupportedOperation { .. })
    ));
    assert!(matches!(
        manager.get_schema("users; DROP", None, Some("up")).await,
        Err(DbError::InvalidArguments(_))
    ));
    assert_eq!(
        manager.get_schema("users", None, Some("up")).await.unwrap().table_name,
        "users"
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_disconnects_everything() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager_with(factory, fast_policy(), SecurityPolicy::default());
    manager.initialize(&[entry("a"), entry("b")]).await;

    manager.close().await;
    assert!(manager.get_status(None).await.unwrap().is_empty());
    assert!(manager.current_id().await.is_none());
    let closed = manager.gate().filter_events(&AuditFilter {
        kind: Some(SecurityEventKind::ConnectionClosed),
        ..Default::default()
    });
    assert_eq!(closed.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_queries_on_one_connection_run_concurrently() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager_with(factory.clone(), fast_policy(), SecurityPolicy::default());
    manager.initialize(&[entry("a")]).await;
    factory.state("a").query_delay_ms.store(1000, Ordering::SeqCst);

    let started = Instant::now();
    let (first, second) = tokio::join!(
        manager.query("SELECT 1", &[], Some("a")),
        manager.query("SELECT 2", &[], Some("a")),
    );
    assert!(first.is_ok() && second.is_ok());
    assert_elapsed(started, 1000);
    assert_eq!(factory.state("a").queries.load(Ordering::SeqCst), 2);
}
