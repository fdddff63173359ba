mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{entry, fast_policy, manager_with, MockFactory};
use dbbridge_lib::config::SecurityPolicy;
use dbbridge_lib::{DbError, ToolRouter};
use serde_json::{json, Value};

async fn router() -> (ToolRouter, Arc<MockFactory>) {
    let factory = Arc::new(MockFactory::default());
    factory.state("down").failing_connects.store(10, Ordering::SeqCst);
    let manager = manager_with(factory.clone(), fast_policy(), SecurityPolicy::default());
    manager.initialize(&[entry("main"), entry("down")]).await;
    (ToolRouter::new(manager), factory)
}

#[tokio::test(start_paused = true)]
async fn test_query_tool() {
    let (router, _) = router().await;
    let result = router
        .call(
            "query",
            json!({ "statement": "SELECT n FROM t WHERE n > ?", "params": [0] }),
        )
        .await
        .unwrap();
    assert_eq!(result["rows"].as_array().unwrap().len(), 3);
    assert_eq!(result["truncated"], false);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_and_bad_arguments() {
    let (router, _) = router().await;
    assert!(matches!(
        router.call("drop_everything", Value::Null).await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(
        router.call("query", json!({ "params": "nope" })).await,
        Err(DbError::InvalidArguments(_))
    ));
    assert!(matches!(
        router.call("switch_connection", json!({})).await,
        Err(DbError::InvalidArguments(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connection_tools() {
    let (router, _) = router().await;

    let status = router.call("get_status", Value::Null).await.unwrap();
    let status = status.as_array().unwrap();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0]["id"], "main");
    assert_eq!(status[0]["state"], "connected");
    assert_eq!(status[0]["isCurrent"], true);
    assert_eq!(status[1]["state"], "failed");

    let err = router
        .call("switch_connection", json!({ "connectionId": "down" }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "inactive_connection");

    let tested = router
        .call("test_connection", json!({ "connectionId": "main" }))
        .await
        .unwrap();
    assert_eq!(tested["healthy"], true);

    let all = router.call("test_all", Value::Null).await.unwrap();
    assert_eq!(all.as_array().unwrap().len(), 2);

    let err = router
        .call("server_info", json!({ "connectionId": "main" }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unsupported_operation");

    let tables = router
        .call("list_tables", json!({ "connectionId": "main" }))
        .await
        .unwrap();
    assert_eq!(tables, json!(["users"]));

    let schema = router
        .call("get_schema", json!({ "table": "users" }))
        .await
        .unwrap();
    assert_eq!(schema["table_name"], "users");
}

#[tokio::test(start_paused = true)]
async fn test_security_tools() {
    let (router, _) = router().await;
    let _ = router
        .call("query", json!({ "statement": "x; DROP TABLE users" }))
        .await;

    let report = router.call("get_security_report", Value::Null).await.unwrap();
    assert_eq!(report["globalMetrics"]["queriesBlocked"], 1);
    assert!(report["backendMetrics"]["main"].is_object());
    assert!(report["recentEvents"].as_array().unwrap().len() <= 10);

    let metrics = router
        .call("get_security_metrics", json!({ "connectionId": "down" }))
        .await
        .unwrap();
    assert_eq!(metrics["connectionAttempts"], 3);
    assert_eq!(metrics["connectionFailures"], 3);

    let events = router
        .call("get_recent_events", json!({ "limit": 2 }))
        .await
        .unwrap();
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["kind"], "query_blocked");

    let purged = router
        .call("purge_events", json!({ "maxAgeHours": 24 }))
        .await
        .unwrap();
    assert_eq!(purged["purged"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_line_framing() {
    let (router, _) = router().await;

    let ok: Value = serde_json::from_str(
        &router
            .handle_line(r#"{"tool": "query", "args": {"sql": "SELECT 1"}}"#)
            .await,
    )
    .unwrap();
    assert_eq!(ok["ok"], true);
    assert!(ok["result"]["rows"].is_array());

    let err: Value = serde_json::from_str(&router.handle_line("not json").await).unwrap();
    assert_eq!(err["ok"], false);
    assert_eq!(err["error"]["code"], "invalid_arguments");

    let blocked: Value = serde_json::from_str(
        &router
            .handle_line(r#"{"tool": "query", "args": {"sql": "SELECT pg_sleep(5)"}}"#)
            .await,
    )
    .unwrap();
    assert_eq!(blocked["error"]["code"], "query_blocked");
    assert!(blocked["error"]["message"]
        .as_str()
        .unwrap()
        .contains("suspicious pattern detected"));
}
