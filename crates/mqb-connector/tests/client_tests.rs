//! ReconnectingClient Tests
//!
//! Tests for:
//! - Cleanup of partially opened connections
//! - Connection error notifications within the quiet window
//! - Failing instead of reconnecting when reconnect is not allowed
//! - Reuse of a live connection and replacement of a broken one

use std::sync::Arc;

use mqb_broker::memory::InMemoryBroker;
use mqb_broker::reason;
use mqb_common::{ConnectorDefinition, ReplyMode};
use mqb_config::PoolDefaults;
use mqb_connector::{
    AuditLevel, ConnectorError, EndpointConfig, PoolParameters, ReconnectingClient,
    RecordingAuditSink,
};

fn broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new("QM1");
    broker.define_queue("REQ").define_queue("REPLY");
    broker
}

fn definition() -> ConnectorDefinition {
    ConnectorDefinition {
        id: "orders".to_string(),
        name: "Orders".to_string(),
        queue_manager_name: "QM1".to_string(),
        target_queue: "REQ".to_string(),
        inbound: true,
        ..Default::default()
    }
}

fn client(
    broker: &InMemoryBroker,
    definition: ConnectorDefinition,
    audit: Arc<RecordingAuditSink>,
) -> ReconnectingClient {
    let endpoint = EndpointConfig::from_definition(
        &definition,
        None,
        PoolParameters::from(&PoolDefaults::default()),
        1024,
    )
    .unwrap();
    ReconnectingClient::new(Arc::new(endpoint), Arc::new(broker.clone()), audit)
}

/// Names of the queues held by the client's connection.
async fn queue_names(
    client: &ReconnectingClient,
    reconnect_allowed: bool,
) -> mqb_connector::Result<(String, Option<String>)> {
    client
        .do_work(reconnect_allowed, |bag| {
            Box::pin(async move {
                Ok((
                    bag.target().name().to_string(),
                    bag.reply().map(|q| q.name().to_string()),
                ))
            })
        })
        .await
}

fn error_notifications(audit: &RecordingAuditSink) -> usize {
    audit
        .records()
        .iter()
        .filter(|r| r.level == AuditLevel::Error && r.message == "Connection error")
        .count()
}

#[tokio::test]
async fn test_failed_reply_open_closes_session() {
    let broker = broker();
    let audit = Arc::new(RecordingAuditSink::new());
    let mut def = definition();
    def.reply_mode = ReplyMode::SpecifiedQueue;
    def.reply_queue_name = Some("MISSING".to_string());
    let client = client(&broker, def, audit.clone());

    let result = queue_names(&client, true).await;

    assert!(matches!(
        result,
        Err(ConnectorError::ConnectionUnavailable(ref e)) if e.reason == reason::UNKNOWN_OBJECT_NAME
    ));
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(broker.active_sessions(), 0);
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_repeated_connect_failures_notify_once() {
    let broker = broker();
    let audit = Arc::new(RecordingAuditSink::new());
    let mut def = definition();
    def.reply_mode = ReplyMode::SpecifiedQueue;
    def.reply_queue_name = Some("MISSING".to_string());
    let client = client(&broker, def, audit.clone());

    assert!(queue_names(&client, true).await.is_err());
    assert!(queue_names(&client, true).await.is_err());

    assert_eq!(broker.connect_count(), 2);
    assert_eq!(broker.active_sessions(), 0);
    assert_eq!(error_notifications(&audit), 1);
}

#[tokio::test]
async fn test_no_connection_without_reconnect_is_lost() {
    let broker = broker();
    let audit = Arc::new(RecordingAuditSink::new());
    let client = client(&broker, definition(), audit.clone());

    let result = queue_names(&client, false).await;

    assert!(matches!(result, Err(ConnectorError::ConnectionLost)));
    assert_eq!(broker.connect_attempts(), 0);
    assert!(audit.records().is_empty());
}

#[tokio::test]
async fn test_live_connection_is_reused() {
    let broker = broker();
    let audit = Arc::new(RecordingAuditSink::new());
    let mut def = definition();
    def.reply_mode = ReplyMode::SpecifiedQueue;
    def.reply_queue_name = Some("REPLY".to_string());
    let client = client(&broker, def, audit.clone());

    let names = tokio_test::assert_ok!(queue_names(&client, true).await);
    assert_eq!(names, ("REQ".to_string(), Some("REPLY".to_string())));
    tokio_test::assert_ok!(queue_names(&client, false).await);

    assert_eq!(broker.connect_count(), 1);
    assert_eq!(broker.active_sessions(), 1);
    assert!(client.is_connected().await);
    assert_eq!(audit.count(AuditLevel::Info), 1);

    client.close().await;
    assert_eq!(broker.active_sessions(), 0);
}

#[tokio::test]
async fn test_broken_connection_is_replaced_only_when_allowed() {
    let broker = broker();
    let audit = Arc::new(RecordingAuditSink::new());
    let client = client(&broker, definition(), audit.clone());

    tokio_test::assert_ok!(queue_names(&client, true).await);
    broker.break_connections();
    assert!(!client.is_connected().await);

    let result = queue_names(&client, false).await;
    assert!(matches!(result, Err(ConnectorError::ConnectionLost)));
    assert_eq!(broker.connect_count(), 1);

    tokio_test::assert_ok!(queue_names(&client, true).await);
    assert_eq!(broker.connect_count(), 2);
    assert_eq!(broker.active_sessions(), 1);
    assert!(client.is_connected().await);
}
