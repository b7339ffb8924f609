//! OutboundRoutingDriver Tests
//!
//! Tests for:
//! - Automatic (model queue) and specified reply queues
//! - Retry before transfer, no retry after
//! - Failure pressure short-circuit
//! - Warning completion codes
//! - Request and response size limits
//! - Transactional gets and the failure queue
//! - Endpoint rebuild on connector change

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mqb_broker::memory::InMemoryBroker;
use mqb_broker::{completion, reason, BrokerMessage};
use mqb_common::{AcknowledgementMode, ConnectorDefinition, ReplyMode};
use mqb_config::{CacheSettings, RoutingSettings};
use mqb_connector::outbound::{Direction, COMPLETION_CODE_VARIABLE, REASON_CODE_VARIABLE};
use mqb_connector::{
    ConnectionResourceManager, InMemoryConnectorSource, OutboundRequest, OutboundRoutingDriver,
    OutboundServices, PropertyMap, RouteDefinition, RoutingStatus, StaticCredentialStore,
};
use tokio::task::JoinHandle;

struct Harness {
    broker: InMemoryBroker,
    source: Arc<InMemoryConnectorSource>,
    services: Arc<OutboundServices>,
}

fn definition() -> ConnectorDefinition {
    ConnectorDefinition {
        id: "billing".to_string(),
        name: "Billing".to_string(),
        queue_manager_name: "QM1".to_string(),
        target_queue: "REQ".to_string(),
        reply_model_queue_name: Some("MODEL".to_string()),
        ..Default::default()
    }
}

fn harness_with(definition: ConnectorDefinition, settings: RoutingSettings) -> Harness {
    let broker = InMemoryBroker::new("QM1");
    broker
        .define_queue("REQ")
        .define_queue("REQ2")
        .define_queue("REPLY")
        .define_queue("FAIL")
        .define_queue("ORDERS.EU")
        .define_model_queue("MODEL");

    let properties = Arc::new(PropertyMap::default());
    let resources = Arc::new(ConnectionResourceManager::new(
        Arc::new(broker.clone()),
        properties.clone(),
        CacheSettings::default(),
    ));
    let source = Arc::new(InMemoryConnectorSource::new(vec![definition]));
    let services = Arc::new(OutboundServices::new(
        resources,
        source.clone(),
        Arc::new(StaticCredentialStore::new(BTreeMap::new())),
        properties,
        settings,
    ));

    Harness {
        broker,
        source,
        services,
    }
}

fn harness(definition: ConnectorDefinition) -> Harness {
    harness_with(definition, RoutingSettings::default())
}

/// Answers one request on REQ, replying to its reply-to queue.
fn responder(broker: &InMemoryBroker, payload: &'static str, copy_correlation: bool) -> JoinHandle<BrokerMessage> {
    let broker = broker.clone();
    tokio::spawn(async move {
        let request = broker
            .receive("REQ", Duration::from_secs(5))
            .await
            .expect("request should arrive");
        let mut reply = BrokerMessage::text(payload);
        reply.correlation_id = if copy_correlation {
            request.correlation_id
        } else {
            request.message_id
        };
        broker.put_message(&request.reply_to_queue, reply).unwrap();
        request
    })
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

#[tokio::test]
async fn test_automatic_reply_through_model_queue() {
    let h = harness(definition());
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", true));
    let answer = responder(&h.broker, "pong", false);

    let outcome = driver.route(&OutboundRequest::new("ping")).await;
    let request = answer.await.unwrap();

    let vars = outcome.output_variables();
    assert_eq!(vars[COMPLETION_CODE_VARIABLE], "0");
    assert_eq!(vars[REASON_CODE_VARIABLE], "0");

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(outcome.completion_code, completion::OK);
    assert_eq!(text(&outcome.response.unwrap().payload), "pong");
    assert!(request.reply_to_queue.starts_with("MODEL."));
    assert_eq!(request.reply_to_queue_manager, "QM1");
    assert_eq!(text(&request.data), "ping");

    // the temporary reply queue is gone once the exchange closes it
    assert!(!h.broker.queue_exists(&request.reply_to_queue));
}

#[tokio::test]
async fn test_specified_reply_queue_uses_message_id_selector() {
    let mut def = definition();
    def.reply_mode = ReplyMode::SpecifiedQueue;
    def.reply_queue_name = Some("REPLY".to_string());
    let h = harness(def);

    // a reply for some other request is already waiting
    h.broker.put_message("REPLY", BrokerMessage::text("stray")).unwrap();

    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", true));
    let answer = responder(&h.broker, "pong", false);
    let outcome = driver.route(&OutboundRequest::new("ping")).await;
    let request = answer.await.unwrap();

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(text(&outcome.response.unwrap().payload), "pong");
    assert_eq!(request.reply_to_queue, "REPLY");
    assert_eq!(h.broker.depth("REPLY"), 1);
    assert_eq!(text(&h.broker.browse("REPLY")[0].data), "stray");
}

#[tokio::test]
async fn test_copy_correlation_id_generates_and_matches_correlation() {
    let mut def = definition();
    def.reply_mode = ReplyMode::SpecifiedQueue;
    def.reply_queue_name = Some("REPLY".to_string());
    def.copy_correlation_id = true;
    let h = harness(def);

    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", true));
    let answer = responder(&h.broker, "pong", true);
    let outcome = driver.route(&OutboundRequest::new("ping")).await;
    let request = answer.await.unwrap();

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert!(request.has_correlation_id());
    assert_eq!(outcome.response.unwrap().message.correlation_id, request.correlation_id);
}

#[tokio::test]
async fn test_no_reply_within_timeout_fails() {
    let h = harness(definition());
    let mut route = RouteDefinition::put("billing", true);
    route.response_timeout = Some(Duration::from_millis(100));
    let driver = OutboundRoutingDriver::start(h.services.clone(), route);

    let outcome = driver.route(&OutboundRequest::new("ping")).await;

    assert_eq!(outcome.status, RoutingStatus::Failed);
    assert_eq!(outcome.reason_code, reason::NO_MSG_AVAILABLE);
    // sent exactly once
    assert_eq!(h.broker.depth("REQ"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_fault_before_put_retries_five_times() {
    let h = harness(definition());
    h.broker.set_available(false);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", false));

    let started = tokio::time::Instant::now();
    let outcome = driver.route(&OutboundRequest::new("ping")).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, RoutingStatus::ServerError);
    assert_eq!(outcome.completion_code, completion::FAILED);
    assert_eq!(outcome.reason_code, reason::Q_MGR_NOT_AVAILABLE);
    assert_eq!(h.broker.connect_attempts(), 5);
    assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    assert_eq!(h.services.failure_pressure.current(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_connect_failures() {
    let h = harness(definition());
    h.broker.fail_next_connects(2);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", false));

    let outcome = driver.route(&OutboundRequest::new("ping")).await;

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(h.broker.connect_attempts(), 3);
    assert_eq!(h.broker.depth("REQ"), 1);
}

#[tokio::test]
async fn test_transport_fault_after_put_is_not_retried() {
    let mut def = definition();
    def.reply_mode = ReplyMode::SpecifiedQueue;
    def.reply_queue_name = Some("REPLY".to_string());
    let h = harness(def);
    h.broker.fail_next_gets(1);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", true));

    let outcome = driver.route(&OutboundRequest::new("ping")).await;

    assert_eq!(outcome.status, RoutingStatus::ServerError);
    assert_eq!(outcome.reason_code, reason::CONNECTION_BROKEN);
    assert_eq!(h.broker.depth("REQ"), 1);
    assert_eq!(h.broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_failure_pressure_short_circuits() {
    let settings = RoutingSettings {
        failure_threshold: 1,
        ..Default::default()
    };
    let h = harness_with(definition(), settings);
    h.broker.set_available(false);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", false));

    let outcome = driver.route(&OutboundRequest::new("ping")).await;

    assert_eq!(outcome.status, RoutingStatus::Falsified);
    assert_eq!(h.broker.connect_attempts(), 1);
    assert_eq!(h.services.failure_pressure.current(), 0);
}

#[tokio::test]
async fn test_warning_completion_is_routed_with_codes() {
    let h = harness(definition());
    h.broker.warn_next_puts(1);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", false));

    let outcome = driver.route(&OutboundRequest::new("ping")).await;

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(outcome.completion_code, completion::WARNING);
    assert_eq!(outcome.reason_code, reason::PRIORITY_EXCEEDS_MAXIMUM);
    assert_eq!(h.broker.depth("REQ"), 1);
}

#[tokio::test]
async fn test_request_too_large_is_bad_request() {
    let mut def = definition();
    def.request_size_limit = Some(4);
    let h = harness(def);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", false));

    let outcome = driver.route(&OutboundRequest::new("far too large")).await;

    assert_eq!(outcome.status, RoutingStatus::BadRequest);
    assert_eq!(h.broker.connect_attempts(), 0);
    assert_eq!(h.broker.depth("REQ"), 0);
}

#[tokio::test]
async fn test_response_too_large_fails_without_payload() {
    let h = harness(definition());
    let mut route = RouteDefinition::put("billing", true);
    route.response_size_limit = Some(3);
    let driver = OutboundRoutingDriver::start(h.services.clone(), route);
    let answer = responder(&h.broker, "pong", false);

    let outcome = driver.route(&OutboundRequest::new("ping")).await;
    answer.await.unwrap();

    assert_eq!(outcome.status, RoutingStatus::Failed);
    assert_eq!(outcome.reason_code, reason::TRUNCATED_MSG_FAILED);
    assert!(outcome.response.is_none());
}

#[tokio::test]
async fn test_zero_request_limit_is_unlimited() {
    let mut def = definition();
    def.request_size_limit = Some(0);
    let h = harness(def);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", false));

    let outcome = driver.route(&OutboundRequest::new("no limit applies")).await;

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(text(&h.broker.browse("REQ")[0].data), "no limit applies");
}

#[tokio::test]
async fn test_zero_response_limit_is_unlimited() {
    let h = harness(definition());
    let mut route = RouteDefinition::put("billing", true);
    route.response_size_limit = Some(0);
    let driver = OutboundRoutingDriver::start(h.services.clone(), route);
    let answer = responder(&h.broker, "a long reply", false);

    let outcome = driver.route(&OutboundRequest::new("ping")).await;
    answer.await.unwrap();

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(text(&outcome.response.unwrap().payload), "a long reply");
}

#[tokio::test]
async fn test_predefined_reply_model_is_configuration_fault() {
    let mut def = definition();
    def.reply_model_queue_name = Some("REPLY".to_string());
    let h = harness(def);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", true));

    let outcome = driver.route(&OutboundRequest::new("ping")).await;

    assert_eq!(outcome.status, RoutingStatus::Failed);
    assert_eq!(h.broker.connect_attempts(), 1);
    assert_eq!(h.broker.depth("REQ"), 0);
}

#[tokio::test]
async fn test_transactional_put_commits() {
    let mut def = definition();
    def.acknowledgement_mode = AcknowledgementMode::OnCompletion;
    let h = harness(def);
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", false));

    let outcome = driver.route(&OutboundRequest::new("ping")).await;

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(h.broker.depth("REQ"), 1);
}

#[tokio::test]
async fn test_get_returns_message() {
    let h = harness(definition());
    h.broker.put_message("REQ", BrokerMessage::text("data")).unwrap();
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::get("billing"));

    let outcome = driver.route(&OutboundRequest::default()).await;

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(text(&outcome.response.unwrap().payload), "data");
    assert_eq!(h.broker.depth("REQ"), 0);
    assert_eq!(driver.route_definition().direction, Direction::Get);
}

#[tokio::test]
async fn test_transactional_get_failure_moves_to_failure_queue() {
    let mut def = definition();
    def.acknowledgement_mode = AcknowledgementMode::OnCompletion;
    def.failure_queue_name = Some("FAIL".to_string());
    let h = harness(def);
    h.broker.put_message("REQ", BrokerMessage::text("oversized")).unwrap();

    let mut route = RouteDefinition::get("billing");
    route.response_size_limit = Some(2);
    let driver = OutboundRoutingDriver::start(h.services.clone(), route);

    let outcome = driver.route(&OutboundRequest::default()).await;

    assert_eq!(outcome.status, RoutingStatus::Failed);
    assert_eq!(h.broker.depth("REQ"), 0);
    assert_eq!(h.broker.depth("FAIL"), 1);
}

#[tokio::test]
async fn test_transactional_get_failure_without_failure_queue_backs_out() {
    let mut def = definition();
    def.acknowledgement_mode = AcknowledgementMode::OnCompletion;
    let h = harness(def);
    h.broker.put_message("REQ", BrokerMessage::text("oversized")).unwrap();

    let mut route = RouteDefinition::get("billing");
    route.response_size_limit = Some(2);
    let driver = OutboundRoutingDriver::start(h.services.clone(), route);

    let outcome = driver.route(&OutboundRequest::default()).await;

    assert_eq!(outcome.status, RoutingStatus::Failed);
    assert_eq!(h.broker.depth("REQ"), 1);
    assert_eq!(h.broker.browse("REQ")[0].backout_count, 1);
}

#[tokio::test]
async fn test_dynamic_queue_template() {
    let h = harness(definition());
    let mut route = RouteDefinition::put("billing", false);
    route.queue_template = Some("ORDERS.${region}".to_string());
    let driver = OutboundRoutingDriver::start(h.services.clone(), route);

    let mut request = OutboundRequest::new("ping");
    request.variables.insert("region".to_string(), "EU".to_string());
    let outcome = driver.route(&request).await;

    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(h.broker.depth("ORDERS.EU"), 1);
    assert_eq!(h.broker.depth("REQ"), 0);

    // a missing variable is a configuration fault
    let outcome = driver.route(&OutboundRequest::new("ping")).await;
    assert_eq!(outcome.status, RoutingStatus::Failed);
}

#[tokio::test]
async fn test_connector_change_rebuilds_endpoint() {
    let h = harness(definition());
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("billing", false));

    driver.route(&OutboundRequest::new("one")).await;
    assert_eq!(h.broker.depth("REQ"), 1);

    let mut def = definition();
    def.target_queue = "REQ2".to_string();
    h.source.upsert(def);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = driver.route(&OutboundRequest::new("two")).await;
    assert_eq!(outcome.status, RoutingStatus::Routed);
    assert_eq!(h.broker.depth("REQ2"), 1);
    assert_eq!(h.broker.depth("REQ"), 1);
}

#[tokio::test]
async fn test_unknown_connector_fails() {
    let h = harness(definition());
    let driver = OutboundRoutingDriver::start(h.services.clone(), RouteDefinition::put("missing", false));

    let outcome = driver.route(&OutboundRequest::new("ping")).await;
    assert_eq!(outcome.status, RoutingStatus::Failed);
    assert!(outcome.error.unwrap().contains("not found"));
}
