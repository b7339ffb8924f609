//! InboundModule Tests
//!
//! Tests for:
//! - Reply modes and correlation
//! - Acknowledge on take vs on completion
//! - Failure queue routing and backout
//! - Oversized and faulted requests
//! - Listener lifecycle on connector changes

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mqb_broker::memory::InMemoryBroker;
use mqb_broker::message::{format, generate_id};
use mqb_broker::BrokerMessage;
use mqb_common::{AcknowledgementMode, ConnectorDefinition, ReplyMode};
use mqb_config::{ListenerSettings, RoutingSettings};
use mqb_connector::processor::{
    InboundRequest, ProcessedResponse, ProcessingFault, ProcessingResult,
};
use mqb_connector::{
    EchoProcessor, InMemoryConnectorSource, InboundModule, InboundServices, MessageProcessor,
    PropertyMap, RecordingAuditSink, StaticCredentialStore,
};

#[derive(Clone, Copy)]
enum Behaviour {
    Echo,
    FailWithResponse,
    Fault,
}

/// Counts calls and answers according to its behaviour.
struct MockProcessor {
    behaviour: Behaviour,
    calls: AtomicU32,
}

impl MockProcessor {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageProcessor for MockProcessor {
    async fn process(&self, request: InboundRequest) -> Result<ProcessingResult, ProcessingFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Echo => EchoProcessor.process(request).await,
            Behaviour::FailWithResponse => Ok(ProcessingResult::failed(Some(ProcessedResponse::new(
                "rejected",
            )))),
            Behaviour::Fault => Err(ProcessingFault("downstream unavailable".to_string())),
        }
    }
}

struct Harness {
    broker: InMemoryBroker,
    source: Arc<InMemoryConnectorSource>,
    processor: Arc<MockProcessor>,
    module: Arc<InboundModule>,
}

fn definition() -> ConnectorDefinition {
    ConnectorDefinition {
        id: "orders".to_string(),
        name: "Orders".to_string(),
        inbound: true,
        queue_manager_name: "QM1".to_string(),
        target_queue: "REQ".to_string(),
        ..Default::default()
    }
}

fn harness_with(
    definitions: Vec<ConnectorDefinition>,
    behaviour: Behaviour,
    listener_settings: ListenerSettings,
) -> Harness {
    let broker = InMemoryBroker::new("QM1");
    broker
        .define_queue("REQ")
        .define_queue("REPLY")
        .define_queue("CLIENT.REPLY")
        .define_queue("FAIL");

    let source = Arc::new(InMemoryConnectorSource::new(definitions));
    let processor = Arc::new(MockProcessor::new(behaviour));
    let services = InboundServices {
        connector: Arc::new(broker.clone()),
        source: source.clone(),
        credentials: Arc::new(StaticCredentialStore::new(BTreeMap::new())),
        properties: Arc::new(PropertyMap::default()),
        processor: processor.clone(),
        audit: Arc::new(RecordingAuditSink::new()),
    };
    let module = Arc::new(InboundModule::new(services, listener_settings, RoutingSettings::default()));

    Harness {
        broker,
        source,
        processor,
        module,
    }
}

fn harness(definition: ConnectorDefinition, behaviour: Behaviour) -> Harness {
    harness_with(vec![definition], behaviour, fast_listeners())
}

fn fast_listeners() -> ListenerSettings {
    ListenerSettings {
        poll_interval_ms: 50,
        retry_delay_ms: 100,
        ..Default::default()
    }
}

fn request(text: &str) -> BrokerMessage {
    let mut message = BrokerMessage::text(text);
    message.reply_to_queue = "CLIENT.REPLY".to_string();
    message
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn text(message: &BrokerMessage) -> String {
    String::from_utf8_lossy(&message.data).to_string()
}

#[tokio::test]
async fn test_automatic_reply_to_reply_to_queue() {
    let h = harness(definition(), Behaviour::Echo);
    let request_id = h.broker.put_message("REQ", request("hello")).unwrap();

    assert_eq!(h.module.start().await.unwrap(), 1);
    assert!(eventually(|| h.broker.depth("CLIENT.REPLY") == 1).await);

    let reply = &h.broker.browse("CLIENT.REPLY")[0];
    assert_eq!(text(reply), "hello");
    assert_eq!(reply.correlation_id, request_id);
    assert_eq!(reply.format, format::STRING);
    assert_ne!(reply.message_id, request_id);
    assert_eq!(h.broker.depth("REQ"), 0);

    h.module.stop().await;
}

#[tokio::test]
async fn test_copy_correlation_id() {
    let mut def = definition();
    def.copy_correlation_id = true;
    let h = harness(def, Behaviour::Echo);

    let correlation = generate_id();
    let mut message = request("hello");
    message.correlation_id = correlation;
    h.broker.put_message("REQ", message).unwrap();

    h.module.start().await.unwrap();
    assert!(eventually(|| h.broker.depth("CLIENT.REPLY") == 1).await);
    assert_eq!(h.broker.browse("CLIENT.REPLY")[0].correlation_id, correlation);

    h.module.stop().await;
}

#[tokio::test]
async fn test_specified_reply_queue() {
    let mut def = definition();
    def.reply_mode = ReplyMode::SpecifiedQueue;
    def.reply_queue_name = Some("REPLY".to_string());
    let mut overrides = BTreeMap::new();
    overrides.insert("property.source".to_string(), "mqbridge".to_string());
    def.message_overrides = overrides;
    let h = harness(def, Behaviour::Echo);

    h.broker.put_message("REQ", request("hello")).unwrap();
    h.module.start().await.unwrap();

    assert!(eventually(|| h.broker.depth("REPLY") == 1).await);
    let reply = &h.broker.browse("REPLY")[0];
    assert_eq!(text(reply), "hello");
    assert_eq!(reply.properties.get("source").map(String::as_str), Some("mqbridge"));
    assert_eq!(h.broker.depth("CLIENT.REPLY"), 0);

    h.module.stop().await;
}

#[tokio::test]
async fn test_no_reply_mode_sends_nothing() {
    let mut def = definition();
    def.reply_mode = ReplyMode::None;
    let h = harness(def, Behaviour::Echo);

    h.broker.put_message("REQ", request("hello")).unwrap();
    h.module.start().await.unwrap();

    assert!(eventually(|| h.processor.calls() == 1).await);
    assert!(eventually(|| h.broker.depth("REQ") == 0).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.broker.depth("CLIENT.REPLY"), 0);

    h.module.stop().await;
}

#[tokio::test]
async fn test_missing_reply_to_is_not_an_error() {
    let h = harness(definition(), Behaviour::Echo);
    h.broker.put_message("REQ", BrokerMessage::text("hello")).unwrap();
    h.module.start().await.unwrap();

    assert!(eventually(|| h.processor.calls() == 1).await);
    assert!(eventually(|| h.broker.depth("REQ") == 0).await);
    assert_eq!(h.broker.connect_count(), 1);

    h.module.stop().await;
}

#[tokio::test]
async fn test_transactional_success_commits_reply() {
    let mut def = definition();
    def.acknowledgement_mode = AcknowledgementMode::OnCompletion;
    let h = harness(def, Behaviour::Echo);

    h.broker.put_message("REQ", request("hello")).unwrap();
    h.module.start().await.unwrap();

    assert!(eventually(|| h.broker.depth("CLIENT.REPLY") == 1).await);
    assert_eq!(h.broker.depth("REQ"), 0);
    assert_eq!(h.processor.calls(), 1);

    h.module.stop().await;
}

#[tokio::test]
async fn test_transactional_failure_goes_to_failure_queue() {
    let mut def = definition();
    def.acknowledgement_mode = AcknowledgementMode::OnCompletion;
    def.failure_queue_name = Some("FAIL".to_string());
    let h = harness(def, Behaviour::FailWithResponse);

    let request_id = h.broker.put_message("REQ", request("hello")).unwrap();
    h.module.start().await.unwrap();

    assert!(eventually(|| h.broker.depth("FAIL") == 1).await);
    assert_eq!(h.broker.browse("FAIL")[0].message_id, request_id);
    assert_eq!(text(&h.broker.browse("CLIENT.REPLY")[0]), "rejected");
    assert_eq!(h.broker.depth("REQ"), 0);
    assert_eq!(h.processor.calls(), 1);

    h.module.stop().await;
}

#[tokio::test]
async fn test_transactional_failure_without_failure_queue_backs_out() {
    let mut def = definition();
    def.acknowledgement_mode = AcknowledgementMode::OnCompletion;
    let h = harness(def, Behaviour::FailWithResponse);

    h.broker.put_message("REQ", request("hello")).unwrap();
    h.module.start().await.unwrap();

    // backed out and redelivered
    assert!(eventually(|| h.processor.calls() >= 2).await);
    h.module.stop().await;

    assert_eq!(h.broker.depth("REQ"), 1);
    assert!(h.broker.browse("REQ")[0].backout_count >= 1);
    // the reply was put under the same unit of work and rolled back
    assert_eq!(h.broker.depth("CLIENT.REPLY"), 0);
}

#[tokio::test]
async fn test_oversized_request_gets_fault_without_processing() {
    let mut def = definition();
    def.request_size_limit = Some(4);
    let h = harness(def, Behaviour::Echo);

    h.broker.put_message("REQ", request("far too large")).unwrap();
    h.module.start().await.unwrap();

    assert!(eventually(|| h.broker.depth("CLIENT.REPLY") == 1).await);
    assert!(text(&h.broker.browse("CLIENT.REPLY")[0]).contains("Message too large"));
    assert_eq!(h.processor.calls(), 0);

    h.module.stop().await;
}

#[tokio::test]
async fn test_zero_size_limit_accepts_any_request() {
    let mut def = definition();
    def.request_size_limit = Some(0);
    let h = harness(def, Behaviour::Echo);

    h.broker.put_message("REQ", request("a request of any length")).unwrap();
    h.module.start().await.unwrap();

    assert!(eventually(|| h.broker.depth("CLIENT.REPLY") == 1).await);
    assert_eq!(text(&h.broker.browse("CLIENT.REPLY")[0]), "a request of any length");
    assert_eq!(h.processor.calls(), 1);

    h.module.stop().await;
}

#[tokio::test]
async fn test_processing_fault_becomes_fault_reply() {
    let h = harness(definition(), Behaviour::Fault);

    h.broker.put_message("REQ", request("hello")).unwrap();
    h.module.start().await.unwrap();

    assert!(eventually(|| h.broker.depth("CLIENT.REPLY") == 1).await);
    let reply = text(&h.broker.browse("CLIENT.REPLY")[0]);
    assert!(reply.contains("<faultstring>downstream unavailable</faultstring>"));

    h.module.stop().await;
}

#[tokio::test]
async fn test_connector_change_restarts_and_stops_listeners() {
    let h = harness(definition(), Behaviour::Echo);
    h.module.start().await.unwrap();
    assert_eq!(h.module.listener_count_for("orders").await, 1);

    let mut def = definition();
    def.concurrent_listeners = 3;
    h.source.upsert(def.clone());
    let mut restarted = false;
    for _ in 0..300 {
        if h.module.listener_count_for("orders").await == 3 {
            restarted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(restarted);

    def.enabled = false;
    h.source.upsert(def);
    let mut stopped = false;
    for _ in 0..300 {
        if h.module.listener_count().await == 0 {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped);

    h.module.stop().await;
    assert!(eventually(|| h.broker.active_sessions() == 0).await);
}

#[tokio::test]
async fn test_listener_ceiling() {
    let mut def = definition();
    def.concurrent_listeners = 5;
    let settings = ListenerSettings {
        max_listeners: 3,
        ..fast_listeners()
    };
    let h = harness_with(vec![def], Behaviour::Echo, settings);

    assert_eq!(h.module.start().await.unwrap(), 3);
    assert_eq!(h.module.listener_count().await, 3);

    h.module.stop().await;
    assert_eq!(h.module.listener_count().await, 0);
}

#[tokio::test]
async fn test_outbound_only_connector_gets_no_listeners() {
    let mut def = definition();
    def.inbound = false;
    let h = harness(def, Behaviour::Echo);

    assert_eq!(h.module.start().await.unwrap(), 0);
    h.module.stop().await;
}
