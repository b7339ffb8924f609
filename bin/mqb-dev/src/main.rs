//! mqbridge Development Binary
//!
//! Runs the connector stack against an in-memory queue manager:
//!
//! - Inbound listeners for every enabled inbound connector, answering with
//!   an echo processor
//! - An optional demo that routes requests through the outbound driver to the
//!   first inbound connector and logs the echoed replies
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MQBRIDGE_CONFIG` | - | Path to the TOML configuration file |
//! | `MQBRIDGE_DEMO_REQUESTS` | `0` | Requests sent by the demo after startup |
//! | `MQBRIDGE_DEMO_RFH2` | `false` | Wrap demo requests in an RFH2 header |
//! | `LOG_FORMAT` | `text` | `json` for JSON logs |
//! | `RUST_LOG` | `info` | Log level |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use mqb_broker::framing::Rfh2Header;
use mqb_broker::memory::InMemoryBroker;
use mqb_common::ConnectorDefinition;
use mqb_config::{AppConfig, ConfigLoader};
use mqb_connector::{
    ConnectionResourceManager, ConnectorSource, EchoProcessor, InMemoryConnectorSource,
    InboundModule, InboundServices, OutboundRequest, OutboundRoutingDriver, OutboundServices,
    PropertyMap, RouteDefinition, StaticCredentialStore, TracingAuditSink,
};

#[derive(Parser, Debug)]
#[command(name = "mqb-dev")]
#[command(about = "mqbridge Development Binary - connectors against an in-memory queue manager")]
struct Args {
    /// Configuration file
    #[arg(long, env = "MQBRIDGE_CONFIG")]
    config: Option<String>,

    /// Requests routed to the first inbound connector after startup
    #[arg(long, env = "MQBRIDGE_DEMO_REQUESTS", default_value = "0")]
    demo_requests: u32,

    /// Wrap demo requests in an RFH2 header
    #[arg(long, env = "MQBRIDGE_DEMO_RFH2", default_value = "false")]
    demo_rfh2: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    mqb_common::logging::init_logging("mqb-dev");

    info!("Starting mqbridge development binary");

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("loading configuration")?;
    if config.connectors.is_empty() {
        config.connectors.push(default_connector(&config));
        info!("No connectors configured, using the built-in echo connector");
    }

    let broker = build_broker(&config);
    let source = Arc::new(InMemoryConnectorSource::new(config.connectors.clone()));
    let credentials = Arc::new(StaticCredentialStore::new(config.credentials.clone()));
    let properties = Arc::new(PropertyMap::new(config.properties.clone()));
    let audit = Arc::new(TracingAuditSink);

    // Connection cache for outbound routes
    let resources = Arc::new(ConnectionResourceManager::new(
        Arc::new(broker.clone()),
        properties.clone(),
        config.cache.clone(),
    ));
    resources.start(source.subscribe());

    // Inbound listeners
    let inbound = Arc::new(InboundModule::new(
        InboundServices {
            connector: Arc::new(broker.clone()),
            source: source.clone(),
            credentials: credentials.clone(),
            properties: properties.clone(),
            processor: Arc::new(EchoProcessor),
            audit,
        },
        config.listener.clone(),
        config.routing.clone(),
    ));
    let started = inbound.start().await.context("starting inbound listeners")?;
    info!(listeners = started, "Inbound module started");

    let outbound = Arc::new(OutboundServices::new(
        resources.clone(),
        source.clone(),
        credentials,
        properties,
        config.routing.clone(),
    ));

    if args.demo_requests > 0 {
        match first_inbound(&config) {
            Some(connector) => {
                run_demo(outbound, &connector.id, args.demo_requests, args.demo_rfh2).await;
            }
            None => warn!("Demo requested but no enabled inbound connector is configured"),
        }
    }

    info!("mqbridge development binary started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    inbound.stop().await;
    resources.shutdown().await;

    info!(
        active_sessions = broker.active_sessions(),
        "mqbridge development binary shutdown complete"
    );
    Ok(())
}

fn build_broker(config: &AppConfig) -> InMemoryBroker {
    let broker = InMemoryBroker::new(config.broker.queue_manager_name.clone());
    for queue in &config.broker.queues {
        broker.define_queue(queue);
    }
    for model in &config.broker.model_queues {
        broker.define_model_queue(model);
    }

    // Every queue a connector names must exist on the in-memory broker.
    for connector in &config.connectors {
        let names = std::iter::once(&connector.target_queue)
            .chain(connector.reply_queue_name.iter())
            .chain(connector.failure_queue_name.iter());
        for name in names {
            if !name.is_empty() && !broker.queue_exists(name) {
                broker.define_queue(name);
            }
        }
        if let Some(model) = &connector.reply_model_queue_name {
            if !broker.queue_exists(model) {
                broker.define_model_queue(model);
            }
        }
    }

    info!(
        queue_manager = %config.broker.queue_manager_name,
        queues = config.broker.queues.len(),
        model_queues = config.broker.model_queues.len(),
        "In-memory broker ready"
    );
    broker
}

fn default_connector(config: &AppConfig) -> ConnectorDefinition {
    ConnectorDefinition {
        id: "dev-echo".to_string(),
        name: "Development echo".to_string(),
        inbound: true,
        queue_manager_name: config.broker.queue_manager_name.clone(),
        target_queue: config
            .broker
            .queues
            .first()
            .cloned()
            .unwrap_or_else(|| "DEV.REQUEST".to_string()),
        ..Default::default()
    }
}

fn first_inbound(config: &AppConfig) -> Option<&ConnectorDefinition> {
    config.connectors.iter().find(|c| c.wants_listeners())
}

/// Route requests to an inbound connector and log the echoed replies.
async fn run_demo(services: Arc<OutboundServices>, connector_id: &str, count: u32, rfh2: bool) {
    let driver = OutboundRoutingDriver::start(services, RouteDefinition::put(connector_id, true));

    for i in 1..=count {
        let mut request = OutboundRequest::new(format!("<ping seq=\"{}\"/>", i));
        if rfh2 {
            let header = Rfh2Header::default()
                .with_folder(format!("<usr><seq>{}</seq></usr>", i));
            request.header = Some(header.encode());
        }

        let outcome = driver.route(&request).await;
        match &outcome.response {
            Some(response) if outcome.is_routed() => {
                info!(
                    seq = i,
                    has_header = response.header.is_some(),
                    payload = %String::from_utf8_lossy(&response.payload),
                    "Demo reply received"
                );
            }
            _ => {
                error!(
                    seq = i,
                    status = ?outcome.status,
                    completion_code = outcome.completion_code,
                    reason_code = outcome.reason_code,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "Demo request failed"
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
