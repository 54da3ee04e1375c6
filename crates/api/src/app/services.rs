//! Infrastructure wiring for the HTTP server.
//!
//! With `DATABASE_URL` set, event streams and webhook logs live in Postgres;
//! otherwise both are kept in memory and lost on restart. Every committed
//! event is also written to the audit log by a background subscriber.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value as JsonValue;

use podledger_events::{EventBus, EventEnvelope, InMemoryEventBus};
use podledger_infra::command_dispatcher::CommandDispatcher;
use podledger_infra::config::AppConfig;
use podledger_infra::event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use podledger_infra::external::{
    HostedCheckoutGateway, InMemoryDiscountCatalog, InMemoryNotifier, StaticShipmentTracker,
};
use podledger_infra::services::{Collaborators, Services};
use podledger_infra::postgres;
use podledger_infra::webhook::{
    InMemoryWebhookLogStore, PostgresWebhookLogStore, WebhookLogStore,
};
use podledger_invoicing::DiscountCode;

pub type AppBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub type AppStore = Arc<dyn EventStore>;
pub type AppServices = Services<AppStore, AppBus>;

/// Wire the services. Must run inside a multi-threaded tokio runtime when a
/// database is configured.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let (store, webhook_logs) = build_stores(config).await?;

    let bus: AppBus = Arc::new(InMemoryEventBus::new());
    spawn_audit_log(&bus);

    let dispatcher = Arc::new(CommandDispatcher::new(store, bus));

    let discounts = Arc::new(InMemoryDiscountCatalog::new());
    discounts.insert(DiscountCode::percentage("SAVE10", 10, 100_000));

    let collaborators = Collaborators {
        shipments: Arc::new(StaticShipmentTracker::new()),
        notifier: Arc::new(InMemoryNotifier::new()),
        discounts,
        gateway: Arc::new(HostedCheckoutGateway::new(config.payment_link_base_url.clone())),
        webhook_logs,
    };

    Ok(Services::new(dispatcher, collaborators, config))
}

async fn build_stores(
    config: &AppConfig,
) -> anyhow::Result<(AppStore, Arc<dyn WebhookLogStore>)> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, state kept in memory");
        return Ok((
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryWebhookLogStore::new()),
        ));
    };

    let pool = postgres::connect(database_url)
        .await
        .context("failed to connect to postgres")?;
    postgres::ensure_schema(&pool)
        .await
        .context("failed to prepare postgres schema")?;
    tracing::info!("using postgres storage");

    let runtime = tokio::runtime::Handle::current();
    Ok((
        Arc::new(PostgresEventStore::new(pool.clone(), runtime.clone())),
        Arc::new(PostgresWebhookLogStore::new(pool, runtime)),
    ))
}

/// Log every committed event. The thread ends when the bus is dropped.
fn spawn_audit_log(bus: &AppBus) {
    let subscription = bus.subscribe();
    let spawned = std::thread::Builder::new()
        .name("audit-log".to_string())
        .spawn(move || {
            while let Ok(envelope) = subscription.recv() {
                tracing::info!(
                    event_type = envelope.event_type(),
                    aggregate_type = envelope.aggregate_type(),
                    aggregate_id = %envelope.aggregate_id(),
                    sequence = envelope.sequence_number(),
                    "event committed"
                );
            }
        });

    if let Err(e) = spawned {
        tracing::warn!(error = %e, "audit log subscriber not started");
    }
}
