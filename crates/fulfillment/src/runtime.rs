//! Wires the store, counter tier, broker and handlers into running tasks.

use std::sync::Arc;

use inventory::{CounterStore, InMemoryCounterStore, ReservationEngine};
use outbox::{InMemoryBroker, OutboxJanitor, OutboxRelay, TaskHandle};
use saga::{
    Dispatcher, InventoryHandler, MessageRegistry, OrderSaga, PaymentGateway, PaymentHandler,
    SagaConsumer, SimulatedPaymentGateway,
};
use sqlx::postgres::PgPoolOptions;
use store::{InMemoryStore, PostgresStore, Store};

use crate::Result;
use crate::config::Config;

/// Backends the runtime runs against.
pub struct Backends {
    pub store: Arc<dyn Store>,
    pub counters: Arc<dyn CounterStore>,
    pub gateway: Arc<dyn PaymentGateway>,
}

impl Backends {
    /// Picks the backends named by the configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            store: connect_store(config).await?,
            counters: connect_counters(config).await?,
            gateway: Arc::new(SimulatedPaymentGateway::new(config.payment_failure_rate)),
        })
    }

    /// All in-memory, with the given payment gateway.
    pub fn in_memory(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            counters: Arc::new(InMemoryCounterStore::new()),
            gateway,
        }
    }
}

async fn connect_store(config: &Config) -> Result<Arc<dyn Store>> {
    let Some(url) = &config.database_url else {
        tracing::info!("DATABASE_URL not set, using the in-memory store");
        return Ok(Arc::new(InMemoryStore::new()));
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    let store = PostgresStore::new(pool);
    store.run_migrations().await.map_err(store::StoreError::from)?;
    tracing::info!("Connected to PostgreSQL");
    Ok(Arc::new(store))
}

#[cfg(feature = "redis")]
async fn connect_counters(config: &Config) -> Result<Arc<dyn CounterStore>> {
    match &config.redis_url {
        Some(url) => {
            let counters = inventory::RedisCounterStore::new(url, None).await?;
            tracing::info!("Connected to Redis counter tier");
            Ok(Arc::new(counters))
        }
        None => Ok(Arc::new(InMemoryCounterStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_counters(config: &Config) -> Result<Arc<dyn CounterStore>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL ignored, built without the redis feature");
    }
    Ok(Arc::new(InMemoryCounterStore::new()))
}

/// The running saga: consumer, relay and janitor tasks plus the entry points
/// they share.
pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub broker: InMemoryBroker,
    pub engine: Arc<ReservationEngine>,
    pub saga: Arc<OrderSaga>,
    tasks: Vec<TaskHandle>,
}

impl Runtime {
    /// Seeds stock and starts every background task.
    pub async fn start(config: &Config, backends: Backends) -> Result<Self> {
        let Backends {
            store,
            counters,
            gateway,
        } = backends;

        let engine = Arc::new(ReservationEngine::new(
            counters,
            Arc::clone(&store),
            config.inventory.clone(),
        ));
        for (product_id, quantity) in &config.seed_stock {
            engine.seed_stock(product_id, *quantity).await?;
        }

        let saga = Arc::new(OrderSaga::new(Arc::clone(&store), config.saga.clone()));
        let inventory = Arc::new(InventoryHandler::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            &config.saga,
        ));
        let payment = Arc::new(PaymentHandler::new(
            Arc::clone(&store),
            gateway,
            &config.saga,
        ));

        let broker = InMemoryBroker::new();
        let dispatcher = Dispatcher::new()
            .with_order_saga(Arc::clone(&saga))
            .with_inventory(inventory)
            .with_payment(payment);
        let registry = Arc::new(MessageRegistry::standard()?);
        let consumer =
            SagaConsumer::new(broker.clone(), registry, dispatcher, config.saga.clone());

        let relay = Arc::new(OutboxRelay::new(
            Arc::clone(&store),
            Arc::new(broker.clone()),
            config.outbox.clone(),
        ));
        let janitor = Arc::new(OutboxJanitor::new(
            Arc::clone(&store),
            config.outbox.clone(),
        ));

        let tasks = vec![consumer.spawn().await, relay.spawn(), janitor.spawn()];
        tracing::info!(
            seeded_products = config.seed_stock.len(),
            "Fulfillment runtime started"
        );

        Ok(Self {
            store,
            broker,
            engine,
            saga,
            tasks,
        })
    }

    /// Stops every background task and waits for it to finish.
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.shutdown().await;
        }
        tracing::info!("Fulfillment runtime stopped");
    }
}
