//! Service wiring: stores, broker and dispatcher behind the HTTP handlers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relaybox_core::{IdGenerator, SnowflakeGenerator};
use relaybox_infra::broker::{Broker, InMemoryBroker};
use relaybox_infra::config::AppConfig;
use relaybox_infra::dispatcher::{DispatcherHandle, DispatcherStats, OutboxDispatcher};
use relaybox_infra::store::{ClaimStore, InMemoryOutboxStore, OutboxAdmin, WriteStore};
use relaybox_infra::write_path::DualWriteManager;
#[cfg(feature = "persistent")]
use relaybox_infra::{broker::RedisStreamsBroker, db, store::PostgresOutboxStore};

pub type ProductWriter = DualWriteManager<Arc<dyn WriteStore>, Arc<dyn IdGenerator>>;

/// Everything request handlers need.
pub struct AppServices {
    writer: ProductWriter,
    admin: Arc<dyn OutboxAdmin>,
    dispatcher_stats: Option<Arc<Mutex<DispatcherStats>>>,
}

impl AppServices {
    pub fn new(store: Arc<dyn WriteStore>, admin: Arc<dyn OutboxAdmin>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            writer: DualWriteManager::new(store, ids),
            admin,
            dispatcher_stats: None,
        }
    }

    /// Services over a shared in-memory store (dev/test).
    pub fn in_memory(store: &InMemoryOutboxStore, machine_id: u16) -> Self {
        let shared = Arc::new(store.clone());
        Self::new(shared.clone(), shared, Arc::new(SnowflakeGenerator::new(machine_id)))
    }

    pub fn with_dispatcher_stats(mut self, stats: Arc<Mutex<DispatcherStats>>) -> Self {
        self.dispatcher_stats = Some(stats);
        self
    }

    pub fn writer(&self) -> &ProductWriter {
        &self.writer
    }

    pub fn admin(&self) -> &dyn OutboxAdmin {
        self.admin.as_ref()
    }

    pub fn dispatcher_stats(&self) -> Option<DispatcherStats> {
        self.dispatcher_stats
            .as_ref()
            .map(|stats| stats.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

struct Stores {
    write: Arc<dyn WriteStore>,
    claim: Arc<dyn ClaimStore>,
    admin: Arc<dyn OutboxAdmin>,
}

/// Running process state: services for the router plus the background
/// dispatcher and the connections it owns.
pub struct Runtime {
    services: Arc<AppServices>,
    dispatcher: DispatcherHandle,
    broker: Arc<dyn Broker>,
    pool: Option<PgPool>,
}

impl Runtime {
    /// Connect everything `config` asks for and start the dispatcher.
    ///
    /// The dispatcher stops when `shutdown` is cancelled.
    pub async fn start(config: &AppConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let ids: Arc<dyn IdGenerator> = Arc::new(SnowflakeGenerator::new(config.machine_id));

        if config.persistent {
            #[cfg(feature = "persistent")]
            {
                return Self::start_persistent(config, ids, shutdown).await;
            }
            #[cfg(not(feature = "persistent"))]
            {
                anyhow::bail!("USE_PERSISTENT_STORES=true but relaybox-api was built without the `persistent` feature");
            }
        }

        Ok(Self::start_in_memory(config, ids, shutdown))
    }

    fn start_in_memory(config: &AppConfig, ids: Arc<dyn IdGenerator>, shutdown: CancellationToken) -> Self {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(config.broker.topic.clone()));
        info!("using in-memory store and broker");

        let stores = Stores {
            write: store.clone(),
            claim: store.clone(),
            admin: store,
        };
        Self::wire(config, stores, broker, ids, None, shutdown)
    }

    #[cfg(feature = "persistent")]
    async fn start_persistent(
        config: &AppConfig,
        ids: Arc<dyn IdGenerator>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = db::connect_with_retry(&config.database)
            .await
            .context("connecting to database")?;
        db::ping_with_retry(&pool, &config.database)
            .await
            .context("pinging database")?;
        db::run_migrations(&pool).await.context("running migrations")?;

        let broker: Arc<dyn Broker> = Arc::new(
            RedisStreamsBroker::connect(&config.broker)
                .await
                .context("connecting to broker")?,
        );

        let store = Arc::new(PostgresOutboxStore::new(pool.clone()));
        let stores = Stores {
            write: store.clone(),
            claim: store.clone(),
            admin: store,
        };
        Ok(Self::wire(config, stores, broker, ids, Some(pool), shutdown))
    }

    fn wire(
        config: &AppConfig,
        stores: Stores,
        broker: Arc<dyn Broker>,
        ids: Arc<dyn IdGenerator>,
        pool: Option<PgPool>,
        shutdown: CancellationToken,
    ) -> Self {
        let dispatcher = OutboxDispatcher::new(stores.claim, Arc::clone(&broker), config.dispatcher.clone())
            .spawn(shutdown);

        let services = AppServices::new(stores.write, stores.admin, ids)
            .with_dispatcher_stats(dispatcher.stats_handle());

        Self {
            services: Arc::new(services),
            dispatcher,
            broker,
            pool,
        }
    }

    pub fn services(&self) -> Arc<AppServices> {
        Arc::clone(&self.services)
    }

    /// Stop the dispatcher (bounded by `grace`), then flush the broker and
    /// close the pool.
    pub async fn shutdown(self, grace: Duration) {
        if !self.dispatcher.shutdown(grace).await {
            warn!("dispatcher did not stop cleanly; its batch was abandoned and will be retried");
        }
        self.broker.close().await;
        if let Some(pool) = self.pool {
            pool.close().await;
        }
        info!("shutdown complete");
    }
}
