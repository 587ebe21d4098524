//! Dual-write path: a business row and its outbox row in one transaction.
//!
//! ```text
//! CreateProduct
//!   ↓
//! 1. Validate (no transaction opened for invalid input)
//!   ↓
//! 2. Begin transaction
//!   ↓
//! 3. Generate product id
//!   ↓
//! 4. Insert product
//!   ↓
//! 5. Serialize `product_created` from the inserted row
//!   ↓
//! 6. Insert outbox row (pending)
//!   ↓
//! 7. Commit
//! ```
//!
//! Any failure after step 2 rolls the transaction back: the product and its
//! outbox row become visible together or not at all. Nothing is published
//! here; delivery belongs to the dispatcher.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use relaybox_core::{DomainError, IdError, IdGenerator, ProductId};
use relaybox_events::NewOutboxEntry;
use relaybox_products::{CreateProduct, Product, ProductCreated};

use crate::error::ErrorClass;
use crate::store::{StoreError, WriteStore, WriteTransaction};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("failed to generate product id: {0}")]
    IdGeneration(#[from] IdError),

    #[error("failed to serialize event: {0}")]
    Serialization(String),

    #[error("storage failure during {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

impl WriteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WriteError::Validation(_) => ErrorClass::Validation,
            WriteError::IdGeneration(_) | WriteError::Serialization(_) | WriteError::Store { .. } => {
                ErrorClass::TransientInfra
            }
        }
    }

    /// Whether the caller's input caused the failure.
    pub fn is_client_error(&self) -> bool {
        self.class() == ErrorClass::Validation
    }
}

fn store_error(operation: &'static str) -> impl FnOnce(StoreError) -> WriteError {
    move |source| WriteError::Store { operation, source }
}

/// Transaction manager for product creation.
///
/// Generic over the store and id source so tests run against the in-memory
/// store and a fixed or failing generator.
pub struct DualWriteManager<S, G> {
    store: S,
    ids: G,
}

impl<S, G> DualWriteManager<S, G>
where
    S: WriteStore,
    G: IdGenerator,
{
    pub fn new(store: S, ids: G) -> Self {
        Self { store, ids }
    }

    /// Validate, then persist the product and its `product_created` outbox row
    /// atomically. Returns the product as stored.
    #[instrument(skip(self, request), fields(name = %request.name), err)]
    pub async fn create_product(&self, request: CreateProduct) -> Result<Product, WriteError> {
        request.validate()?;

        let mut tx = self.store.begin_write().await.map_err(store_error("begin"))?;

        match self.write_in(tx.as_mut(), &request).await {
            Ok(product) => {
                tx.commit().await.map_err(store_error("commit"))?;
                info!(product_id = %product.id, "product created with outbox entry");
                Ok(product)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed write also failed");
                }
                Err(err)
            }
        }
    }

    async fn write_in(&self, tx: &mut dyn WriteTransaction, request: &CreateProduct) -> Result<Product, WriteError> {
        let id = ProductId::new(self.ids.generate()?);

        let product = tx
            .insert_product(id, request)
            .await
            .map_err(store_error("insert_product"))?;

        let entry = NewOutboxEntry::for_event(&ProductCreated(product.clone()))
            .map_err(|e| WriteError::Serialization(e.to_string()))?;

        let outbox_id = tx
            .insert_outbox(&entry)
            .await
            .map_err(store_error("insert_outbox"))?;

        debug!(product_id = %product.id, %outbox_id, "outbox row staged");
        Ok(product)
    }
}
