//! Postgres-backed products + outbox store.
//!
//! ## Claiming
//!
//! `claim_pending` opens a transaction and selects the oldest claimable rows
//! with `FOR UPDATE SKIP LOCKED`: concurrent dispatchers never wait on each
//! other and never receive the same row. Status updates are issued on the
//! same transaction and only become visible on commit. Dropping the batch
//! rolls the transaction back, which releases every lock.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (integrity / data exception) | `23xxx`, `22xxx` | `InvalidData` |
//! | Database (connection / resources / shutdown) | `08xxx`, `53xxx`, `57xxx` | `Unavailable` |
//! | Database (other) | Any other | `Query` |
//! | PoolClosed, PoolTimedOut, Io, Tls | N/A | `Unavailable` |
//! | Decode, ColumnDecode | N/A | `InvalidData` |
//! | Other | N/A | `Query` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use relaybox_core::ProductId;
use relaybox_events::{NewOutboxEntry, OutboxEntry, OutboxId, OutboxStatus};
use relaybox_products::{CreateProduct, Product};

use super::{
    ClaimStore, ClaimedBatch, OutboxAdmin, OutboxCounts, StoreError, WriteStore, WriteTransaction,
};

const OUTBOX_COLUMNS: &str =
    "id, event_type, payload, status, attempts, last_error, created_at, processed_at, next_attempt_at";

/// Postgres store for the `products` and `outbox` tables.
///
/// `Send + Sync`; all connection handling is left to the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self), err)]
    pub async fn find_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, price, stock, category, created_at, updated_at
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(product_id_to_db(id)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_product", e))?;

        row.map(|row| product_from_row(&row)).transpose()
    }
}

struct PgWrite {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl WriteStore for PostgresOutboxStore {
    async fn begin_write(&self) -> Result<Box<dyn WriteTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_write", e))?;
        Ok(Box::new(PgWrite { tx }))
    }
}

#[async_trait]
impl WriteTransaction for PgWrite {
    #[instrument(skip(self, request), fields(product_id = %id), err)]
    async fn insert_product(&mut self, id: ProductId, request: &CreateProduct) -> Result<Product, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO products (id, name, description, price, stock, category)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, description, price, stock, category, created_at, updated_at
            "#,
        )
        .bind(product_id_to_db(id)?)
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.price)
        .bind(request.stock)
        .bind(&request.category)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;

        product_from_row(&row)
    }

    #[instrument(skip(self, entry), fields(event_type = %entry.event_type), err)]
    async fn insert_outbox(&mut self, entry: &NewOutboxEntry) -> Result<OutboxId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (event_type, payload, status)
            VALUES ($1, $2, 'pending')
            RETURNING id
            "#,
        )
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_outbox", e))?;

        Ok(OutboxId::new(id))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit_write", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("rollback_write", e))
    }
}

struct PgClaim {
    tx: Transaction<'static, Postgres>,
    entries: Vec<OutboxEntry>,
}

impl PgClaim {
    fn ensure_claimed(&self, id: OutboxId) -> Result<(), StoreError> {
        if self.entries.iter().any(|e| e.id == id) {
            Ok(())
        } else {
            Err(StoreError::NotClaimed(id))
        }
    }

    /// Run a status update guarded by `status = 'pending'`.
    async fn update_pending(
        &mut self,
        operation: &'static str,
        id: OutboxId,
        to: OutboxStatus,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), StoreError> {
        let result = query
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() != 1 {
            // Only possible if the row was already moved earlier in this claim.
            return Err(StoreError::IllegalTransition {
                id,
                from: OutboxStatus::Processed,
                to,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn claim_pending(&self, limit: usize) -> Result<Box<dyn ClaimedBatch>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_claim", e))?;

        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE status = 'pending'
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_pending", e))?;

        let entries = rows
            .iter()
            .map(|row| entry_from_row("claim_pending", row))
            .collect::<Result<Vec<OutboxEntry>, StoreError>>()?;

        debug!(claimed = entries.len(), "claimed outbox rows");
        Ok(Box::new(PgClaim { tx, entries }))
    }
}

#[async_trait]
impl ClaimedBatch for PgClaim {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_processed(&mut self, id: OutboxId, processed_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_claimed(id)?;
        let query = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'processed', processed_at = $2, next_attempt_at = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.get())
        .bind(processed_at);
        self.update_pending("mark_processed", id, OutboxStatus::Processed, query).await
    }

    async fn record_failure(
        &mut self,
        id: OutboxId,
        attempts: u32,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_claimed(id)?;
        let query = sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = $2, last_error = $3, next_attempt_at = $4
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.get())
        .bind(attempts_to_db(attempts))
        .bind(error.to_string())
        .bind(retry_at);
        self.update_pending("record_failure", id, OutboxStatus::Pending, query).await
    }

    async fn mark_failed(&mut self, id: OutboxId, attempts: u32, reason: &str) -> Result<(), StoreError> {
        self.ensure_claimed(id)?;
        let query = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'failed', attempts = $2, last_error = $3, next_attempt_at = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.get())
        .bind(attempts_to_db(attempts))
        .bind(reason.to_string());
        self.update_pending("mark_failed", id, OutboxStatus::Failed, query).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit_claim", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("rollback_claim", e))
    }
}

#[async_trait]
impl OutboxAdmin for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = OutboxCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("counts", e))?;
            let status = status
                .parse::<OutboxStatus>()
                .map_err(|e| StoreError::InvalidData(e.to_string()))?;
            counts.add(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: OutboxId) -> Result<Option<OutboxEntry>, StoreError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_outbox", e))?;

        row.map(|row| entry_from_row("get_outbox", &row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn requeue_failed(&self, id: OutboxId) -> Result<OutboxEntry, StoreError> {
        let sql = format!(
            r#"
            UPDATE outbox
            SET status = 'pending', attempts = 0, last_error = NULL, next_attempt_at = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_failed", e))?;

        match row {
            Some(row) => entry_from_row("requeue_failed", &row),
            None => match self.get(id).await? {
                Some(entry) => Err(StoreError::IllegalTransition {
                    id,
                    from: entry.status,
                    to: OutboxStatus::Pending,
                }),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }
}

/// Map SQLx errors to `StoreError` (see the module docs for the table).
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                "23505" => StoreError::Conflict(msg),
                c if c.starts_with("23") || c.starts_with("22") => StoreError::InvalidData(msg),
                c if c.starts_with("08") || c.starts_with("53") || c.starts_with("57") => {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => {
            StoreError::Unavailable(format!("connection failure in {}: {}", operation, err))
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StoreError::InvalidData(format!("decode failure in {}: {}", operation, err))
        }
        _ => StoreError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn product_id_to_db(id: ProductId) -> Result<i64, StoreError> {
    i64::try_from(id.get()).map_err(|_| StoreError::InvalidData(format!("product id {id} exceeds BIGINT")))
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn entry_from_row(operation: &str, row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, StoreError> {
    let row = OutboxRow::from_row(row).map_err(|e| map_sqlx_error(operation, e))?;
    OutboxEntry::try_from(row)
}

fn product_from_row(row: &sqlx::postgres::PgRow) -> Result<Product, StoreError> {
    let row = ProductRow::from_row(row).map_err(|e| map_sqlx_error("decode_product", e))?;
    let id = u64::try_from(row.id)
        .map_err(|_| StoreError::InvalidData(format!("negative product id {}", row.id)))?;
    Ok(Product {
        id: ProductId::new(id),
        name: row.name,
        description: row.description,
        price: row.price,
        stock: row.stock,
        category: row.category,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

// SQLx row types

#[derive(Debug)]
struct ProductRow {
    id: i64,
    name: String,
    description: String,
    price: f64,
    stock: i32,
    category: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ProductRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            price: row.try_get("price")?,
            stock: row.try_get("stock")?,
            category: row.try_get("category")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug)]
struct OutboxRow {
    id: i64,
    event_type: String,
    payload: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|e| StoreError::InvalidData(format!("outbox row {}: {e}", row.id)))?;
        Ok(OutboxEntry {
            id: OutboxId::new(row.id),
            event_type: row.event_type,
            payload: row.payload,
            status,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
            next_attempt_at: row.next_attempt_at,
        })
    }
}
