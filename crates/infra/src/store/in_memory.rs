//! In-memory outbox store for tests/dev.
//!
//! Mirrors the Postgres semantics the dispatcher relies on: writes are
//! buffered until commit, claims lock rows and skip rows held by another
//! claim, and an abandoned claim leaves no trace. Faults can be injected per
//! operation to exercise failure paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relaybox_core::ProductId;
use relaybox_events::{NewOutboxEntry, OutboxEntry, OutboxId, OutboxStatus};
use relaybox_products::{CreateProduct, Product};

use super::{
    ClaimStore, ClaimedBatch, OutboxAdmin, OutboxCounts, StoreError, WriteStore, WriteTransaction,
};

/// Operation that fails (with [`StoreError::Unavailable`]) while injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreFault {
    BeginWrite,
    ProductInsert,
    OutboxInsert,
    WriteCommit,
    Claim,
    StatusUpdate,
    ClaimCommit,
}

#[derive(Debug, Default)]
struct Tables {
    products: BTreeMap<ProductId, Product>,
    outbox: BTreeMap<OutboxId, OutboxEntry>,
    last_outbox_id: i64,
    locked: HashSet<OutboxId>,
}

impl Tables {
    fn next_outbox_id(&mut self) -> OutboxId {
        self.last_outbox_id += 1;
        OutboxId::new(self.last_outbox_id)
    }

    fn unlock(&mut self, entries: &[OutboxEntry]) {
        for entry in entries {
            self.locked.remove(&entry.id);
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    faults: Mutex<HashSet<StoreFault>>,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, fault: StoreFault) -> Result<(), StoreError> {
        let faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        if faults.contains(&fault) {
            return Err(StoreError::Unavailable(format!("injected fault: {fault:?}")));
        }
        Ok(())
    }
}

/// Shared in-memory products + outbox tables. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    shared: Arc<Shared>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fault` fail until cleared.
    pub fn inject(&self, fault: StoreFault) {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fault);
    }

    pub fn clear_fault(&self, fault: StoreFault) {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fault);
    }

    /// Insert a committed `pending` row directly, bypassing the write path.
    pub fn seed(&self, entry: NewOutboxEntry) -> OutboxId {
        self.seed_at(entry, Utc::now())
    }

    pub fn seed_at(&self, entry: NewOutboxEntry, created_at: DateTime<Utc>) -> OutboxId {
        let mut tables = self.shared.tables();
        let id = tables.next_outbox_id();
        tables.outbox.insert(id, pending_entry(id, entry, created_at));
        id
    }

    pub fn products(&self) -> Vec<Product> {
        self.shared.tables().products.values().cloned().collect()
    }

    pub fn product(&self, id: ProductId) -> Option<Product> {
        self.shared.tables().products.get(&id).cloned()
    }

    /// Committed outbox rows in id order.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.shared.tables().outbox.values().cloned().collect()
    }

    pub fn entry(&self, id: OutboxId) -> Option<OutboxEntry> {
        self.shared.tables().outbox.get(&id).cloned()
    }

    /// Rows currently held by an open claim.
    pub fn locked_count(&self) -> usize {
        self.shared.tables().locked.len()
    }
}

fn pending_entry(id: OutboxId, entry: NewOutboxEntry, created_at: DateTime<Utc>) -> OutboxEntry {
    OutboxEntry {
        id,
        event_type: entry.event_type,
        payload: entry.payload,
        status: OutboxStatus::Pending,
        attempts: 0,
        last_error: None,
        created_at,
        processed_at: None,
        next_attempt_at: None,
    }
}

#[derive(Debug)]
struct InMemoryWrite {
    shared: Arc<Shared>,
    products: Vec<Product>,
    outbox: Vec<OutboxEntry>,
}

#[async_trait]
impl WriteStore for InMemoryOutboxStore {
    async fn begin_write(&self) -> Result<Box<dyn WriteTransaction>, StoreError> {
        self.shared.check(StoreFault::BeginWrite)?;
        Ok(Box::new(InMemoryWrite {
            shared: Arc::clone(&self.shared),
            products: Vec::new(),
            outbox: Vec::new(),
        }))
    }
}

#[async_trait]
impl WriteTransaction for InMemoryWrite {
    async fn insert_product(&mut self, id: ProductId, request: &CreateProduct) -> Result<Product, StoreError> {
        self.shared.check(StoreFault::ProductInsert)?;
        if i64::try_from(id.get()).is_err() {
            return Err(StoreError::InvalidData(format!("product id {id} exceeds BIGINT")));
        }

        let duplicate = self.products.iter().any(|p| p.id == id) || self.shared.tables().products.contains_key(&id);
        if duplicate {
            return Err(StoreError::Conflict(format!("product {id} already exists")));
        }

        let now = Utc::now();
        let product = Product {
            id,
            name: request.name.clone(),
            description: request.description.clone(),
            price: request.price,
            stock: request.stock,
            category: request.category.clone(),
            created_at: now,
            updated_at: now,
        };
        self.products.push(product.clone());
        Ok(product)
    }

    async fn insert_outbox(&mut self, entry: &NewOutboxEntry) -> Result<OutboxId, StoreError> {
        self.shared.check(StoreFault::OutboxInsert)?;
        // Ids come from a sequence: consumed even if this transaction rolls back.
        let id = self.shared.tables().next_outbox_id();
        self.outbox.push(pending_entry(id, entry.clone(), Utc::now()));
        Ok(id)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryWrite { shared, products, outbox } = *self;
        shared.check(StoreFault::WriteCommit)?;

        let mut tables = shared.tables();
        if let Some(dup) = products.iter().find(|p| tables.products.contains_key(&p.id)) {
            return Err(StoreError::Conflict(format!("product {} already exists", dup.id)));
        }
        for product in products {
            tables.products.insert(product.id, product);
        }
        for entry in outbox {
            tables.outbox.insert(entry.id, entry);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug)]
struct InMemoryClaim {
    shared: Arc<Shared>,
    entries: Vec<OutboxEntry>,
    staged: BTreeMap<OutboxId, OutboxEntry>,
    released: bool,
}

impl InMemoryClaim {
    fn stage(
        &mut self,
        id: OutboxId,
        to: OutboxStatus,
        apply: impl FnOnce(&mut OutboxEntry),
    ) -> Result<(), StoreError> {
        self.shared.check(StoreFault::StatusUpdate)?;

        let current = match self.staged.get(&id) {
            Some(entry) => entry.clone(),
            None => self
                .entries
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or(StoreError::NotClaimed(id))?,
        };
        if !current.status.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                id,
                from: current.status,
                to,
            });
        }

        let mut next = current;
        next.status = to;
        apply(&mut next);
        self.staged.insert(id, next);
        Ok(())
    }
}

impl Drop for InMemoryClaim {
    fn drop(&mut self) {
        if !self.released {
            self.shared.tables().unlock(&self.entries);
        }
    }
}

#[async_trait]
impl ClaimStore for InMemoryOutboxStore {
    async fn claim_pending(&self, limit: usize) -> Result<Box<dyn ClaimedBatch>, StoreError> {
        self.shared.check(StoreFault::Claim)?;

        let now = Utc::now();
        let mut tables = self.shared.tables();
        let mut claimable: Vec<OutboxEntry> = tables
            .outbox
            .values()
            .filter(|e| e.is_claimable(now) && !tables.locked.contains(&e.id))
            .cloned()
            .collect();
        claimable.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        claimable.truncate(limit);

        for entry in &claimable {
            tables.locked.insert(entry.id);
        }
        drop(tables);

        Ok(Box::new(InMemoryClaim {
            shared: Arc::clone(&self.shared),
            entries: claimable,
            staged: BTreeMap::new(),
            released: false,
        }))
    }
}

#[async_trait]
impl ClaimedBatch for InMemoryClaim {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_processed(&mut self, id: OutboxId, processed_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.stage(id, OutboxStatus::Processed, |e| {
            e.processed_at = Some(processed_at);
            e.next_attempt_at = None;
        })
    }

    async fn record_failure(
        &mut self,
        id: OutboxId,
        attempts: u32,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.stage(id, OutboxStatus::Pending, |e| {
            e.attempts = attempts;
            e.last_error = Some(error.to_string());
            e.next_attempt_at = Some(retry_at);
        })
    }

    async fn mark_failed(&mut self, id: OutboxId, attempts: u32, reason: &str) -> Result<(), StoreError> {
        self.stage(id, OutboxStatus::Failed, |e| {
            e.attempts = attempts;
            e.last_error = Some(reason.to_string());
            e.next_attempt_at = None;
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = *self;
        // A failed commit drops `this`, which releases the locks untouched.
        this.shared.check(StoreFault::ClaimCommit)?;

        let staged = std::mem::take(&mut this.staged);
        let mut tables = this.shared.tables();
        for (id, entry) in staged {
            tables.outbox.insert(id, entry);
        }
        tables.unlock(&this.entries);
        drop(tables);
        this.released = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Drop releases the locks; staged updates are discarded.
        drop(self);
        Ok(())
    }
}

#[async_trait]
impl OutboxAdmin for InMemoryOutboxStore {
    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let tables = self.shared.tables();
        let mut counts = OutboxCounts::default();
        for entry in tables.outbox.values() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxEntry>, StoreError> {
        Ok(self.entry(id))
    }

    async fn requeue_failed(&self, id: OutboxId) -> Result<OutboxEntry, StoreError> {
        let mut tables = self.shared.tables();
        let entry = tables.outbox.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.status != OutboxStatus::Failed {
            return Err(StoreError::IllegalTransition {
                id,
                from: entry.status,
                to: OutboxStatus::Pending,
            });
        }

        entry.status = OutboxStatus::Pending;
        entry.attempts = 0;
        entry.last_error = None;
        entry.next_attempt_at = None;
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(id: u64) -> NewOutboxEntry {
        NewOutboxEntry {
            event_type: "product_created".to_string(),
            payload: format!(r#"{{"id":{id}}}"#),
        }
    }

    fn request() -> CreateProduct {
        CreateProduct {
            name: "Desk".to_string(),
            description: String::new(),
            price: 10.0,
            stock: 1,
            category: String::new(),
        }
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin_write().await.unwrap();
        tx.insert_product(ProductId::new(1), &request()).await.unwrap();
        tx.insert_outbox(&new_entry(1)).await.unwrap();

        assert!(store.products().is_empty());
        assert!(store.entries().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(store.products().len(), 1);
        assert_eq!(store.entries().len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin_write().await.unwrap();
        tx.insert_product(ProductId::new(1), &request()).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.products().is_empty());
    }

    #[tokio::test]
    async fn duplicate_product_id_conflicts() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin_write().await.unwrap();
        tx.insert_product(ProductId::new(9), &request()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_write().await.unwrap();
        let err = tx.insert_product(ProductId::new(9), &request()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn open_claim_hides_rows_from_other_claims() {
        let store = InMemoryOutboxStore::new();
        store.seed(new_entry(1));
        store.seed(new_entry(2));

        let first = store.claim_pending(1).await.unwrap();
        let second = store.claim_pending(10).await.unwrap();

        assert_eq!(first.entries().len(), 1);
        assert_eq!(second.entries().len(), 1);
        assert_ne!(first.entries()[0].id, second.entries()[0].id);
        assert_eq!(store.locked_count(), 2);
    }

    #[tokio::test]
    async fn dropping_a_claim_releases_locks_and_discards_updates() {
        let store = InMemoryOutboxStore::new();
        let id = store.seed(new_entry(1));

        {
            let mut batch = store.claim_pending(10).await.unwrap();
            batch.mark_processed(id, Utc::now()).await.unwrap();
        }

        assert_eq!(store.locked_count(), 0);
        assert_eq!(store.entry(id).unwrap().status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn commit_applies_staged_updates() {
        let store = InMemoryOutboxStore::new();
        let id = store.seed(new_entry(1));

        let mut batch = store.claim_pending(10).await.unwrap();
        batch.mark_processed(id, Utc::now()).await.unwrap();
        batch.commit().await.unwrap();

        let entry = store.entry(id).unwrap();
        assert_eq!(entry.status, OutboxStatus::Processed);
        assert!(entry.processed_at.is_some());
        assert_eq!(store.locked_count(), 0);
    }

    #[tokio::test]
    async fn terminal_rows_cannot_move_again() {
        let store = InMemoryOutboxStore::new();
        let id = store.seed(new_entry(1));

        let mut batch = store.claim_pending(10).await.unwrap();
        batch.mark_processed(id, Utc::now()).await.unwrap();
        let err = batch.mark_failed(id, 1, "late").await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn updates_are_limited_to_claimed_rows() {
        let store = InMemoryOutboxStore::new();
        store.seed(new_entry(1));
        let other = store.seed(new_entry(2));

        let mut batch = store.claim_pending(1).await.unwrap();
        let err = batch.mark_processed(other, Utc::now()).await.unwrap_err();
        assert_eq!(err, StoreError::NotClaimed(other));
    }

    #[tokio::test]
    async fn failed_claim_commit_leaves_rows_pending_and_unlocked() {
        let store = InMemoryOutboxStore::new();
        let id = store.seed(new_entry(1));
        store.inject(StoreFault::ClaimCommit);

        let mut batch = store.claim_pending(10).await.unwrap();
        batch.mark_processed(id, Utc::now()).await.unwrap();
        assert!(batch.commit().await.is_err());

        assert_eq!(store.entry(id).unwrap().status, OutboxStatus::Pending);
        assert_eq!(store.locked_count(), 0);
    }

    #[tokio::test]
    async fn rows_waiting_for_retry_are_not_claimable() {
        let store = InMemoryOutboxStore::new();
        let id = store.seed(new_entry(1));

        let mut batch = store.claim_pending(10).await.unwrap();
        let later = Utc::now() + chrono::Duration::minutes(5);
        batch.record_failure(id, 1, "broker down", later).await.unwrap();
        batch.commit().await.unwrap();

        let batch = store.claim_pending(10).await.unwrap();
        assert!(batch.entries().is_empty());
        assert_eq!(store.entry(id).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn requeue_only_accepts_failed_rows() {
        let store = InMemoryOutboxStore::new();
        let id = store.seed(new_entry(1));

        let err = store.requeue_failed(id).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        let mut batch = store.claim_pending(10).await.unwrap();
        batch.mark_failed(id, 3, "poison").await.unwrap();
        batch.commit().await.unwrap();

        let requeued = store.requeue_failed(id).await.unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.last_error, None);

        let missing = OutboxId::new(999);
        assert_eq!(store.requeue_failed(missing).await.unwrap_err(), StoreError::NotFound(missing));
    }
}
