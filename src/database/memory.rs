// database/memory.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};

use super::ports::{EventBus, RequestCache, TransactionStore};
use crate::errors::{AppError, Result};
use crate::models::initiate::InitiateStkRequest;
use crate::models::list::TransactionQuery;
use crate::models::stk_transaction::{
    CallbackResult, NewStkTransaction, QueryResult, RequestAck, StkStatus, StkTransaction,
    TransactionKey,
};

#[derive(Default)]
struct Table {
    rows: BTreeMap<i64, StkTransaction>,
    last_id: i64,
}

impl Table {
    fn find(&self, key: &TransactionKey) -> Option<i64> {
        match key {
            TransactionKey::Id(id) => self.rows.contains_key(id).then_some(*id),
            TransactionKey::Receipt(receipt) => self
                .rows
                .values()
                .find(|tx| tx.mpesa_receipt_id.as_deref() == Some(receipt.as_str()))
                .map(|tx| tx.id),
        }
    }

    fn find_checkout(&self, checkout_request_id: &str) -> Option<i64> {
        self.rows
            .values()
            .find(|tx| tx.checkout_request_id.as_deref() == Some(checkout_request_id))
            .map(|tx| tx.id)
    }

    fn ensure_unique(&self, id: i64, checkout: Option<&str>, receipt: Option<&str>) -> Result<()> {
        for other in self.rows.values().filter(|tx| tx.id != id) {
            if checkout.is_some() && other.checkout_request_id.as_deref() == checkout {
                return Err(AppError::Conflict(
                    "duplicate key value violates unique constraint \"stk_transactions_checkout_request_id_key\"".into(),
                ));
            }
            if receipt.is_some() && other.mpesa_receipt_id.as_deref() == receipt {
                return Err(AppError::Conflict(
                    "duplicate key value violates unique constraint \"stk_transactions_mpesa_receipt_id_key\"".into(),
                ));
            }
        }
        Ok(())
    }

    fn insert(&mut self, tx: NewStkTransaction, status: StkStatus) -> StkTransaction {
        self.last_id += 1;
        let now = Utc::now();
        let row = StkTransaction {
            id: self.last_id,
            initiator_id: tx.initiator_id,
            initiator_customer_reference: tx.initiator_customer_reference,
            initiator_customer_names: tx.initiator_customer_names,
            phone_number: tx.phone_number,
            amount: tx.amount,
            short_code: tx.short_code,
            account_reference: tx.account_reference,
            transaction_desc: tx.transaction_desc,
            merchant_request_id: None,
            checkout_request_id: None,
            stk_response_code: None,
            stk_response_description: None,
            stk_response_customer_message: None,
            result_code: None,
            result_description: None,
            mpesa_receipt_id: None,
            stk_status: status,
            succeeded: status.is_success(),
            processed: false,
            transaction_time: now,
            created_at: now,
            updated_at: now,
        };
        self.rows.insert(row.id, row.clone());
        row
    }
}

fn non_empty(value: &str) -> Option<String> {
    Some(value.to_string()).filter(|v| !v.is_empty())
}

/// Transaction store backed by a map, mirroring the conditional updates and
/// unique constraints of the Postgres schema.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    table: Arc<RwLock<Table>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<StkTransaction> {
        self.table.read().await.rows.values().cloned().collect()
    }

    /// Moves a record's creation time, for exercising staleness windows.
    pub async fn set_created_at(&self, id: i64, at: DateTime<Utc>) {
        if let Some(row) = self.table.write().await.rows.get_mut(&id) {
            row.created_at = at;
        }
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create(&self, tx: NewStkTransaction) -> Result<StkTransaction> {
        let mut table = self.table.write().await;
        Ok(table.insert(tx, StkStatus::Submitted))
    }

    async fn get(&self, key: &TransactionKey) -> Result<Option<StkTransaction>> {
        let table = self.table.read().await;
        Ok(table.find(key).and_then(|id| table.rows.get(&id).cloned()))
    }

    async fn get_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<StkTransaction>> {
        let table = self.table.read().await;
        Ok(table
            .find_checkout(checkout_request_id)
            .and_then(|id| table.rows.get(&id).cloned()))
    }

    async fn mark_request_success(&self, id: i64, ack: &RequestAck) -> Result<Option<StkTransaction>> {
        let mut table = self.table.write().await;
        match table.rows.get(&id) {
            Some(row) if row.stk_status == StkStatus::Submitted => {}
            _ => return Ok(None),
        }

        let checkout = non_empty(&ack.checkout_request_id);
        table.ensure_unique(id, checkout.as_deref(), None)?;

        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        row.merchant_request_id = non_empty(&ack.merchant_request_id);
        row.checkout_request_id = checkout;
        row.stk_response_code = non_empty(&ack.response_code);
        row.stk_response_description = non_empty(&ack.response_description);
        row.stk_response_customer_message = non_empty(&ack.customer_message);
        row.stk_status = StkStatus::RequestSuccess;
        row.succeeded = false;
        row.transaction_time = Utc::now();
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn mark_request_failed(&self, id: i64, reason: &str) -> Result<Option<StkTransaction>> {
        let mut table = self.table.write().await;
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if row.stk_status != StkStatus::Submitted {
            return Ok(None);
        }
        row.stk_response_description = Some(reason.to_string());
        row.stk_status = StkStatus::RequestFailed;
        row.succeeded = false;
        row.transaction_time = Utc::now();
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn upsert_callback(
        &self,
        context: NewStkTransaction,
        result: &CallbackResult,
    ) -> Result<StkTransaction> {
        let mut table = self.table.write().await;

        let id = match table.find_checkout(&result.checkout_request_id) {
            Some(id) => id,
            None => {
                table.ensure_unique(0, None, result.mpesa_receipt_id.as_deref())?;
                let row = table.insert(context, result.status);
                row.id
            }
        };

        let current = table
            .rows
            .get(&id)
            .map(|row| row.stk_status)
            .ok_or_else(|| AppError::not_found("stk transaction"))?;
        if current != result.status && !current.can_transition_to(result.status) {
            return table
                .rows
                .get(&id)
                .cloned()
                .ok_or_else(|| AppError::not_found("stk transaction"));
        }

        table.ensure_unique(id, None, result.mpesa_receipt_id.as_deref())?;

        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("stk transaction"))?;
        row.merchant_request_id
            .get_or_insert_with(|| result.merchant_request_id.clone());
        row.checkout_request_id = Some(result.checkout_request_id.clone());
        row.result_code = Some(result.result_code.clone());
        row.result_description = Some(result.result_description.clone());
        if result.mpesa_receipt_id.is_some() {
            row.mpesa_receipt_id = result.mpesa_receipt_id.clone();
        }
        row.transaction_time = result.transaction_time;
        row.stk_status = result.status;
        row.succeeded = result.status.is_success();
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn apply_query_result(&self, id: i64, result: &QueryResult) -> Result<Option<StkTransaction>> {
        let mut table = self.table.write().await;
        let receipt = match table.rows.get(&id) {
            Some(row) if row.stk_status.is_awaiting_result() => row
                .mpesa_receipt_id
                .clone()
                .or_else(|| result.mpesa_receipt_id.clone()),
            _ => return Ok(None),
        };
        table.ensure_unique(id, None, receipt.as_deref())?;

        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if result.response_code.is_some() {
            row.stk_response_code = result.response_code.clone();
        }
        if result.response_description.is_some() {
            row.stk_response_description = result.response_description.clone();
        }
        row.result_code = Some(result.result_code.clone());
        row.result_description = Some(result.result_description.clone());
        row.mpesa_receipt_id = receipt;
        row.stk_status = result.status;
        row.succeeded = result.status.is_success();
        row.transaction_time = Utc::now();
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<StkTransaction>> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .rev()
            .filter(|tx| tx.stk_status.is_awaiting_result())
            .filter(|tx| tx.checkout_request_id.is_some())
            .filter(|tx| tx.created_at < older_than)
            .filter(|tx| before_id.map_or(true, |before| tx.id < before))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list(&self, query: &TransactionQuery) -> Result<Vec<StkTransaction>> {
        let table = self.table.read().await;
        let mut rows: Vec<StkTransaction> = table
            .rows
            .values()
            .filter(|tx| query.matches(tx))
            .cloned()
            .collect();
        query.sort(&mut rows);
        rows.truncate(query.limit.max(0) as usize);
        Ok(rows)
    }

    async fn count(&self, query: &TransactionQuery) -> Result<i64> {
        let query = TransactionQuery {
            cursor: None,
            ..query.clone()
        };
        let table = self.table.read().await;
        Ok(table.rows.values().filter(|tx| query.matches(tx)).count() as i64)
    }

    async fn mark_processed(&self, key: &TransactionKey) -> Result<Option<StkTransaction>> {
        let mut table = self.table.write().await;
        let Some(id) = table.find(key) else {
            return Ok(None);
        };
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if !row.processed {
            row.processed = true;
            row.updated_at = Utc::now();
        }
        Ok(Some(row.clone()))
    }
}

#[derive(Default)]
struct CacheEntries {
    requests: HashMap<String, (InitiateStkRequest, Instant)>,
    allowed_phones: HashMap<String, Vec<String>>,
}

#[derive(Default, Clone)]
pub struct InMemoryRequestCache {
    entries: Arc<RwLock<CacheEntries>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryRequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_allowed_phones(&self, user_id: &str, phones: Vec<String>) {
        self.entries
            .write()
            .await
            .allowed_phones
            .insert(user_id.to_string(), phones);
    }

    pub async fn remove(&self, checkout_request_id: &str) {
        self.entries.write().await.requests.remove(checkout_request_id);
    }

    /// Makes subsequent writes fail as if the cache were unreachable.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestCache for InMemoryRequestCache {
    async fn put_request(
        &self,
        checkout_request_id: &str,
        request: &InitiateStkRequest,
        ttl: Duration,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::RedisError("connection refused".into()));
        }
        self.entries.write().await.requests.insert(
            checkout_request_id.to_string(),
            (request.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn get_request(&self, checkout_request_id: &str) -> Result<Option<InitiateStkRequest>> {
        let entries = self.entries.read().await;
        Ok(entries
            .requests
            .get(checkout_request_id)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(request, _)| request.clone()))
    }

    async fn allowed_phones(&self, user_id: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries.allowed_phones.get(user_id).cloned().unwrap_or_default())
    }
}

/// Event bus over tokio broadcast channels that also records every publish.
#[derive(Default, Clone)]
pub struct InMemoryEventBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    published: Arc<Mutex<Vec<(String, String)>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<(String, String)> {
        self.published.lock().await.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Drops the channel, ending every open subscription to it.
    pub async fn close(&self, channel: &str) {
        self.channels.lock().await.remove(channel);
    }

    pub async fn subscribers(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::RedisError("connection refused".into()));
        }
        self.published
            .lock()
            .await
            .push((channel.to_string(), payload.clone()));
        // No subscribers is not an error for pub/sub.
        let _ = self.sender(channel).await.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::RedisError("connection refused".into()));
        }
        let rx = self.sender(channel).await.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
