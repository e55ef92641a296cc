use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::time::Duration;

use crate::errors::Result;
use crate::models::initiate::InitiateStkRequest;
use crate::models::list::TransactionQuery;
use crate::models::stk_transaction::{
    CallbackResult, NewStkTransaction, QueryResult, RequestAck, StkTransaction, TransactionKey,
};

/// Owner of the STK transaction lifecycle records.
///
/// Every update is conditional on the current status so that no writer can
/// move a record backwards, and every write keyed by a correlation id is
/// idempotent.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts a SUBMITTED record.
    async fn create(&self, tx: NewStkTransaction) -> Result<StkTransaction>;

    async fn get(&self, key: &TransactionKey) -> Result<Option<StkTransaction>>;

    async fn get_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<StkTransaction>>;

    /// SUBMITTED → REQUEST_SUCCESS. `None` when the record already moved on.
    async fn mark_request_success(&self, id: i64, ack: &RequestAck) -> Result<Option<StkTransaction>>;

    /// SUBMITTED → REQUEST_FAILED. `None` when the record already moved on.
    async fn mark_request_failed(&self, id: i64, reason: &str) -> Result<Option<StkTransaction>>;

    /// Updates the record holding `result.checkout_request_id`, or creates it
    /// from `context` when none exists. Never touches `processed`.
    async fn upsert_callback(
        &self,
        context: NewStkTransaction,
        result: &CallbackResult,
    ) -> Result<StkTransaction>;

    /// Applies a status-query outcome to a record still awaiting its result.
    /// An existing receipt id is never replaced.
    async fn apply_query_result(&self, id: i64, result: &QueryResult) -> Result<Option<StkTransaction>>;

    /// One page of records awaiting a result that were created before
    /// `older_than`, newest first, strictly below `before_id` when given.
    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<StkTransaction>>;

    async fn list(&self, query: &TransactionQuery) -> Result<Vec<StkTransaction>>;

    /// Number of rows matching `query`, ignoring its cursor and limit.
    async fn count(&self, query: &TransactionQuery) -> Result<i64>;

    /// Sets `processed` to true. `None` when no record matches.
    async fn mark_processed(&self, key: &TransactionKey) -> Result<Option<StkTransaction>>;
}

/// Short-lived storage of initiation requests, keyed by checkout id.
#[async_trait]
pub trait RequestCache: Send + Sync {
    async fn put_request(
        &self,
        checkout_request_id: &str,
        request: &InitiateStkRequest,
        ttl: Duration,
    ) -> Result<()>;

    async fn get_request(&self, checkout_request_id: &str) -> Result<Option<InitiateStkRequest>>;

    /// Phone numbers a user is restricted to when listing.
    async fn allowed_phones(&self, user_id: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

pub fn request_key(checkout_request_id: &str) -> String {
    format!("stk:{}", checkout_request_id)
}

pub fn allowed_phones_key(user_id: &str) -> String {
    format!("stk:user:{}:allowedphones", user_id)
}
