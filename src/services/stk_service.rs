// services/stk_service.rs
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::credentials::Credentials;
use super::mpesa_service::{
    daraja_msisdn, daraja_timestamp, format_phone_number, stk_password, DarajaApi, StkPushRequest,
};
use crate::config::MpesaSettings;
use crate::database::ports::{EventBus, RequestCache, TransactionStore};
use crate::errors::{AppError, Result};
use crate::middleware::auth::{AuthApi, Claims};
use crate::models::initiate::{GetStkTransactionRequest, InitiateStkRequest, InitiateStkResponse};
use crate::models::list::{
    ListStkTransactionsRequest, ListStkTransactionsResponse, PageCursor, TransactionQuery,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
use crate::models::publish::{
    ProcessStkTransactionRequest, ProcessedState, PublishMessage, PublishStkTransactionRequest,
};
use crate::models::stk_transaction::{NewStkTransaction, RequestAck, StkTransaction, TransactionKey};

const DEFAULT_TRANSACTION_DESC: &str = "NA";

/// Result of accepting an initiation. `task` completes once the push call
/// has been resolved and recorded on the transaction.
pub struct Initiated {
    pub transaction: StkTransaction,
    pub response: InitiateStkResponse,
    pub task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct StkService {
    store: Arc<dyn TransactionStore>,
    cache: Arc<dyn RequestCache>,
    bus: Arc<dyn EventBus>,
    api: Arc<dyn DarajaApi>,
    credentials: Arc<Credentials>,
    settings: Arc<MpesaSettings>,
    auth: Arc<AuthApi>,
}

impl StkService {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        cache: Arc<dyn RequestCache>,
        bus: Arc<dyn EventBus>,
        api: Arc<dyn DarajaApi>,
        credentials: Arc<Credentials>,
        settings: MpesaSettings,
        auth: Arc<AuthApi>,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            api,
            credentials,
            settings: Arc::new(settings),
            auth,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn RequestCache> {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn api(&self) -> &Arc<dyn DarajaApi> {
        &self.api
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn settings(&self) -> &MpesaSettings {
        &self.settings
    }

    pub fn auth(&self) -> &Arc<AuthApi> {
        &self.auth
    }

    /// Persists a SUBMITTED record and hands the push call to a detached task.
    pub async fn initiate(&self, mut request: InitiateStkRequest) -> Result<Initiated> {
        request.check()?;

        let phone_number = format_phone_number(&request.phone);
        let short_code = non_empty_or(&request.short_code, &self.settings.short_code);
        let account_reference =
            non_empty_or(&request.account_reference, &self.settings.account_reference);
        let amount = request.amount.normalize().to_string();

        request
            .publish_message
            .get_or_insert_with(Default::default)
            .payload
            .insert("short_code".to_string(), short_code.clone());

        let transaction_desc = Some(request.transaction_desc.trim().to_string()).filter(|d| !d.is_empty());

        let transaction = self
            .store
            .create(NewStkTransaction {
                initiator_id: request.initiator_id.clone(),
                initiator_customer_reference: request.initiator_customer_reference.clone(),
                initiator_customer_names: request.initiator_customer_names.clone(),
                phone_number: phone_number.clone(),
                amount: amount.clone(),
                short_code: short_code.clone(),
                account_reference: account_reference.clone(),
                transaction_desc: transaction_desc.clone(),
            })
            .await?;

        info!(
            transaction_id = transaction.id,
            phone = %phone_number,
            amount = %amount,
            "stk push submitted"
        );

        let timestamp = daraja_timestamp(Utc::now());
        let msisdn = daraja_msisdn(&phone_number);
        let push = StkPushRequest {
            business_short_code: short_code.clone(),
            password: stk_password(&short_code, &self.settings.passkey, &timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount,
            party_a: msisdn.clone(),
            party_b: short_code,
            phone_number: msisdn,
            callback_url: self.settings.callback_url.clone(),
            account_reference,
            transaction_desc: transaction_desc.unwrap_or_else(|| DEFAULT_TRANSACTION_DESC.to_string()),
        };

        let service = self.clone();
        let transaction_id = transaction.id;
        let task = tokio::spawn(async move {
            service.complete_push(transaction_id, push, request).await;
        });

        Ok(Initiated {
            transaction,
            response: InitiateStkResponse {
                progress: true,
                message: "Processing. Stk popup will come shortly".to_string(),
            },
            task,
        })
    }

    async fn send_push(&self, push: &StkPushRequest) -> Result<RequestAck> {
        let token = self.credentials.access_token();
        let response = self.api.stk_push(&token, push).await?;

        if response.checkout_request_id.trim().is_empty() {
            return Err(AppError::mpesa("stk request failed: missing CheckoutRequestID"));
        }

        Ok(RequestAck {
            merchant_request_id: response.merchant_request_id,
            checkout_request_id: response.checkout_request_id,
            response_code: response.response_code,
            response_description: response.response_description,
            customer_message: response.customer_message,
        })
    }

    /// Resolves the push call. Every failure ends on the record as
    /// REQUEST_FAILED; nothing is returned to the caller.
    async fn complete_push(&self, transaction_id: i64, push: StkPushRequest, request: InitiateStkRequest) {
        let outcome = match tokio::time::timeout(self.settings.push_timeout, self.send_push(&push)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::mpesa("stk push timed out")),
        };

        let ack = match outcome {
            Ok(ack) => ack,
            Err(e) => {
                warn!(transaction_id, error = %e, "stk push failed");
                self.record_failure(transaction_id, &e.to_string()).await;
                return;
            }
        };

        match self.store.mark_request_success(transaction_id, &ack).await {
            Ok(Some(_)) => {
                info!(transaction_id, checkout_id = %ack.checkout_request_id, "stk push accepted");
            }
            Ok(None) => {
                debug!(transaction_id, "transaction already moved past SUBMITTED");
            }
            Err(e) => {
                error!(transaction_id, error = %e, "failed to record stk acknowledgment");
                self.record_failure(transaction_id, "failed to update stk payload").await;
                return;
            }
        }

        if let Err(e) = self
            .cache
            .put_request(&ack.checkout_request_id, &request, self.settings.request_cache_ttl)
            .await
        {
            warn!(checkout_id = %ack.checkout_request_id, error = %e, "failed to cache initiate request");
        }
    }

    async fn record_failure(&self, transaction_id: i64, reason: &str) {
        if let Err(e) = self.store.mark_request_failed(transaction_id, reason).await {
            error!(transaction_id, error = %e, "failed to record stk failure");
        }
    }

    pub async fn get(&self, request: &GetStkTransactionRequest) -> Result<StkTransaction> {
        let key = request.key()?;
        self.store
            .get(&key)
            .await?
            .ok_or_else(|| AppError::not_found(format!("stk transaction with {} does not exist", key)))
    }

    pub async fn list(
        &self,
        claims: &Claims,
        request: &ListStkTransactionsRequest,
    ) -> Result<ListStkTransactionsResponse> {
        if request.page_size < 0 {
            return Err(AppError::invalid_data("incorrect value for page size"));
        }

        let page_size = match request.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n if n > DEFAULT_PAGE_SIZE && !self.auth.is_admin(claims) => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let allowed_phones = self.cache.allowed_phones(&claims.sub).await?;
        let query = TransactionQuery::from_request(request, page_size, allowed_phones)?;

        let first_page = request.page_token.trim().is_empty();
        let unfiltered = request.filter.as_ref().map_or(true, |f| !f.has_criteria());
        let collection_count = if first_page && unfiltered {
            self.store.count(&query).await?
        } else {
            0
        };

        let mut rows = self.store.list(&query).await?;
        let has_more = rows.len() as i64 > page_size;
        rows.truncate(page_size as usize);

        let next_page_token = match rows.last() {
            Some(last) if has_more => PageCursor::after(query.order, last).encode(),
            _ => String::new(),
        };

        Ok(ListStkTransactionsResponse {
            next_page_token,
            stk_transactions: rows,
            collection_count,
        })
    }

    /// Marks a transaction consumed downstream. Only `processed = true` is
    /// accepted; repeating it is a no-op.
    pub async fn process(
        &self,
        claims: &Claims,
        request: &ProcessStkTransactionRequest,
    ) -> Result<StkTransaction> {
        self.auth.require_admin(claims)?;

        let key = TransactionKey::from_parts(request.transaction_id, &request.mpesa_receipt_id)
            .ok_or_else(|| AppError::missing_field("transaction/mpesa id"))?;
        if !request.processed {
            return Err(AppError::invalid_data("processed state cannot be reverted"));
        }

        let transaction = self
            .store
            .mark_processed(&key)
            .await?
            .ok_or_else(|| AppError::not_found(format!("stk transaction with {} does not exist", key)))?;

        info!(transaction_id = transaction.id, "stk transaction processed");
        Ok(transaction)
    }

    pub async fn publish(&self, claims: &Claims, request: PublishStkTransactionRequest) -> Result<bool> {
        self.auth.require_admin(claims)?;

        let message = request
            .publish_message
            .ok_or_else(|| AppError::missing_field("publish message"))?;

        self.publish_event(message, request.processed_state).await
    }

    /// Publishes `message` when its channel is set and `gate` admits the
    /// record's current processed flag. Returns whether anything was sent.
    pub async fn publish_event(&self, mut message: PublishMessage, gate: ProcessedState) -> Result<bool> {
        let channel = message.channel_name().trim().to_string();
        if channel.is_empty() {
            return Ok(false);
        }

        if message.transaction_id > 0 {
            if let Some(current) = self.store.get(&TransactionKey::Id(message.transaction_id)).await? {
                message.transaction_info = current;
            }
        }

        if !gate.admits(message.transaction_info.processed) {
            debug!(transaction_id = message.transaction_id, ?gate, "publish gate closed");
            return Ok(false);
        }

        let payload = serde_json::to_string(&message)
            .map_err(|e| AppError::service(format!("failed to encode publish message: {}", e)))?;
        self.bus.publish(&channel, payload).await?;

        info!(transaction_id = message.transaction_id, channel = %channel, "stk transaction published");
        Ok(true)
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    match value.trim() {
        "" => default.to_string(),
        v => v.to_string(),
    }
}
