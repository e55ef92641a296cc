// services/callback_service.rs
use chrono::Utc;
use tracing::{info, warn};

use super::mpesa_service::format_phone_number;
use super::stk_service::StkService;
use crate::errors::Result;
use crate::models::callback::StkCallbackPayload;
use crate::models::initiate::InitiateStkRequest;
use crate::models::publish::{ProcessedState, PublishMessage};
use crate::models::stk_transaction::{CallbackResult, NewStkTransaction, StkStatus, StkTransaction};

#[derive(Debug)]
pub struct IngestOutcome {
    pub transaction: StkTransaction,
    pub published: bool,
}

impl StkService {
    /// Applies a network callback to the transaction holding its checkout id,
    /// creating the record when none exists, then fans out if the original
    /// request asked for it.
    pub async fn ingest_callback(&self, payload: StkCallbackPayload) -> Result<IngestOutcome> {
        let callback = payload.body.stk_callback;
        callback.validate()?;

        let checkout_id = callback.checkout_request_id.trim().to_string();
        let status = if callback.succeeded() {
            StkStatus::StkSuccess
        } else {
            StkStatus::StkFailed
        };
        let metadata = callback.metadata();

        let cached = match self.cache().get_request(&checkout_id).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(checkout_id = %checkout_id, error = %e, "request cache lookup failed");
                None
            }
        };
        if cached.is_none() {
            info!(checkout_id = %checkout_id, "no cached request for callback");
        }

        let context = match &cached {
            Some(request) => self.context_from_request(request),
            None => NewStkTransaction {
                phone_number: metadata
                    .and_then(|m| m.phone_number())
                    .map(|p| format_phone_number(&p))
                    .unwrap_or_default(),
                amount: metadata.and_then(|m| m.amount()).unwrap_or_default(),
                short_code: self.settings().short_code.clone(),
                account_reference: self.settings().account_reference.clone(),
                ..Default::default()
            },
        };

        let result = CallbackResult {
            merchant_request_id: callback.merchant_request_id.trim().to_string(),
            checkout_request_id: checkout_id.clone(),
            result_code: callback.result_code.to_string(),
            result_description: callback.result_desc.clone(),
            mpesa_receipt_id: metadata.and_then(|m| m.receipt_number()),
            transaction_time: metadata
                .and_then(|m| m.transaction_time())
                .unwrap_or_else(Utc::now),
            status,
        };

        let transaction = self.store().upsert_callback(context, &result).await?;
        info!(
            transaction_id = transaction.id,
            checkout_id = %checkout_id,
            status = %transaction.stk_status,
            "stk callback applied"
        );

        let published = match &cached {
            Some(request) => self.fan_out(request, &transaction).await,
            None => false,
        };

        Ok(IngestOutcome {
            transaction,
            published,
        })
    }

    fn context_from_request(&self, request: &InitiateStkRequest) -> NewStkTransaction {
        let settings = self.settings();
        NewStkTransaction {
            initiator_id: request.initiator_id.clone(),
            initiator_customer_reference: request.initiator_customer_reference.clone(),
            initiator_customer_names: request.initiator_customer_names.clone(),
            phone_number: format_phone_number(&request.phone),
            amount: request.amount.normalize().to_string(),
            short_code: request
                .effective_short_code()
                .unwrap_or(settings.short_code.as_str())
                .to_string(),
            account_reference: Some(request.account_reference.trim())
                .filter(|r| !r.is_empty())
                .unwrap_or(settings.account_reference.as_str())
                .to_string(),
            transaction_desc: Some(request.transaction_desc.trim().to_string()).filter(|d| !d.is_empty()),
        }
    }

    async fn fan_out(&self, request: &InitiateStkRequest, transaction: &StkTransaction) -> bool {
        if !request.publish {
            return false;
        }
        let only_on_success = request
            .publish_message
            .as_ref()
            .map_or(false, |p| p.only_on_success);
        if only_on_success && !transaction.succeeded {
            return false;
        }

        let message = PublishMessage::new(request, transaction);
        match self.publish_event(message, ProcessedState::Unspecified).await {
            Ok(published) => published,
            Err(e) => {
                warn!(transaction_id = transaction.id, error = %e, "failed to publish stk transaction");
                false
            }
        }
    }
}
