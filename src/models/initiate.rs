// models/initiate.rs
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::publish::PublishInfo;
use super::stk_transaction::TransactionKey;
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct InitiateStkRequest {
    #[validate(length(min = 1, message = "missing initiator id"))]
    pub initiator_id: String,
    pub initiator_customer_reference: String,
    pub initiator_customer_names: String,
    #[validate(length(min = 1, message = "missing phone"))]
    pub phone: String,
    pub amount: Decimal,
    #[validate(length(min = 1, message = "missing account reference"))]
    pub account_reference: String,
    pub short_code: String,
    pub transaction_desc: String,
    pub publish: bool,
    pub publish_message: Option<PublishInfo>,
}

impl InitiateStkRequest {
    /// Checks everything `initiate` needs before it touches storage.
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        if self.amount <= Decimal::ZERO {
            return Err(AppError::missing_field("amount"));
        }

        let channel = self
            .publish_message
            .as_ref()
            .map(|p| p.channel_name.trim())
            .unwrap_or_default();
        if self.publish && channel.is_empty() {
            return Err(AppError::missing_field("publish channel"));
        }

        Ok(())
    }

    /// Short code the push was sent with, as stamped into the publish payload.
    pub fn effective_short_code(&self) -> Option<&str> {
        self.publish_message
            .as_ref()
            .and_then(|p| p.payload.get("short_code"))
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| Some(self.short_code.as_str()).filter(|s| !s.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateStkResponse {
    pub progress: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GetStkTransactionRequest {
    pub transaction_id: i64,
    pub mpesa_receipt_id: String,
}

impl GetStkTransactionRequest {
    pub fn key(&self) -> Result<TransactionKey> {
        TransactionKey::from_parts(self.transaction_id, &self.mpesa_receipt_id)
            .ok_or_else(|| AppError::missing_field("transaction/mpesa id"))
    }
}
