// models/publish.rs
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::initiate::InitiateStkRequest;
use super::stk_transaction::StkTransaction;

/// Where and when a completed transaction should be announced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishInfo {
    pub only_on_success: bool,
    pub channel_name: String,
    pub payload: HashMap<String, String>,
}

/// Filter over the `processed` flag, used both as a publish gate and as a
/// list filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessedState {
    #[default]
    Unspecified,
    Processed,
    NotProcessed,
}

impl ProcessedState {
    pub fn admits(&self, processed: bool) -> bool {
        match self {
            ProcessedState::Unspecified => true,
            ProcessedState::Processed => processed,
            ProcessedState::NotProcessed => !processed,
        }
    }

    pub fn as_filter(&self) -> Option<bool> {
        match self {
            ProcessedState::Unspecified => None,
            ProcessedState::Processed => Some(true),
            ProcessedState::NotProcessed => Some(false),
        }
    }
}

/// Event written to a pub/sub channel when a transaction completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub initiator_id: String,
    pub transaction_id: i64,
    pub mpesa_receipt_id: String,
    pub phone_number: String,
    pub publish_info: PublishInfo,
    pub transaction_info: StkTransaction,
}

impl PublishMessage {
    pub fn new(request: &InitiateStkRequest, transaction: &StkTransaction) -> Self {
        Self {
            initiator_id: request.initiator_id.clone(),
            transaction_id: transaction.id,
            mpesa_receipt_id: transaction.mpesa_receipt_id.clone().unwrap_or_default(),
            phone_number: transaction.phone_number.clone(),
            publish_info: request.publish_message.clone().unwrap_or_default(),
            transaction_info: transaction.clone(),
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.publish_info.channel_name
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishStkTransactionRequest {
    pub publish_message: Option<PublishMessage>,
    #[serde(default)]
    pub processed_state: ProcessedState,
}

/// Marks a transaction consumed downstream. Also the wire shape of messages
/// on the process control channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStkTransactionRequest {
    #[serde(default)]
    pub transaction_id: i64,
    #[serde(default)]
    pub mpesa_receipt_id: String,
    pub processed: bool,
}
