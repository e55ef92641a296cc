// models/stk_transaction.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an STK push.
///
/// `Submitted` is written by the initiator, the `Request*` states by the
/// push acknowledgment, `Stk*` by the network callback and `Result*` by the
/// reconciliation poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StkStatus {
    Submitted,
    RequestSuccess,
    RequestFailed,
    StkSuccess,
    StkFailed,
    ResultSuccess,
    ResultFailed,
}

impl StkStatus {
    /// States the reconciliation poller still queries the network for.
    pub const AWAITING_RESULT: [StkStatus; 2] = [StkStatus::Submitted, StkStatus::RequestSuccess];

    pub fn as_str(&self) -> &'static str {
        match self {
            StkStatus::Submitted => "SUBMITTED",
            StkStatus::RequestSuccess => "REQUEST_SUCCESS",
            StkStatus::RequestFailed => "REQUEST_FAILED",
            StkStatus::StkSuccess => "STK_SUCCESS",
            StkStatus::StkFailed => "STK_FAILED",
            StkStatus::ResultSuccess => "RESULT_SUCCESS",
            StkStatus::ResultFailed => "RESULT_FAILED",
        }
    }

    fn phase(&self) -> u8 {
        match self {
            StkStatus::Submitted => 0,
            StkStatus::RequestSuccess | StkStatus::RequestFailed => 1,
            _ => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StkStatus::StkSuccess | StkStatus::ResultSuccess)
    }

    pub fn is_awaiting_result(&self) -> bool {
        Self::AWAITING_RESULT.contains(self)
    }

    /// Forward-only transition rule. Outcome states may replace each other
    /// since callback and poll report the same underlying fact.
    pub fn can_transition_to(&self, next: StkStatus) -> bool {
        if *self == StkStatus::RequestFailed {
            return false;
        }
        next.phase() > self.phase() || (self.phase() == 2 && next.phase() == 2)
    }
}

impl fmt::Display for StkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown stk status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for StkStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(StkStatus::Submitted),
            "REQUEST_SUCCESS" => Ok(StkStatus::RequestSuccess),
            "REQUEST_FAILED" => Ok(StkStatus::RequestFailed),
            "STK_SUCCESS" => Ok(StkStatus::StkSuccess),
            "STK_FAILED" => Ok(StkStatus::StkFailed),
            "RESULT_SUCCESS" => Ok(StkStatus::ResultSuccess),
            "RESULT_FAILED" => Ok(StkStatus::ResultFailed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for StkStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StkTransaction {
    pub id: i64,
    pub initiator_id: String,
    pub initiator_customer_reference: String,
    pub initiator_customer_names: String,
    pub phone_number: String,
    pub amount: String,
    pub short_code: String,
    pub account_reference: String,
    pub transaction_desc: Option<String>,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub stk_response_code: Option<String>,
    pub stk_response_description: Option<String>,
    pub stk_response_customer_message: Option<String>,
    pub result_code: Option<String>,
    pub result_description: Option<String>,
    pub mpesa_receipt_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub stk_status: StkStatus,
    pub succeeded: bool,
    pub processed: bool,
    pub transaction_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a record that exist before the network has seen the push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewStkTransaction {
    pub initiator_id: String,
    pub initiator_customer_reference: String,
    pub initiator_customer_names: String,
    pub phone_number: String,
    pub amount: String,
    pub short_code: String,
    pub account_reference: String,
    pub transaction_desc: Option<String>,
}

/// Synchronous acknowledgment of an accepted push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestAck {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub response_code: String,
    pub response_description: String,
    pub customer_message: String,
}

/// Outcome reported by the network callback, keyed by checkout id.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackResult {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub result_code: String,
    pub result_description: String,
    pub mpesa_receipt_id: Option<String>,
    pub transaction_time: DateTime<Utc>,
    pub status: StkStatus,
}

/// Outcome obtained by the reconciliation status query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub response_code: Option<String>,
    pub response_description: Option<String>,
    pub result_code: String,
    pub result_description: String,
    pub mpesa_receipt_id: Option<String>,
    pub status: StkStatus,
}

/// Identifies the record a get or process operation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKey {
    Id(i64),
    Receipt(String),
}

impl TransactionKey {
    pub fn from_parts(transaction_id: i64, mpesa_receipt_id: &str) -> Option<Self> {
        if transaction_id > 0 {
            Some(TransactionKey::Id(transaction_id))
        } else if !mpesa_receipt_id.trim().is_empty() {
            Some(TransactionKey::Receipt(mpesa_receipt_id.trim().to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKey::Id(id) => write!(f, "transaction {}", id),
            TransactionKey::Receipt(receipt) => write!(f, "receipt {}", receipt),
        }
    }
}
