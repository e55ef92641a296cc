// models/callback.rs
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::errors::{AppError, Result};

// Callback Request
#[derive(Debug, Deserialize)]
pub struct StkCallbackPayload {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: String,

    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: String,

    #[serde(rename = "ResultCode")]
    pub result_code: i32,

    #[serde(rename = "ResultDesc", default)]
    pub result_desc: String,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

impl StkCallback {
    pub fn validate(&self) -> Result<()> {
        if self.checkout_request_id.trim().is_empty() {
            return Err(AppError::missing_field("checkout id"));
        }
        if self.merchant_request_id.trim().is_empty() {
            return Err(AppError::missing_field("merchant id"));
        }
        if self.result_desc.trim().is_empty() {
            return Err(AppError::missing_field("description"));
        }
        Ok(())
    }

    pub fn succeeded(&self) -> bool {
        self.result_code == 0
    }

    pub fn metadata(&self) -> Option<&CallbackMetadata> {
        self.callback_metadata.as_ref()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
}

/// Daraja reports transaction dates in East Africa Time.
const EAT_OFFSET_SECS: i32 = 3 * 3600;

impl CallbackMetadata {
    fn item(&self, name: &str) -> Option<String> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| match &item.value {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
    }

    pub fn receipt_number(&self) -> Option<String> {
        self.item("MpesaReceiptNumber")
    }

    pub fn amount(&self) -> Option<String> {
        self.item("Amount")
    }

    pub fn phone_number(&self) -> Option<String> {
        self.item("PhoneNumber")
    }

    pub fn transaction_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.item("TransactionDate")?;
        let naive = NaiveDateTime::parse_from_str(&raw, "%Y%m%d%H%M%S").ok()?;
        let eat = FixedOffset::east_opt(EAT_OFFSET_SECS)?;
        eat.from_local_datetime(&naive)
            .single()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const SUCCESS: &str = r#"{
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": 1.00},
                        {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                        {"Name": "Balance"},
                        {"Name": "TransactionDate", "Value": 20191219102115},
                        {"Name": "PhoneNumber", "Value": 254708374149}
                    ]
                }
            }
        }
    }"#;

    #[test]
    fn parses_success_metadata() {
        let payload: StkCallbackPayload = serde_json::from_str(SUCCESS).unwrap();
        let cb = payload.body.stk_callback;
        assert!(cb.validate().is_ok());
        assert!(cb.succeeded());

        let meta = cb.metadata().unwrap();
        assert_eq!(meta.receipt_number().as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(meta.phone_number().as_deref(), Some("254708374149"));
        assert_eq!(meta.amount().as_deref(), Some("1.0"));

        let time = meta.transaction_time().unwrap();
        assert_eq!(time.hour(), 7);
        assert_eq!(time.minute(), 21);
    }

    #[test]
    fn failure_callback_has_no_metadata() {
        let payload: StkCallbackPayload = serde_json::from_str(
            r#"{"Body":{"stkCallback":{"MerchantRequestID":"m1","CheckoutRequestID":"ws_1","ResultCode":1032,"ResultDesc":"Request cancelled by user"}}}"#,
        )
        .unwrap();
        let cb = payload.body.stk_callback;
        assert!(cb.validate().is_ok());
        assert!(!cb.succeeded());
        assert!(cb.metadata().is_none());
    }

    #[test]
    fn rejects_missing_identifiers() {
        let payload: StkCallbackPayload = serde_json::from_str(
            r#"{"Body":{"stkCallback":{"MerchantRequestID":"m1","ResultCode":0,"ResultDesc":"ok"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            payload.body.stk_callback.validate(),
            Err(AppError::ValidationError(m)) if m.contains("checkout id")
        ));
    }
}
