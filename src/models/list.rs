// models/list.rs
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::publish::ProcessedState;
use super::stk_transaction::{StkStatus, StkTransaction};
use crate::errors::{AppError, Result};

pub const DEFAULT_PAGE_SIZE: i64 = 100;
/// Ceiling for admin page sizes.
pub const MAX_PAGE_SIZE: i64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderField {
    #[default]
    CreateTimestamp,
    TransactionTimestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFilter {
    pub order_field: OrderField,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub tx_date: String,
    pub msisdns: Vec<String>,
    pub mpesa_receipts: Vec<String>,
    pub initiator_customer_references: Vec<String>,
    pub short_codes: Vec<String>,
    pub stk_statuses: Vec<StkStatus>,
    pub process_state: ProcessedState,
}

impl ListFilter {
    /// True when anything beyond ordering narrows the result set.
    pub fn has_criteria(&self) -> bool {
        self.end_timestamp > self.start_timestamp
            || !self.tx_date.trim().is_empty()
            || !self.msisdns.is_empty()
            || !self.mpesa_receipts.is_empty()
            || !self.initiator_customer_references.is_empty()
            || !self.short_codes.is_empty()
            || !self.stk_statuses.is_empty()
            || self.process_state != ProcessedState::Unspecified
    }

    /// Half-open `[start, end)` window the filter selects.
    fn time_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        if self.end_timestamp > self.start_timestamp {
            let start = Utc
                .timestamp_opt(self.start_timestamp, 0)
                .single()
                .ok_or_else(|| AppError::invalid_data("invalid start timestamp"))?;
            let end = Utc
                .timestamp_opt(self.end_timestamp, 0)
                .single()
                .ok_or_else(|| AppError::invalid_data("invalid end timestamp"))?;
            // The end second itself is included.
            return Ok(Some((start, end + Duration::seconds(1))));
        }

        let date = self.tx_date.trim();
        if date.is_empty() {
            return Ok(None);
        }
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| AppError::invalid_data("failed to parse date to time"))?;
        let start = day
            .and_hms_opt(0, 0, 0)
            .map(|t| Utc.from_utc_datetime(&t))
            .ok_or_else(|| AppError::invalid_data("failed to parse date to time"))?;
        Ok(Some((start, start + Duration::hours(24))))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListStkTransactionsRequest {
    pub page_size: i64,
    pub page_token: String,
    pub filter: Option<ListFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListStkTransactionsResponse {
    pub next_page_token: String,
    pub stk_transactions: Vec<StkTransaction>,
    pub collection_count: i64,
}

/// Position after the last row of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCursor {
    Id(i64),
    TransactionTime { time: DateTime<Utc>, id: i64 },
}

impl PageCursor {
    pub fn after(order: OrderField, tx: &StkTransaction) -> Self {
        match order {
            OrderField::CreateTimestamp => PageCursor::Id(tx.id),
            OrderField::TransactionTimestamp => PageCursor::TransactionTime {
                time: tx.transaction_time,
                id: tx.id,
            },
        }
    }

    pub fn encode(&self) -> String {
        let raw = match self {
            PageCursor::Id(id) => id.to_string(),
            PageCursor::TransactionTime { time, id } => {
                format!("{}|{}", time.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true), id)
            }
        };
        base64.encode(raw)
    }

    pub fn decode(token: &str, order: OrderField) -> Result<Self> {
        let invalid = || AppError::invalid_data("failed to parse page token");

        let bytes = base64.decode(token.trim()).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;

        match order {
            OrderField::CreateTimestamp => raw.parse().map(PageCursor::Id).map_err(|_| invalid()),
            OrderField::TransactionTimestamp => {
                let (time, id) = raw.split_once('|').ok_or_else(invalid)?;
                let time = DateTime::parse_from_rfc3339(time)
                    .map_err(|_| invalid())?
                    .with_timezone(&Utc);
                let id = id.parse().map_err(|_| invalid())?;
                Ok(PageCursor::TransactionTime { time, id })
            }
        }
    }

    fn precedes(&self, tx: &StkTransaction) -> bool {
        match self {
            PageCursor::Id(id) => tx.id < *id,
            PageCursor::TransactionTime { time, id } => {
                (tx.transaction_time, tx.id) < (*time, *id)
            }
        }
    }
}

/// A list request resolved into store predicates.
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub order: OrderField,
    pub cursor: Option<PageCursor>,
    pub limit: i64,
    /// Start inclusive, end exclusive.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub allowed_phones: Vec<String>,
    pub phones: Vec<String>,
    pub receipts: Vec<String>,
    pub customer_references: Vec<String>,
    pub short_codes: Vec<String>,
    pub statuses: Vec<StkStatus>,
    pub processed: Option<bool>,
}

impl TransactionQuery {
    pub fn from_request(
        request: &ListStkTransactionsRequest,
        page_size: i64,
        allowed_phones: Vec<String>,
    ) -> Result<Self> {
        let filter = request.filter.clone().unwrap_or_default();
        let order = filter.order_field;

        let cursor = if request.page_token.trim().is_empty() {
            None
        } else {
            Some(PageCursor::decode(&request.page_token, order)?)
        };

        Ok(Self {
            order,
            cursor,
            limit: page_size.saturating_add(1),
            time_range: filter.time_range()?,
            allowed_phones,
            phones: filter.msisdns,
            receipts: filter.mpesa_receipts,
            customer_references: filter.initiator_customer_references,
            short_codes: filter.short_codes,
            statuses: filter.stk_statuses,
            processed: filter.process_state.as_filter(),
        })
    }

    pub fn status_names(&self) -> Vec<String> {
        self.statuses.iter().map(|s| s.as_str().to_string()).collect()
    }

    /// In-process evaluation of the same predicates the SQL store applies.
    pub fn matches(&self, tx: &StkTransaction) -> bool {
        fn within(values: &[String], value: &str) -> bool {
            values.is_empty() || values.iter().any(|v| v == value)
        }

        if let Some(cursor) = &self.cursor {
            if !cursor.precedes(tx) {
                return false;
            }
        }
        if let Some((start, end)) = self.time_range {
            let at = match self.order {
                OrderField::CreateTimestamp => tx.created_at,
                OrderField::TransactionTimestamp => tx.transaction_time,
            };
            if at < start || at >= end {
                return false;
            }
        }

        within(&self.allowed_phones, &tx.phone_number)
            && within(&self.phones, &tx.phone_number)
            && within(&self.receipts, tx.mpesa_receipt_id.as_deref().unwrap_or_default())
            && within(&self.customer_references, &tx.initiator_customer_reference)
            && within(&self.short_codes, &tx.short_code)
            && (self.statuses.is_empty() || self.statuses.contains(&tx.stk_status))
            && self.processed.map_or(true, |p| tx.processed == p)
    }

    /// Descending sort matching the cursor order.
    pub fn sort(&self, rows: &mut [StkTransaction]) {
        match self.order {
            OrderField::CreateTimestamp => rows.sort_by(|a, b| b.id.cmp(&a.id)),
            OrderField::TransactionTimestamp => rows.sort_by(|a, b| {
                (b.transaction_time, b.id).cmp(&(a.transaction_time, a.id))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_cursor_survives_encoding() {
        let token = PageCursor::Id(42).encode();
        assert_eq!(
            PageCursor::decode(&token, OrderField::CreateTimestamp).unwrap(),
            PageCursor::Id(42)
        );
    }

    #[test]
    fn time_cursor_keeps_tiebreaker() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let cursor = PageCursor::TransactionTime { time, id: 9 };
        let decoded =
            PageCursor::decode(&cursor.encode(), OrderField::TransactionTimestamp).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn garbage_token_is_a_client_error() {
        assert!(matches!(
            PageCursor::decode("%%%", OrderField::CreateTimestamp),
            Err(AppError::ValidationError(_))
        ));
        let not_a_number = base64.encode("abc");
        assert!(PageCursor::decode(&not_a_number, OrderField::CreateTimestamp).is_err());
    }

    #[test]
    fn tx_date_expands_to_calendar_day() {
        let filter = ListFilter {
            tx_date: "2024-03-01".into(),
            ..Default::default()
        };
        let (start, end) = filter.time_range().unwrap().unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end - start, Duration::hours(24));
        assert!(filter.has_criteria());
    }

    fn stamped(at: DateTime<Utc>) -> StkTransaction {
        StkTransaction {
            id: 1,
            initiator_id: "user-1".into(),
            initiator_customer_reference: String::new(),
            initiator_customer_names: String::new(),
            phone_number: "+254712345678".into(),
            amount: "100".into(),
            short_code: "174379".into(),
            account_reference: "ACME".into(),
            transaction_desc: None,
            merchant_request_id: None,
            checkout_request_id: None,
            stk_response_code: None,
            stk_response_description: None,
            stk_response_customer_message: None,
            result_code: None,
            result_description: None,
            mpesa_receipt_id: None,
            stk_status: StkStatus::Submitted,
            succeeded: false,
            processed: false,
            transaction_time: at,
            created_at: at,
            updated_at: at,
        }
    }

    fn day_query(day: &str) -> TransactionQuery {
        let request = ListStkTransactionsRequest {
            filter: Some(ListFilter {
                tx_date: day.into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        TransactionQuery::from_request(&request, DEFAULT_PAGE_SIZE, vec![]).unwrap()
    }

    #[test]
    fn midnight_belongs_to_exactly_one_day() {
        let midnight = stamped(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
        assert!(!day_query("2024-03-01").matches(&midnight));
        assert!(day_query("2024-03-02").matches(&midnight));

        let last_second = stamped(Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap());
        assert!(day_query("2024-03-01").matches(&last_second));
    }

    #[test]
    fn explicit_range_includes_its_end_second() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let request = ListStkTransactionsRequest {
            filter: Some(ListFilter {
                start_timestamp: start.timestamp(),
                end_timestamp: end.timestamp(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let query = TransactionQuery::from_request(&request, DEFAULT_PAGE_SIZE, vec![]).unwrap();

        assert!(query.matches(&stamped(start)));
        assert!(query.matches(&stamped(end)));
        assert!(!query.matches(&stamped(end + Duration::seconds(1))));
    }

    #[test]
    fn limit_does_not_overflow() {
        let query =
            TransactionQuery::from_request(&ListStkTransactionsRequest::default(), i64::MAX, vec![])
                .unwrap();
        assert_eq!(query.limit, i64::MAX);
    }

    #[test]
    fn ordering_alone_is_not_a_criterion() {
        let filter = ListFilter {
            order_field: OrderField::TransactionTimestamp,
            ..Default::default()
        };
        assert!(!filter.has_criteria());
    }
}
