// database/stk_repository.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::ports::TransactionStore;
use crate::errors::Result;
use crate::models::list::{OrderField, PageCursor, TransactionQuery};
use crate::models::stk_transaction::{
    CallbackResult, NewStkTransaction, QueryResult, RequestAck, StkStatus, StkTransaction,
    TransactionKey,
};

#[derive(Clone)]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &TransactionQuery, with_cursor: bool) {
        qb.push(" WHERE TRUE");

        if with_cursor {
            match query.cursor {
                Some(PageCursor::Id(id)) => {
                    qb.push(" AND id < ").push_bind(id);
                }
                Some(PageCursor::TransactionTime { time, id }) => {
                    qb.push(" AND (transaction_time, id) < (")
                        .push_bind(time)
                        .push(", ")
                        .push_bind(id)
                        .push(")");
                }
                None => {}
            }
        }

        if let Some((start, end)) = query.time_range {
            let column = match query.order {
                OrderField::CreateTimestamp => "created_at",
                OrderField::TransactionTimestamp => "transaction_time",
            };
            qb.push(format!(" AND {} >= ", column))
                .push_bind(start)
                .push(format!(" AND {} < ", column))
                .push_bind(end);
        }

        let lists = [
            ("phone_number", &query.allowed_phones),
            ("phone_number", &query.phones),
            ("mpesa_receipt_id", &query.receipts),
            ("initiator_customer_reference", &query.customer_references),
            ("short_code", &query.short_codes),
        ];
        for (column, values) in lists {
            if !values.is_empty() {
                qb.push(format!(" AND {} = ANY(", column))
                    .push_bind(values.clone())
                    .push(")");
            }
        }

        if !query.statuses.is_empty() {
            qb.push(" AND stk_status = ANY(")
                .push_bind(query.status_names())
                .push(")");
        }

        if let Some(processed) = query.processed {
            qb.push(" AND processed = ").push_bind(processed);
        }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn create(&self, tx: NewStkTransaction) -> Result<StkTransaction> {
        let created = sqlx::query_as::<_, StkTransaction>(
            r#"
            INSERT INTO stk_transactions (
                initiator_id, initiator_customer_reference, initiator_customer_names,
                phone_number, amount, short_code, account_reference, transaction_desc,
                stk_status, succeeded, processed, transaction_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, FALSE, NOW())
            RETURNING *
            "#,
        )
        .bind(&tx.initiator_id)
        .bind(&tx.initiator_customer_reference)
        .bind(&tx.initiator_customer_names)
        .bind(&tx.phone_number)
        .bind(&tx.amount)
        .bind(&tx.short_code)
        .bind(&tx.account_reference)
        .bind(&tx.transaction_desc)
        .bind(StkStatus::Submitted.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn get(&self, key: &TransactionKey) -> Result<Option<StkTransaction>> {
        let row = match key {
            TransactionKey::Id(id) => {
                sqlx::query_as::<_, StkTransaction>("SELECT * FROM stk_transactions WHERE id = $1")
                    .bind(*id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            TransactionKey::Receipt(receipt) => {
                sqlx::query_as::<_, StkTransaction>(
                    "SELECT * FROM stk_transactions WHERE mpesa_receipt_id = $1",
                )
                .bind(receipt)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row)
    }

    async fn get_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<StkTransaction>> {
        let row = sqlx::query_as::<_, StkTransaction>(
            "SELECT * FROM stk_transactions WHERE checkout_request_id = $1",
        )
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_request_success(&self, id: i64, ack: &RequestAck) -> Result<Option<StkTransaction>> {
        let row = sqlx::query_as::<_, StkTransaction>(
            r#"
            UPDATE stk_transactions
            SET merchant_request_id = NULLIF($2, ''),
                checkout_request_id = NULLIF($3, ''),
                stk_response_code = NULLIF($4, ''),
                stk_response_description = NULLIF($5, ''),
                stk_response_customer_message = NULLIF($6, ''),
                stk_status = $7,
                succeeded = FALSE,
                transaction_time = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND stk_status = $8
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&ack.merchant_request_id)
        .bind(&ack.checkout_request_id)
        .bind(&ack.response_code)
        .bind(&ack.response_description)
        .bind(&ack.customer_message)
        .bind(StkStatus::RequestSuccess.as_str())
        .bind(StkStatus::Submitted.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_request_failed(&self, id: i64, reason: &str) -> Result<Option<StkTransaction>> {
        let row = sqlx::query_as::<_, StkTransaction>(
            r#"
            UPDATE stk_transactions
            SET stk_response_description = $2,
                stk_status = $3,
                succeeded = FALSE,
                transaction_time = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND stk_status = $4
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(StkStatus::RequestFailed.as_str())
        .bind(StkStatus::Submitted.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_callback(
        &self,
        context: NewStkTransaction,
        result: &CallbackResult,
    ) -> Result<StkTransaction> {
        // The conflict target makes concurrent deliveries of the same callback
        // converge on one row.
        let row = sqlx::query_as::<_, StkTransaction>(
            r#"
            INSERT INTO stk_transactions (
                initiator_id, initiator_customer_reference, initiator_customer_names,
                phone_number, amount, short_code, account_reference, transaction_desc,
                merchant_request_id, checkout_request_id, result_code, result_description,
                mpesa_receipt_id, stk_status, succeeded, processed, transaction_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, FALSE, $16)
            ON CONFLICT (checkout_request_id) DO UPDATE
            SET result_code = EXCLUDED.result_code,
                result_description = EXCLUDED.result_description,
                mpesa_receipt_id = COALESCE(EXCLUDED.mpesa_receipt_id, stk_transactions.mpesa_receipt_id),
                transaction_time = EXCLUDED.transaction_time,
                stk_status = EXCLUDED.stk_status,
                succeeded = EXCLUDED.succeeded,
                updated_at = NOW()
            WHERE stk_transactions.stk_status <> $17
            RETURNING *
            "#,
        )
        .bind(&context.initiator_id)
        .bind(&context.initiator_customer_reference)
        .bind(&context.initiator_customer_names)
        .bind(&context.phone_number)
        .bind(&context.amount)
        .bind(&context.short_code)
        .bind(&context.account_reference)
        .bind(&context.transaction_desc)
        .bind(&result.merchant_request_id)
        .bind(&result.checkout_request_id)
        .bind(&result.result_code)
        .bind(&result.result_description)
        .bind(&result.mpesa_receipt_id)
        .bind(result.status.as_str())
        .bind(result.status.is_success())
        .bind(result.transaction_time)
        .bind(StkStatus::RequestFailed.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row),
            // The guard rejected the update; report the row as it stands.
            None => self
                .get_by_checkout_id(&result.checkout_request_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound.into()),
        }
    }

    async fn apply_query_result(&self, id: i64, result: &QueryResult) -> Result<Option<StkTransaction>> {
        let row = sqlx::query_as::<_, StkTransaction>(
            r#"
            UPDATE stk_transactions
            SET stk_response_code = COALESCE($2, stk_response_code),
                stk_response_description = COALESCE($3, stk_response_description),
                result_code = $4,
                result_description = $5,
                mpesa_receipt_id = COALESCE(mpesa_receipt_id, $6),
                stk_status = $7,
                succeeded = $8,
                transaction_time = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND stk_status = ANY($9)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&result.response_code)
        .bind(&result.response_description)
        .bind(&result.result_code)
        .bind(&result.result_description)
        .bind(&result.mpesa_receipt_id)
        .bind(result.status.as_str())
        .bind(result.status.is_success())
        .bind(awaiting_result_names())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<StkTransaction>> {
        let rows = sqlx::query_as::<_, StkTransaction>(
            r#"
            SELECT * FROM stk_transactions
            WHERE stk_status = ANY($1)
              AND checkout_request_id IS NOT NULL
              AND created_at < $2
              AND ($3::BIGINT IS NULL OR id < $3)
            ORDER BY id DESC
            LIMIT $4
            "#,
        )
        .bind(awaiting_result_names())
        .bind(older_than)
        .bind(before_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list(&self, query: &TransactionQuery) -> Result<Vec<StkTransaction>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM stk_transactions");
        Self::push_filters(&mut qb, query, true);

        match query.order {
            OrderField::CreateTimestamp => qb.push(" ORDER BY id DESC"),
            OrderField::TransactionTimestamp => qb.push(" ORDER BY transaction_time DESC, id DESC"),
        };
        qb.push(" LIMIT ").push_bind(query.limit);

        let rows = qb
            .build_query_as::<StkTransaction>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn count(&self, query: &TransactionQuery) -> Result<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM stk_transactions");
        Self::push_filters(&mut qb, query, false);

        let count = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn mark_processed(&self, key: &TransactionKey) -> Result<Option<StkTransaction>> {
        const SET_PROCESSED: &str = r#"
            UPDATE stk_transactions
            SET updated_at = CASE WHEN processed THEN updated_at ELSE NOW() END,
                processed = TRUE
        "#;

        let row = match key {
            TransactionKey::Id(id) => {
                sqlx::query_as::<_, StkTransaction>(&format!("{} WHERE id = $1 RETURNING *", SET_PROCESSED))
                    .bind(*id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            TransactionKey::Receipt(receipt) => {
                sqlx::query_as::<_, StkTransaction>(&format!(
                    "{} WHERE mpesa_receipt_id = $1 RETURNING *",
                    SET_PROCESSED
                ))
                .bind(receipt)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row)
    }
}

fn awaiting_result_names() -> Vec<String> {
    StkStatus::AWAITING_RESULT
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}
