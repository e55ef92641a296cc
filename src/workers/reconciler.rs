use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::pool::BoundedPool;
use crate::errors::{AppError, Result};
use crate::models::stk_transaction::{QueryResult, StkStatus, StkTransaction};
use crate::services::mpesa_service::{daraja_timestamp, stk_password, StkQueryRequest};
use crate::services::stk_service::StkService;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay before the first cycle
    pub warmup: Duration,
    /// Delay between cycles
    pub interval: Duration,
    /// Records younger than this are left to the callback
    pub stale_after: Duration,
    pub page_size: i64,
    pub concurrency: usize,
    /// Prefix of receipt ids synthesized for poll-confirmed payments
    pub system_id_prefix: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(20),
            interval: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(10 * 60),
            page_size: 1000,
            concurrency: 5,
            system_id_prefix: "SYS".to_string(),
        }
    }
}

/// Repairs transactions whose callback never arrived by querying their
/// status from the network.
pub struct Reconciler {
    service: StkService,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(service: StkService, config: ReconcilerConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            warmup_secs = self.config.warmup.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            concurrency = self.config.concurrency,
            "Reconciler started"
        );

        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Reconciler stopped during warmup");
                return;
            }
            _ = sleep(self.config.warmup) => {}
        }

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping reconciler");
                    break;
                }
                _ = ticker.tick() => {
                    match self.reconcile_cycle().await {
                        Ok(updated) => info!(updated, "reconciliation cycle finished"),
                        Err(e) => error!(error = %e, "reconciliation cycle aborted"),
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// One pass over every stale pending record. Returns how many status
    /// queries completed.
    pub async fn reconcile_cycle(&self) -> Result<usize> {
        let token = self.service.credentials().access_token();
        if token.is_empty() {
            return Err(AppError::ServiceUnavailable(
                "no M-Pesa access token, skipping reconciliation".to_string(),
            ));
        }

        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| AppError::configuration(format!("invalid staleness window: {}", e)))?;
        let older_than = Utc::now() - stale_after;

        let query = StatusQuery {
            service: self.service.clone(),
            access_token: Arc::from(token),
            system_id_prefix: Arc::from(self.config.system_id_prefix.as_str()),
        };

        let mut before_id = None;
        let mut completed = 0;

        loop {
            let page = self
                .service
                .store()
                .find_stale_pending(older_than, before_id, self.config.page_size)
                .await?;
            let fetched = page.len() as i64;
            before_id = page.last().map(|tx| tx.id).or(before_id);
            debug!(fetched, ?before_id, "reconciliation page");

            let mut pool = BoundedPool::new(self.config.concurrency);
            for tx in page {
                let query = query.clone();
                pool.spawn(async move { query.run(tx).await }).await;
            }
            completed += pool.join().await;

            if fetched < self.config.page_size {
                break;
            }
        }

        Ok(completed)
    }
}

/// Everything a single status query needs, cloned into each pooled task.
#[derive(Clone)]
struct StatusQuery {
    service: StkService,
    access_token: Arc<str>,
    system_id_prefix: Arc<str>,
}

impl StatusQuery {
    async fn run(self, tx: StkTransaction) -> Result<()> {
        let settings = self.service.settings();
        let checkout_request_id = tx
            .checkout_request_id
            .clone()
            .ok_or_else(|| AppError::missing_field("checkout id"))?;
        let short_code = match tx.short_code.trim() {
            "" => settings.short_code.clone(),
            code => code.to_string(),
        };

        let timestamp = daraja_timestamp(Utc::now());
        let request = StkQueryRequest {
            password: stk_password(&short_code, &settings.passkey, &timestamp),
            business_short_code: short_code,
            timestamp,
            checkout_request_id: checkout_request_id.clone(),
        };

        let response = tokio::time::timeout(
            settings.push_timeout,
            self.service.api().stk_query(&self.access_token, &request),
        )
        .await
        .map_err(|_| AppError::mpesa("stk query timed out"))?
        .map_err(|e| {
            warn!(transaction_id = tx.id, checkout_id = %checkout_request_id, error = %e, "stk query failed");
            e
        })?;

        if !response.is_complete() {
            return Err(AppError::mpesa("gotten error while posting to query stk API"));
        }

        let succeeded = response.succeeded();
        let status = if succeeded {
            StkStatus::ResultSuccess
        } else {
            StkStatus::ResultFailed
        };
        let merchant_request_id = tx
            .merchant_request_id
            .clone()
            .unwrap_or_else(|| response.merchant_request_id.clone());
        let mpesa_receipt_id = succeeded.then(|| {
            format!(
                "{}_{}_{}",
                self.system_id_prefix,
                Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                merchant_request_id
            )
        });

        let result = QueryResult {
            response_code: Some(response.response_code).filter(|c| !c.is_empty()),
            response_description: Some(response.response_description).filter(|d| !d.is_empty()),
            result_code: response.result_code,
            result_description: response.result_desc,
            mpesa_receipt_id,
            status,
        };

        match self.service.store().apply_query_result(tx.id, &result).await? {
            Some(updated) => info!(
                transaction_id = updated.id,
                status = %updated.stk_status,
                "stk transaction reconciled"
            ),
            None => debug!(transaction_id = tx.id, "transaction resolved before the query returned"),
        }

        Ok(())
    }
}
