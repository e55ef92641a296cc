use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::services::credentials::Credentials;
use crate::services::mpesa_service::DarajaApi;

#[derive(Debug, Clone)]
pub struct TokenRefreshConfig {
    /// Delay between refreshes while they succeed
    pub interval: Duration,
    /// First retry after a failure waits `retry_base * 2`
    pub retry_base: Duration,
    /// Upper bound for a retry delay
    pub retry_cap: Duration,
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(5 * 60),
        }
    }
}

impl TokenRefreshConfig {
    pub fn with_interval_secs(secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(secs),
            ..Self::default()
        }
    }
}

/// Delay schedule for the refresh loop: the interval while refreshes succeed,
/// `retry_base * 2^k` after `k` consecutive failures, never above the cap or
/// the interval.
#[derive(Debug, Clone)]
pub struct RefreshBackoff {
    config: TokenRefreshConfig,
    failures: u32,
}

impl RefreshBackoff {
    pub fn new(config: TokenRefreshConfig) -> Self {
        Self { config, failures: 0 }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) -> Duration {
        self.failures = 0;
        self.config.interval
    }

    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.config
            .retry_base
            .saturating_mul(factor)
            .min(self.config.retry_cap)
            .min(self.config.interval)
    }
}

pub struct TokenRefresher {
    credentials: Arc<Credentials>,
    api: Arc<dyn DarajaApi>,
    config: TokenRefreshConfig,
}

impl TokenRefresher {
    pub fn new(credentials: Arc<Credentials>, api: Arc<dyn DarajaApi>, config: TokenRefreshConfig) -> Self {
        Self {
            credentials,
            api,
            config,
        }
    }

    /// Refreshes immediately, then keeps refreshing until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "Token refresher started");
        let mut backoff = RefreshBackoff::new(self.config.clone());

        loop {
            let delay = match self.credentials.refresh(self.api.as_ref()).await {
                Ok(()) => backoff.record_success(),
                Err(_) => {
                    let delay = backoff.record_failure();
                    warn!(
                        failures = backoff.failures(),
                        retry_in_secs = delay.as_secs(),
                        "token refresh failed, retrying"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping token refresher");
                    break;
                }
                _ = sleep(delay) => {}
            }
        }

        info!("Token refresher stopped");
    }
}
