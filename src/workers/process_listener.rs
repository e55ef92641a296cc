use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::middleware::auth::Claims;
use crate::models::publish::ProcessStkTransactionRequest;
use crate::services::stk_service::StkService;

/// Marks transactions processed from messages on the control channel.
/// Resubscribes whenever the subscription fails or ends.
pub struct ProcessListener {
    service: StkService,
    channel: String,
    resubscribe_delay: Duration,
}

impl ProcessListener {
    pub fn new(service: StkService, channel: impl Into<String>) -> Self {
        Self {
            service,
            channel: channel.into(),
            resubscribe_delay: Duration::from_secs(5),
        }
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Runs until shutdown. Only a failure to mint the system identity ends
    /// it early.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let auth = self.service.auth();
        let claims = auth.authenticate(&auth.system_token()?)?;

        loop {
            if self.listen(&claims, &mut shutdown_rx).await {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = sleep(self.resubscribe_delay) => {}
            }
        }

        info!("Process listener stopped");
        Ok(())
    }

    /// One subscription. Returns true when shutdown was signalled.
    async fn listen(&self, claims: &Claims, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let mut messages = match self.service.bus().subscribe(&self.channel).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(channel = %self.channel, error = %e, "failed to subscribe to control channel");
                return false;
            }
        };
        info!(channel = %self.channel, "Process listener subscribed");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping process listener");
                    return true;
                }
                message = messages.next() => {
                    let Some(payload) = message else {
                        warn!(channel = %self.channel, "control channel closed, resubscribing");
                        return false;
                    };
                    self.handle(claims, &payload).await;
                }
            }
        }
    }

    async fn handle(&self, claims: &Claims, payload: &str) {
        let request: ProcessStkTransactionRequest = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed process message");
                return;
            }
        };

        if let Err(e) = self.service.process(claims, &request).await {
            if e.is_client_fault() {
                warn!(error = %e, receipt = %request.mpesa_receipt_id, "process message rejected");
            } else {
                error!(error = %e, receipt = %request.mpesa_receipt_id, "failed to process stk transaction");
            }
        }
    }
}
