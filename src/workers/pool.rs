use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::errors::Result;

/// Runs jobs with at most `limit` in flight and counts the ones that succeed.
///
/// `spawn` waits for a permit before spawning, so a caller feeding a page of
/// work never has more than `limit` tasks alive at once.
pub struct BoundedPool {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    succeeded: Arc<AtomicUsize>,
}

impl BoundedPool {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            tasks: JoinSet::new(),
            succeeded: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn spawn<F>(&mut self, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let succeeded = self.succeeded.clone();

        self.tasks.spawn(async move {
            let _permit = permit;
            match job.await {
                Ok(()) => {
                    succeeded.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => warn!(error = %e, "pooled job failed"),
            }
        });
    }

    /// Waits for every spawned job and returns how many succeeded.
    pub async fn join(mut self) -> usize {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "pooled job panicked");
            }
        }
        self.succeeded.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_limit_and_counts_successes() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = BoundedPool::new(5);

        for i in 0..23 {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                if i % 4 == 0 {
                    Err(AppError::mpesa("query failed"))
                } else {
                    Ok(())
                }
            })
            .await;
        }

        assert_eq!(pool.join().await, 17);
        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }
}
