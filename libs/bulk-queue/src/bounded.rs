//! Per-call execution budgets and cancellation for store operations

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Execution budget for each kind of store round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallBudgets {
    /// Long enough for a contended scan over every partition.
    pub dequeue: Duration,
    pub heartbeat: Duration,
    pub complete: Duration,
    /// Applies to each fetch from an open range read, not the whole range.
    pub read: Duration,
}

impl Default for CallBudgets {
    fn default() -> Self {
        Self {
            dequeue: Duration::from_secs(60),
            heartbeat: Duration::from_secs(30),
            complete: Duration::from_secs(30),
            read: Duration::from_secs(120),
        }
    }
}

/// Run a store future under a budget, aborting it if `cancel` fires first.
///
/// Dropping the inner future is what aborts the round trip, so every store
/// call must be all-or-nothing on the store side.
pub async fn bounded<T, F>(cancel: &CancellationToken, budget: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = tokio::time::timeout(budget, fut) => res.map_err(|_| Error::Timeout(budget))?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_result_through() {
        let cancel = CancellationToken::new();
        let value = bounded(&cancel, Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_budget_is_a_timeout() {
        let cancel = CancellationToken::new();
        let res: Result<()> = bounded(&cancel, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Timeout(d)) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let res: Result<()> = bounded(&cancel, Duration::from_secs(60), async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn already_cancelled_never_polls() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let cancel = CancellationToken::new();
        cancel.cancel();
        let polled = AtomicBool::new(false);
        let res: Result<()> = bounded(&cancel, Duration::from_secs(1), async {
            polled.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(!polled.load(Ordering::SeqCst));
    }
}
