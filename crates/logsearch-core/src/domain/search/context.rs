//! Cancellation, deadline and work budget for one search
//!
//! A [`SearchContext`] is checked between pipeline stages and polled from
//! inside SQLite while a statement runs, so a canceled or expired search stops
//! scanning instead of finishing in the background. It uses the std clock
//! because the store polls it from its worker thread.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Budget {
    until: Instant,
    limit: Duration,
}

/// Cancellation and time limits for one request
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    budget: Option<Budget>,
}

impl SearchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A copy that also fails with `QueryTooExpensive` once `limit` has elapsed
    ///
    /// The caller's cancellation and deadline still apply.
    pub fn with_budget(&self, limit: Duration) -> Self {
        let mut ctx = self.clone();
        ctx.budget = Some(Budget {
            until: Instant::now() + limit,
            limit,
        });
        ctx
    }

    /// Whether work under this context should stop
    ///
    /// Called from the store's progress handler, so it must stay cheap.
    pub fn is_done(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        if self.deadline.is_none() && self.budget.is_none() {
            return false;
        }
        let now = Instant::now();
        self.deadline.is_some_and(|deadline| now >= deadline)
            || self.budget.is_some_and(|budget| now >= budget.until)
    }

    /// Fail if the search was canceled or ran out of time
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled("search canceled by caller".to_string()));
        }
        let now = Instant::now();
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            return Err(Error::Canceled("search deadline exceeded".to_string()));
        }
        if let Some(budget) = self.budget {
            if now >= budget.until {
                return Err(Error::QueryTooExpensive(
                    u64::try_from(budget.limit.as_millis()).unwrap_or(u64::MAX),
                ));
            }
        }
        Ok(())
    }

    /// Drive `work` until it finishes, the token fires or a time limit passes
    ///
    /// Dropping `work` does not stop a running statement on its own; the store
    /// interrupts it through [`is_done`](Self::is_done).
    pub(crate) async fn run<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(Error::Canceled("search canceled by caller".to_string()))
            }
            _ = sleep_until(self.earliest_limit()) => {
                Err(self
                    .check()
                    .err()
                    .unwrap_or_else(|| Error::Canceled("search deadline exceeded".to_string())))
            }
            result = work => result,
        }
    }

    fn earliest_limit(&self) -> Option<Instant> {
        match (self.deadline, self.budget.map(|budget| budget.until)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

async fn sleep_until(limit: Option<Instant>) {
    match limit {
        Some(limit) => tokio::time::sleep_until(tokio::time::Instant::from_std(limit)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_is_live() {
        let ctx = SearchContext::new();
        assert!(!ctx.is_done());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_cancellation_wins_over_limits() {
        let token = CancellationToken::new();
        let ctx = SearchContext::new()
            .with_cancellation(token.clone())
            .with_deadline(Instant::now());
        token.cancel();

        assert!(ctx.is_done());
        let err = ctx.check().unwrap_err();
        assert!(err.is_canceled());
        assert!(err.to_string().contains("canceled by caller"));
    }

    #[test]
    fn test_budget_reports_query_too_expensive() {
        let ctx = SearchContext::new().with_budget(Duration::ZERO);
        assert!(ctx.is_done());
        assert!(matches!(ctx.check(), Err(Error::QueryTooExpensive(0))));

        // The budget does not leak into the parent context
        let parent = SearchContext::new();
        let _child = parent.with_budget(Duration::ZERO);
        assert!(parent.check().is_ok());
    }

    #[test]
    fn test_expired_deadline_is_canceled() {
        let ctx = SearchContext::new()
            .with_timeout(Duration::from_secs(60))
            .with_deadline(Instant::now());
        assert!(matches!(ctx.check(), Err(Error::Canceled(_))));
    }

    #[tokio::test]
    async fn test_run_stops_pending_work_at_the_budget() {
        let ctx = SearchContext::new().with_budget(Duration::from_millis(20));
        let err = ctx
            .run(std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueryTooExpensive(20)));
    }

    #[tokio::test]
    async fn test_run_returns_finished_work() {
        let ctx = SearchContext::new().with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(async { Ok(7) }).await.unwrap(), 7);
    }
}
