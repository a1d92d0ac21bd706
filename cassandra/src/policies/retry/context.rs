use std::net::IpAddr;
use std::sync::Arc;

use super::RetryPolicy;
use crate::errors::{ExecutionError, RequestAttemptError};
use crate::policies::load_balancing::RoutingCandidates;

/// Retry state of one logical request: the endpoint currently tried, those
/// left to try, and the failures so far.
pub struct RetryContext {
    policy: Arc<dyn RetryPolicy>,
    candidates: RoutingCandidates,
    current: Option<IpAddr>,
    // The candidate after `current`, already taken from `candidates`.
    lookahead: Option<IpAddr>,
    retry_count: usize,
    last_error: Option<RequestAttemptError>,
}

impl RetryContext {
    /// Takes the first candidate as the current endpoint.
    ///
    /// Fails with [`ExecutionError::EmptyPlan`] if there are no candidates.
    pub fn new(
        policy: Arc<dyn RetryPolicy>,
        mut candidates: RoutingCandidates,
    ) -> Result<Self, ExecutionError> {
        let current = candidates.next().ok_or(ExecutionError::EmptyPlan)?;
        let lookahead = candidates.next();
        Ok(RetryContext {
            policy,
            candidates,
            current: Some(current),
            lookahead,
            retry_count: 0,
            last_error: None,
        })
    }

    /// Endpoint the next attempt goes to. `None` once the candidates ran out.
    pub fn current_endpoint(&self) -> Option<IpAddr> {
        self.current
    }

    /// Moves to the next candidate and returns it.
    pub fn next_endpoint(&mut self) -> Option<IpAddr> {
        self.current = self.lookahead.take();
        if self.current.is_some() {
            self.lookahead = self.candidates.next();
        }
        self.current
    }

    /// Whether another candidate remains after the current one.
    pub fn has_next_endpoint(&self) -> bool {
        self.lookahead.is_some()
    }

    /// Records a failed attempt.
    pub fn set_failure(&mut self, error: RequestAttemptError) -> &mut Self {
        self.last_error = Some(error);
        self.retry_count += 1;
        self
    }

    /// Asks the policy whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.policy.can_retry(self)
    }

    /// Number of failures recorded so far.
    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    /// The most recent failure.
    pub fn last_error(&self) -> Option<&RequestAttemptError> {
        self.last_error.as_ref()
    }

    pub(crate) fn into_last_error(self) -> Option<RequestAttemptError> {
        self.last_error
    }
}

impl std::fmt::Debug for RetryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryContext")
            .field("policy", &self.policy)
            .field("current", &self.current)
            .field("retry_count", &self.retry_count)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::retry::{ErrorCodeAwareRetryPolicy, NeverRetryPolicy};
    use crate::utils::test_utils::{ip, setup_tracing};
    use assert_matches::assert_matches;

    fn candidates(endpoints: Vec<IpAddr>) -> RoutingCandidates {
        Box::new(endpoints.into_iter())
    }

    #[test]
    fn empty_plan_is_rejected() {
        setup_tracing();
        assert_matches!(
            RetryContext::new(Arc::new(NeverRetryPolicy), candidates(vec![])),
            Err(ExecutionError::EmptyPlan)
        );
    }

    #[test]
    fn walks_the_candidates_once() {
        setup_tracing();
        let mut context = RetryContext::new(
            Arc::new(ErrorCodeAwareRetryPolicy),
            candidates(vec![ip(1), ip(2), ip(3)]),
        )
        .unwrap();
        assert_eq!(context.current_endpoint(), Some(ip(1)));
        assert!(context.has_next_endpoint());
        assert_eq!(context.next_endpoint(), Some(ip(2)));
        assert_eq!(context.next_endpoint(), Some(ip(3)));
        assert!(!context.has_next_endpoint());
        assert_eq!(context.next_endpoint(), None);
        assert_eq!(context.current_endpoint(), None);
        assert_eq!(context.next_endpoint(), None);
    }

    #[test]
    fn failures_are_counted() {
        setup_tracing();
        let mut context =
            RetryContext::new(Arc::new(NeverRetryPolicy), candidates(vec![ip(1)])).unwrap();
        assert_eq!(context.retry_count(), 0);
        assert!(context.last_error().is_none());

        context
            .set_failure(RequestAttemptError::NotYetOpen)
            .set_failure(RequestAttemptError::ConnectionClosed);
        assert_eq!(context.retry_count(), 2);
        assert_matches!(
            context.last_error(),
            Some(RequestAttemptError::ConnectionClosed)
        );
        assert!(!context.can_retry());
    }
}
