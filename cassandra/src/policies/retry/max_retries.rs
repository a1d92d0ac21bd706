use std::sync::Arc;

use super::{ErrorCodeAwareRetryPolicy, RetryContext, RetryPolicy};

/// Caps the number of retries allowed by the wrapped policy.
#[derive(Debug, Clone)]
pub struct MaxRetriesPolicy {
    inner: Arc<dyn RetryPolicy>,
    max_retries: usize,
}

impl MaxRetriesPolicy {
    /// Retries allowed when no other limit is given.
    pub const DEFAULT_MAX_RETRIES: usize = 5;

    /// Wraps `inner`, allowing [`Self::DEFAULT_MAX_RETRIES`] retries.
    pub fn new(inner: Arc<dyn RetryPolicy>) -> Self {
        Self::with_max_retries(inner, Self::DEFAULT_MAX_RETRIES)
    }

    /// Wraps `inner`, allowing `max_retries` retries.
    pub fn with_max_retries(inner: Arc<dyn RetryPolicy>, max_retries: usize) -> Self {
        MaxRetriesPolicy { inner, max_retries }
    }
}

impl Default for MaxRetriesPolicy {
    fn default() -> Self {
        Self::new(Arc::new(ErrorCodeAwareRetryPolicy))
    }
}

impl RetryPolicy for MaxRetriesPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        context.retry_count() <= self.max_retries && self.inner.can_retry(context)
    }
}
