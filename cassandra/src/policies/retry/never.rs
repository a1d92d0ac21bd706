use super::{RetryContext, RetryPolicy};

/// Forwards all errors directly to the user, never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetryPolicy;

impl NeverRetryPolicy {
    /// Creates a new instance of [NeverRetryPolicy].
    pub fn new() -> Self {
        NeverRetryPolicy
    }
}

impl RetryPolicy for NeverRetryPolicy {
    fn can_retry(&self, _context: &RetryContext) -> bool {
        false
    }
}
