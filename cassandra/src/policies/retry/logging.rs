use std::sync::Arc;
use tracing::Level;

use super::{RetryContext, RetryPolicy};

/// Logs every decision of the wrapped policy.
#[derive(Debug, Clone)]
pub struct LoggingRetryPolicy {
    inner: Arc<dyn RetryPolicy>,
    level: Level,
}

impl LoggingRetryPolicy {
    /// Logs decisions of `inner` at INFO.
    pub fn new(inner: Arc<dyn RetryPolicy>) -> Self {
        Self::with_level(inner, Level::INFO)
    }

    /// Logs decisions of `inner` at the given level.
    pub fn with_level(inner: Arc<dyn RetryPolicy>, level: Level) -> Self {
        LoggingRetryPolicy { inner, level }
    }
}

macro_rules! log_at {
    ($level:expr, $($args:tt)+) => {
        match $level {
            Level::TRACE => tracing::trace!($($args)+),
            Level::DEBUG => tracing::debug!($($args)+),
            Level::INFO => tracing::info!($($args)+),
            Level::WARN => tracing::warn!($($args)+),
            _ => tracing::error!($($args)+),
        }
    };
}

impl RetryPolicy for LoggingRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        let can_retry = self.inner.can_retry(context);
        let error = context.last_error().map(ToString::to_string);
        let endpoint = context.current_endpoint();
        let retry_count = context.retry_count();
        if can_retry {
            log_at!(self.level, ?endpoint, retry_count, ?error, "Retrying request");
        } else {
            log_at!(self.level, ?endpoint, retry_count, ?error, "Not retrying request");
        }
        can_retry
    }
}
