//! Request retries configurations\
//! To decide whether a failed request is tried again, the session consults a
//! `RetryPolicy` through the request's [`RetryContext`].

mod context;
mod error_code_aware;
mod logging;
mod max_retries;
mod never;

pub use context::RetryContext;
pub use error_code_aware::ErrorCodeAwareRetryPolicy;
pub use logging::LoggingRetryPolicy;
pub use max_retries::MaxRetriesPolicy;
pub use never::NeverRetryPolicy;

/// Specifies a policy used to decide when to retry a request.
///
/// Policies are composed explicitly; the default is
/// `MaxRetriesPolicy::new(Arc::new(ErrorCodeAwareRetryPolicy))`.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called after a failure was recorded in the context.
    fn can_retry(&self, context: &RetryContext) -> bool;
}
