use crate::errors::{ConnectionError, DbError, RequestAttemptError, WriteType};

use super::{RetryContext, RetryPolicy};

/// Retries transport failures and the server errors for which another attempt
/// can succeed.
///
/// * connect failures and broken or closed connections are retried,
/// * a write timeout is retried only while writing the batch log,
/// * a read timeout is retried when enough replicas answered but the data was missing,
/// * `OVERLOADED` and `IS_BOOTSTRAPPING` are retried only if another endpoint remains,
/// * `UNPREPARED` is retried after the statement was prepared again,
/// * everything else is returned to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorCodeAwareRetryPolicy;

impl ErrorCodeAwareRetryPolicy {
    /// Creates a new instance of [ErrorCodeAwareRetryPolicy].
    pub fn new() -> Self {
        ErrorCodeAwareRetryPolicy
    }
}

impl RetryPolicy for ErrorCodeAwareRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        let Some(error) = context.last_error() else {
            return true;
        };

        match error {
            RequestAttemptError::ConnectionError(
                ConnectionError::IoError(_)
                | ConnectionError::ConnectTimeout(_)
                | ConnectionError::SetupTimeout(_)
                | ConnectionError::BrokenConnection(_)
                | ConnectionError::Closed,
            )
            | RequestAttemptError::BrokenConnection(_)
            | RequestAttemptError::ConnectionClosed
            | RequestAttemptError::NotYetOpen
            | RequestAttemptError::UnableToAllocStreamId => true,
            RequestAttemptError::DbError(db_error, _) => match db_error {
                DbError::WriteTimeout { write_type, .. } => *write_type == WriteType::BatchLog,
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                } => received >= required && !*data_present,
                DbError::Overloaded | DbError::IsBootstrapping => context.has_next_endpoint(),
                DbError::Unprepared { .. } => true,
                _ => false,
            },
            _ => false,
        }
    }
}
