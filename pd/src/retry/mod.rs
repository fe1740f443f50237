//! Retry/backoff executor
//!
//! Collaborators fail in inconsistent ways, so classification works off the
//! status, code and message an error exposes through [`ErrorSignal`] rather
//! than a single typed error.

mod classify;
mod executor;

pub use classify::{
    Classifier, ErrorClass, ErrorSignal, RATE_LIMIT_MESSAGES, RETRIABLE_CODES, RETRIABLE_MESSAGES,
    RETRIABLE_STATUSES, code_in, message_contains, status_in,
};
pub use executor::{RetryError, RetryPolicy, execute_with_retry};
pub(crate) use executor::jitter;
