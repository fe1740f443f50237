//! Error classification by predicate list

use std::fmt;
use std::sync::Arc;

use tracing::debug;

/// HTTP-ish statuses that indicate a transient condition
pub const RETRIABLE_STATUSES: &[u16] = &[429, 500, 503];

/// Status codes (gRPC style) that indicate a transient condition
pub const RETRIABLE_CODES: &[&str] = &["RESOURCE_EXHAUSTED", "UNAVAILABLE", "INTERNAL", "ABORTED"];

/// Message fragments (matched case-insensitively) that indicate a transient condition
pub const RETRIABLE_MESSAGES: &[&str] = &[
    "RESOURCE_EXHAUSTED",
    "429",
    "TOO MANY REQUESTS",
    "OVERLOADED",
    "BODY TIMEOUT",
    "TIMEOUT",
    "TIMED OUT",
    "FETCH FAILED",
    "ECONNRESET",
    "CONFLICT",
];

/// Message fragments that identify rate limiting specifically
pub const RATE_LIMIT_MESSAGES: &[&str] = &["RESOURCE_EXHAUSTED", "429", "TOO MANY REQUESTS", "RATE LIMIT"];

/// What an error tells the classifier about itself
pub trait ErrorSignal {
    /// HTTP-like status, when the collaborator reported one
    fn status(&self) -> Option<u16> {
        None
    }

    /// Symbolic status code, when the collaborator reported one
    fn code(&self) -> Option<&str> {
        None
    }

    fn message(&self) -> String;
}

/// Outcome of classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retriable,
    Fatal,
}

type Predicate = Arc<dyn Fn(&dyn ErrorSignal) -> bool + Send + Sync>;

/// Ordered list of named predicates; an error matching any of them is retriable
#[derive(Clone)]
pub struct Classifier {
    predicates: Vec<(String, Predicate)>,
}

impl Classifier {
    /// A classifier that treats everything as fatal
    pub fn empty() -> Self {
        Self { predicates: Vec::new() }
    }

    /// Rate limits, unavailability, timeouts and write conflicts
    pub fn standard() -> Self {
        Self::empty()
            .with("status", status_in(RETRIABLE_STATUSES))
            .with("code", code_in(RETRIABLE_CODES))
            .with("message", message_contains(RETRIABLE_MESSAGES))
    }

    /// Rate limiting only
    pub fn rate_limit() -> Self {
        Self::empty()
            .with("status", status_in(&[429]))
            .with("code", code_in(&["RESOURCE_EXHAUSTED"]))
            .with("message", message_contains(RATE_LIMIT_MESSAGES))
    }

    /// Add a named predicate
    pub fn with(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&dyn ErrorSignal) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.push((name.into(), Arc::new(predicate)));
        self
    }

    pub fn classify(&self, err: &dyn ErrorSignal) -> ErrorClass {
        for (name, predicate) in &self.predicates {
            if predicate(err) {
                debug!(predicate = %name, "classify: retriable");
                return ErrorClass::Retriable;
            }
        }
        ErrorClass::Fatal
    }

    pub fn is_retriable(&self, err: &dyn ErrorSignal) -> bool {
        self.classify(err) == ErrorClass::Retriable
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.predicates.iter().map(|(name, _)| name)).finish()
    }
}

pub fn status_in(statuses: &'static [u16]) -> impl Fn(&dyn ErrorSignal) -> bool + Send + Sync + 'static {
    move |err| err.status().is_some_and(|s| statuses.contains(&s))
}

pub fn code_in(codes: &'static [&'static str]) -> impl Fn(&dyn ErrorSignal) -> bool + Send + Sync + 'static {
    move |err| err.code().is_some_and(|c| codes.iter().any(|code| code.eq_ignore_ascii_case(c)))
}

pub fn message_contains(
    fragments: &'static [&'static str],
) -> impl Fn(&dyn ErrorSignal) -> bool + Send + Sync + 'static {
    move |err| {
        let message = err.message().to_uppercase();
        fragments.iter().any(|f| message.contains(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Synthetic {
        status: Option<u16>,
        code: Option<&'static str>,
        message: &'static str,
    }

    impl ErrorSignal for Synthetic {
        fn status(&self) -> Option<u16> {
            self.status
        }

        fn code(&self) -> Option<&str> {
            self.code
        }

        fn message(&self) -> String {
            self.message.to_string()
        }
    }

    fn msg(message: &'static str) -> Synthetic {
        Synthetic {
            status: None,
            code: None,
            message,
        }
    }

    #[test]
    fn test_standard_by_status() {
        let c = Classifier::standard();
        for status in [429, 500, 503] {
            let e = Synthetic {
                status: Some(status),
                code: None,
                message: "",
            };
            assert_eq!(c.classify(&e), ErrorClass::Retriable, "status {}", status);
        }
        let e = Synthetic {
            status: Some(400),
            code: None,
            message: "bad request",
        };
        assert_eq!(c.classify(&e), ErrorClass::Fatal);
    }

    #[test]
    fn test_standard_by_code() {
        let c = Classifier::standard();
        let e = Synthetic {
            status: None,
            code: Some("unavailable"),
            message: "",
        };
        assert!(c.is_retriable(&e));
    }

    #[test]
    fn test_standard_by_message() {
        let c = Classifier::standard();
        assert!(c.is_retriable(&msg("upstream overloaded, try later")));
        assert!(c.is_retriable(&msg("Request timeout after 30s")));
        assert!(c.is_retriable(&msg("read ECONNRESET")));
        assert!(c.is_retriable(&msg("Too Many Requests")));
        assert!(!c.is_retriable(&msg("invalid argument: mass must be positive")));
    }

    #[test]
    fn test_rate_limit_is_narrower() {
        let c = Classifier::rate_limit();
        assert!(c.is_retriable(&msg("429 Too Many Requests")));
        assert!(c.is_retriable(&msg("RESOURCE_EXHAUSTED: quota")));
        assert!(!c.is_retriable(&msg("service unavailable")));
        assert!(!c.is_retriable(&msg("timeout")));
    }

    #[test]
    fn test_custom_predicate() {
        let c = Classifier::empty().with("flaky", |e: &dyn ErrorSignal| e.message().contains("flaky"));
        assert!(c.is_retriable(&msg("flaky disk")));
        assert!(!c.is_retriable(&msg("429")));
        assert_eq!(format!("{:?}", c), "[\"flaky\"]");
    }
}
