use std::fmt;

use tracing::{Span, info_span};
use uuid::Uuid;

use crate::key::HeaderLookup;

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

const MAX_INBOUND_LEN: usize = 128;

/// Identifier tying log lines of one request together across services.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A span carrying the id; enter it (or instrument a future) per request.
    pub fn span(&self) -> Span {
        info_span!("request", correlation_id = %self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reuses an inbound `X-Correlation-ID` or `X-Request-ID`, else generates one.
///
/// Inbound values longer than 128 bytes or containing characters outside
/// `[A-Za-z0-9._-]` are replaced rather than propagated into logs.
pub fn resolve<H: HeaderLookup + ?Sized>(headers: &H) -> CorrelationId {
    [CORRELATION_ID_HEADER, REQUEST_ID_HEADER]
        .iter()
        .filter_map(|name| headers.header(name))
        .map(str::trim)
        .find(|value| is_acceptable(value))
        .map(|value| CorrelationId(value.to_string()))
        .unwrap_or_else(CorrelationId::generate)
}

fn is_acceptable(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_INBOUND_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_correlation_id_is_reused() {
        let headers = [("x-correlation-id", "req-42"), ("X-Request-ID", "other")];
        assert_eq!(resolve(&headers).as_str(), "req-42");
    }

    #[test]
    fn request_id_is_second_choice() {
        let headers = [("X-Request-ID", "abc.def")];
        assert_eq!(resolve(&headers).as_str(), "abc.def");
    }

    #[test]
    fn unsafe_values_are_replaced() {
        let headers = [("X-Correlation-ID", "bad value\n")];
        let id = resolve(&headers);
        assert_ne!(id.as_str(), "bad value");
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }
}
