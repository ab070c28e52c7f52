//! Response classification for delivery attempts.

use crate::config::ShouldRetryFn;
use crate::error::{Result, VolleyError};
use crate::http::HttpResponse;

/// What one attempt's result means for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    /// 2xx.
    Success,
    /// Worth another attempt: 429, any non-4xx failure status, timeout, connection error.
    Retryable,
    /// The receiver rejected the payload, or the request cannot be built.
    Terminal,
}

impl AttemptClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptClass::Success => "success",
            AttemptClass::Retryable => "retryable",
            AttemptClass::Terminal => "terminal",
        }
    }
}

/// Classify a response using `should_retry` for non-2xx statuses.
pub fn classify(result: &Result<HttpResponse>, should_retry: &ShouldRetryFn) -> AttemptClass {
    match result {
        Ok(response) if response.is_success() => AttemptClass::Success,
        Ok(response) if should_retry(response) => AttemptClass::Retryable,
        Ok(_) => AttemptClass::Terminal,
        Err(e) => classify_error(e),
    }
}

fn classify_error(error: &VolleyError) -> AttemptClass {
    if error.is_request_builder_error() {
        AttemptClass::Terminal
    } else {
        AttemptClass::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_should_retry;
    use std::sync::Arc;

    fn status(code: u16) -> Result<HttpResponse> {
        Ok(HttpResponse::new(code, ""))
    }

    #[test]
    fn status_classes() {
        let should_retry: ShouldRetryFn = Arc::new(default_should_retry);
        for code in [200, 201, 204, 299] {
            assert_eq!(classify(&status(code), &should_retry), AttemptClass::Success);
        }
        for code in [100, 301, 304, 429, 500, 502, 503, 504] {
            assert_eq!(classify(&status(code), &should_retry), AttemptClass::Retryable);
        }
        for code in [400, 401, 403, 404, 408, 410, 422] {
            assert_eq!(classify(&status(code), &should_retry), AttemptClass::Terminal);
        }
    }

    #[test]
    fn transport_errors_are_retryable() {
        let should_retry: ShouldRetryFn = Arc::new(default_should_retry);
        let err: Result<HttpResponse> =
            Err(VolleyError::Other(anyhow::anyhow!("connection refused")));
        assert_eq!(classify(&err, &should_retry), AttemptClass::Retryable);
    }

    #[test]
    fn custom_predicate_is_respected() {
        let should_retry: ShouldRetryFn = Arc::new(|r: &HttpResponse| r.status == 409);
        assert_eq!(classify(&status(409), &should_retry), AttemptClass::Retryable);
        assert_eq!(classify(&status(503), &should_retry), AttemptClass::Terminal);
    }
}
