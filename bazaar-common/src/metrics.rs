use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;
use tracing::Span;

lazy_static! {
    static ref API_REQUEST_COUNT: CounterVec = CounterVec::new(
        Opts::new("http_api_requests_total", "Completed HTTP API requests"),
        &["api", "outcome"],
    )
    .unwrap();
    static ref API_REQUEST_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("http_api_request_seconds", "HTTP API request latency"),
        &["api"],
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    let registry = Registry::new();
    registry
        .register(Box::new(API_REQUEST_COUNT.clone()))
        .unwrap();
    registry
        .register(Box::new(API_REQUEST_SECONDS.clone()))
        .unwrap();
    registry
}

/// Classifies API errors for metrics and log level selection.
pub trait TraceErrorKind {
    fn trace_error_kind(&self) -> &'static str;

    /// Expected errors (bad requests, missing entities) log at info;
    /// unexpected ones at error.
    fn is_expected(&self) -> bool;
}

/// Wraps one HTTP API operation: a span for the handler body plus outcome
/// recording on completion.
pub struct RecordedHttpApiRequest {
    pub span: Span,
    api_name: &'static str,
    start: Instant,
}

impl RecordedHttpApiRequest {
    pub fn new(api_name: &'static str, span: Span) -> Self {
        Self {
            span,
            api_name,
            start: Instant::now(),
        }
    }

    pub fn result<T, E: TraceErrorKind>(self, result: Result<T, E>) -> Result<T, E> {
        let elapsed = self.start.elapsed().as_secs_f64();
        API_REQUEST_SECONDS
            .with_label_values(&[self.api_name])
            .observe(elapsed);
        match &result {
            Ok(_) => {
                API_REQUEST_COUNT
                    .with_label_values(&[self.api_name, "success"])
                    .inc();
                self.span
                    .in_scope(|| tracing::debug!(api = self.api_name, "api request succeeded"));
            }
            Err(error) => {
                let kind = error.trace_error_kind();
                API_REQUEST_COUNT
                    .with_label_values(&[self.api_name, kind])
                    .inc();
                self.span.in_scope(|| {
                    if error.is_expected() {
                        tracing::info!(api = self.api_name, error_kind = kind, "api request failed");
                    } else {
                        tracing::error!(api = self.api_name, error_kind = kind, "api request failed");
                    }
                });
            }
        }
        result
    }
}

#[macro_export]
macro_rules! recorded_http_api_request {
    ($api_name:expr $(, $($fields:tt)*)?) => {
        $crate::metrics::RecordedHttpApiRequest::new(
            $api_name,
            ::tracing::info_span!("api_request", api = $api_name $(, $($fields)*)?),
        )
    };
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[derive(Debug)]
    struct TestError;

    impl TraceErrorKind for TestError {
        fn trace_error_kind(&self) -> &'static str {
            "TestError"
        }

        fn is_expected(&self) -> bool {
            true
        }
    }

    #[test]
    fn result_passes_values_through() {
        let record = recorded_http_api_request!("test_op", id = "42");
        let out: Result<i32, TestError> = record.result(Ok(7));
        assert_eq!(out.unwrap(), 7);

        let record = recorded_http_api_request!("test_op");
        let out: Result<i32, TestError> = record.result(Err(TestError));
        assert!(out.is_err());
    }
}
