//! Server-side trace spans. One span covers the ingress handling of one
//! request; it is finished exactly once, with the error message on any
//! failure path. With no subscriber installed the spans are disabled and
//! cost nothing.

use http::{Method, Version};
use tracing::field::Empty;
use tracing::Span;

use crate::types::http_flavor;

pub(crate) struct ServerSpan {
    span: Span,
    finished: bool,
}

impl ServerSpan {
    pub(crate) fn start(method: &Method, version: Version, url: &str) -> ServerSpan {
        let span = tracing::info_span!(
            "http-request",
            http.method = %method,
            http.flavor = http_flavor(version),
            http.url = url,
            error.message = Empty,
        );
        ServerSpan {
            span,
            finished: false,
        }
    }

    pub(crate) fn finish_ok(mut self) {
        self.finished = true;
    }

    pub(crate) fn finish_err(mut self, message: &str) {
        self.span.record("error.message", message);
        self.span
            .in_scope(|| tracing::warn!(error = message, "request failed"));
        self.finished = true;
    }
}

impl Drop for ServerSpan {
    fn drop(&mut self) {
        // A span abandoned without an outcome still closes; record that it
        // never saw completion so the trace is not silently truncated.
        if !self.finished {
            self.span
                .in_scope(|| tracing::warn!("request span dropped before completion"));
        }
    }
}
