//! Completion handoff between a route worker and the connection that owns
//! the request. A context is completed at most once, by the processor, by
//! the dispatcher's error path, or by a deferred task on the completer
//! pool; the first completion wins and everything after it is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use http::Response;
use hyper::Body;
use tokio::sync::oneshot;

use crate::metrics::HttpHandlerMetrics;
use crate::pool::WorkerPool;
use crate::trace::ServerSpan;
use crate::types::{RequestEnvelope, RetCode};

pub struct AsyncContext<T: RequestEnvelope> {
    request: T,
    response: Mutex<Option<T>>,
    complete: AtomicBool,
    writer: Mutex<Option<oneshot::Sender<Response<Body>>>>,
    span: Mutex<Option<ServerSpan>>,
    completer: Arc<WorkerPool>,
    metrics: HttpHandlerMetrics,
}

impl<T: RequestEnvelope> AsyncContext<T> {
    pub(crate) fn new(
        request: T,
        writer: oneshot::Sender<Response<Body>>,
        span: Option<ServerSpan>,
        completer: Arc<WorkerPool>,
        metrics: HttpHandlerMetrics,
    ) -> Arc<AsyncContext<T>> {
        Arc::new(AsyncContext {
            request,
            response: Mutex::new(None),
            complete: AtomicBool::new(false),
            writer: Mutex::new(Some(writer)),
            span: Mutex::new(span),
            completer,
            metrics,
        })
    }

    pub fn request(&self) -> &T {
        &self.request
    }

    /// The pool on which processors may schedule deferred completion when
    /// they cannot complete inline.
    pub fn completer(&self) -> &Arc<WorkerPool> {
        &self.completer
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// The winning response, once complete.
    pub fn get_response(&self) -> Option<T>
    where
        T: Clone,
    {
        if !self.is_complete() {
            return None;
        }
        self.response.lock().unwrap().clone()
    }

    /// Completes the context. The first caller installs the response,
    /// finishes the request span, records end-to-end latency and hands the
    /// rendered response to the connection writer; later callers return
    /// without effect.
    pub fn on_complete(&self, response: T) {
        {
            let mut slot = self.response.lock().unwrap();
            if slot.is_some() {
                return;
            }
            *slot = Some(response);
        }
        self.complete.store(true, Ordering::Release);

        let rendered = {
            let slot = self.response.lock().unwrap();
            // The slot was just installed and is never cleared.
            match slot.as_ref() {
                Some(response) => {
                    if let Some(span) = self.span.lock().unwrap().take() {
                        match response.result() {
                            Some((RetCode::Success, _)) | None => span.finish_ok(),
                            Some((_, msg)) => span.finish_err(msg),
                        }
                    }
                    response.http_response()
                }
                None => return,
            }
        };

        self.metrics
            .observe_request_round_trip(self.request.req_time());

        if let Some(writer) = self.writer.lock().unwrap().take() {
            // A dropped receiver means the connection is already gone; the
            // in-flight work simply had nowhere to land.
            let _ = writer.send(rendered);
        }
    }
}
