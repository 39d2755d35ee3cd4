//! Request classification and dispatch. Two registries select the
//! processor for a request: URI prefixes for event commands and numeric
//! request codes for legacy commands; a matching URI prefix wins. Work is
//! handed to the processor's bound worker pool and the completed response
//! travels back to the connection through the request's `AsyncContext`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, Request, Response, Version};
use hyper::Body;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tower::BoxError;
use tracing::{debug, warn};

use crate::body;
use crate::common;
use crate::context::AsyncContext;
use crate::metrics::{
    RequestTimer, LABEL_TYPE, REQUEST_TYPE_CODE, REQUEST_TYPE_INVALID, REQUEST_TYPE_URI,
};
use crate::pool::WorkerPool;
use crate::trace::ServerSpan;
use crate::types::{self, AppLayer, CodeCommand, EventWrapper, RequestCode, RetCode};
use crate::validate;
use crate::Inner;

/// Connection-scoped attributes handed to processors alongside the
/// request context.
#[derive(Clone, Copy, Debug)]
pub struct ChannelContext {
    pub remote: SocketAddr,
    pub layer: AppLayer,
}

/// A handler for legacy request-code commands. `process_request` may
/// complete the context inline or leave it incomplete and finish it later
/// on the completer pool.
pub trait CodeProcessor: Send + Sync + 'static {
    fn reject_request(&self) -> bool {
        false
    }

    fn process_request(
        &self,
        channel: &ChannelContext,
        ctx: &Arc<AsyncContext<CodeCommand>>,
    ) -> Result<(), BoxError>;
}

/// A handler for URI-routed event commands.
pub trait EventProcessor: Send + Sync + 'static {
    fn reject_request(&self) -> bool {
        false
    }

    fn process_request(
        &self,
        channel: &ChannelContext,
        ctx: &Arc<AsyncContext<EventWrapper>>,
    ) -> Result<(), BoxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("routes are frozen once the server has started")]
    ServerStarted,
    #[error("request code {0} is already registered")]
    DuplicateCode(i32),
    #[error("uri prefix `{0}` is already registered")]
    DuplicatePrefix(String),
    #[error("uri prefix must not be empty")]
    EmptyPrefix,
}

#[derive(Clone)]
struct CodeRoute {
    processor: Arc<dyn CodeProcessor>,
    pool: Arc<WorkerPool>,
}

#[derive(Clone)]
struct UriRoute {
    prefix: String,
    processor: Arc<dyn EventProcessor>,
    pool: Arc<WorkerPool>,
}

/// Accumulates registrations until the server starts.
#[derive(Default)]
pub(crate) struct RouteBuilder {
    code_routes: HashMap<String, CodeRoute>,
    uri_routes: Vec<UriRoute>,
}

impl RouteBuilder {
    pub(crate) fn register_code(
        &mut self,
        code: RequestCode,
        processor: Arc<dyn CodeProcessor>,
        pool: Arc<WorkerPool>,
    ) -> Result<(), RegistrationError> {
        let key = code.value().to_string();
        if self.code_routes.contains_key(&key) {
            return Err(RegistrationError::DuplicateCode(code.value()));
        }
        self.code_routes.insert(key, CodeRoute { processor, pool });
        Ok(())
    }

    pub(crate) fn register_uri(
        &mut self,
        prefix: &str,
        processor: Arc<dyn EventProcessor>,
        pool: Arc<WorkerPool>,
    ) -> Result<(), RegistrationError> {
        if prefix.is_empty() {
            return Err(RegistrationError::EmptyPrefix);
        }
        if self.uri_routes.iter().any(|route| route.prefix == prefix) {
            return Err(RegistrationError::DuplicatePrefix(prefix.to_owned()));
        }
        self.uri_routes.push(UriRoute {
            prefix: prefix.to_owned(),
            processor,
            pool,
        });
        Ok(())
    }

    /// Freezes the registrations into the read-only table served for the
    /// rest of the process lifetime. URI prefixes are ordered longest
    /// first so the most specific route wins deterministically.
    pub(crate) fn freeze(&mut self) -> RouteTable {
        let mut uri_routes = std::mem::take(&mut self.uri_routes);
        uri_routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        RouteTable {
            code_routes: std::mem::take(&mut self.code_routes),
            uri_routes,
        }
    }

    pub(crate) fn pools(&self) -> Vec<Arc<WorkerPool>> {
        collect_pools(
            self.code_routes.values().map(|route| &route.pool),
            self.uri_routes.iter().map(|route| &route.pool),
        )
    }
}

pub(crate) struct RouteTable {
    code_routes: HashMap<String, CodeRoute>,
    uri_routes: Vec<UriRoute>,
}

impl RouteTable {
    fn match_uri(&self, path: &str) -> Option<&UriRoute> {
        self.uri_routes
            .iter()
            .find(|route| path.starts_with(&route.prefix))
    }

    fn code_route(&self, code: &str) -> Option<&CodeRoute> {
        self.code_routes.get(code)
    }

    pub(crate) fn pools(&self) -> Vec<Arc<WorkerPool>> {
        collect_pools(
            self.code_routes.values().map(|route| &route.pool),
            self.uri_routes.iter().map(|route| &route.pool),
        )
    }
}

fn collect_pools<'a>(
    code: impl Iterator<Item = &'a Arc<WorkerPool>>,
    uri: impl Iterator<Item = &'a Arc<WorkerPool>>,
) -> Vec<Arc<WorkerPool>> {
    let mut pools: Vec<Arc<WorkerPool>> = Vec::new();
    for pool in code.chain(uri) {
        if !pools.iter().any(|seen| Arc::ptr_eq(seen, pool)) {
            pools.push(Arc::clone(pool));
        }
    }
    pools
}

/// The fully-materialized request as seen by the dispatcher.
struct IngressRequest {
    method: Method,
    version: Version,
    uri: String,
    header_map: BTreeMap<String, String>,
    body_map: Map<String, Value>,
    req_time: i64,
}

pub(crate) async fn dispatch_request(
    inner: &Arc<Inner>,
    channel: ChannelContext,
    request: Request<Body>,
    timer: &mut RequestTimer,
) -> Response<Body> {
    let (parts, raw_body) = request.into_parts();
    let uri = parts.uri.to_string();
    let (header_map, req_time) =
        validate::enrich_headers(&parts.headers, channel.remote, inner.config.server_ip);

    if let Err(err) = validate::validate_request(inner.started(), &parts.method, &header_map) {
        timer.set_label(LABEL_TYPE, REQUEST_TYPE_INVALID);
        debug!(status = %err.status, error = err.message.as_str(), "request failed validation");
        let span = ServerSpan::start(&parts.method, parts.version, &uri);
        span.finish_err(&err.message);
        return common::make_plaintext_response(
            err.status,
            err.status.to_string(),
            &inner.config.charset,
        );
    }
    inner.metrics.observe_http_request();

    let bytes = match body::read_body(raw_body, inner.config.max_request_size_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            timer.set_label(LABEL_TYPE, REQUEST_TYPE_INVALID);
            warn!(status = %err.status, error = err.message.as_str(), "request body refused");
            let span = ServerSpan::start(&parts.method, parts.version, &uri);
            span.finish_err(&err.message);
            return common::make_plaintext_response(
                err.status,
                err.status.to_string(),
                &inner.config.charset,
            );
        }
    };

    let routes = match inner.routes() {
        Some(routes) => routes,
        // Started without a frozen table cannot happen through `start()`;
        // answer as not-started rather than touching a missing table.
        None => {
            timer.set_label(LABEL_TYPE, REQUEST_TYPE_INVALID);
            return common::make_plaintext_response(
                http::StatusCode::SERVICE_UNAVAILABLE,
                http::StatusCode::SERVICE_UNAVAILABLE.to_string(),
                &inner.config.charset,
            );
        }
    };

    let is_uri_route = routes.match_uri(parts.uri.path()).is_some();
    timer.set_label(
        LABEL_TYPE,
        if is_uri_route {
            REQUEST_TYPE_URI
        } else {
            REQUEST_TYPE_CODE
        },
    );

    let body_map = match body::decode_body(
        &parts.method,
        &parts.uri,
        &parts.headers,
        &bytes,
        &inner.metrics,
    )
    .await
    {
        Ok(map) => map,
        Err(err) => {
            warn!(error = %err, "failed to decode request body");
            let span = ServerSpan::start(&parts.method, parts.version, &uri);
            span.finish_err(&err.to_string());
            return common::make_envelope_response(RetCode::RuntimeError, &err.to_string());
        }
    };

    let ingress = IngressRequest {
        method: parts.method,
        version: parts.version,
        uri,
        header_map,
        body_map,
        req_time,
    };

    if is_uri_route {
        match routes.match_uri(parts.uri.path()) {
            Some(route) => dispatch_event(inner, channel, ingress, route).await,
            // Classification chose the URI path but no entry matches; an
            // invalid-route envelope, never a missing-route panic.
            None => {
                common::make_envelope_response(RetCode::RequestCodeInvalid, "no route for uri")
            }
        }
    } else {
        dispatch_code(inner, channel, ingress, &routes).await
    }
}

async fn dispatch_event(
    inner: &Arc<Inner>,
    channel: ChannelContext,
    ingress: IngressRequest,
    route: &UriRoute,
) -> Response<Body> {
    let IngressRequest {
        method,
        version,
        uri,
        header_map,
        body_map,
        req_time,
    } = ingress;

    let body_bytes = serde_json::to_vec(&body_map).unwrap();
    let wrapper = EventWrapper::new(version, uri.clone(), header_map, body_bytes, req_time);
    let span = ServerSpan::start(&method, version, &uri);

    let (writer, reader) = oneshot::channel();
    let ctx = AsyncContext::new(
        wrapper,
        writer,
        Some(span),
        Arc::clone(&inner.completer),
        inner.metrics.clone(),
    );

    let processor = Arc::clone(&route.processor);
    let task_ctx = Arc::clone(&ctx);
    let submitted = route
        .pool
        .try_submit(move || run_event_task(processor, channel, task_ctx));
    if let Err(err) = submitted {
        inner.metrics.observe_http_discard();
        warn!(pool = route.pool.name(), error = %err, "event dispatch rejected");
        let overload = ctx.request().create_http_response(
            RetCode::Overload,
            RetCode::Overload.default_message().to_owned(),
        );
        ctx.on_complete(overload);
    }
    await_completion(reader).await
}

fn run_event_task(
    processor: Arc<dyn EventProcessor>,
    channel: ChannelContext,
    ctx: Arc<AsyncContext<EventWrapper>>,
) {
    if processor.reject_request() {
        let response = ctx.request().create_http_response(
            RetCode::RejectedByProcessor,
            RetCode::RejectedByProcessor.default_message().to_owned(),
        );
        ctx.on_complete(response);
        return;
    }
    if let Err(err) = processor.process_request(&channel, &ctx) {
        warn!(error = %err, uri = ctx.request().request_uri.as_str(), "event processor failed");
        if !ctx.is_complete() {
            let response = ctx
                .request()
                .create_http_response(RetCode::RuntimeError, err.to_string());
            ctx.on_complete(response);
        }
    }
    // A context left incomplete here is deferred completion; the
    // processor finishes it on the completer pool.
}

async fn dispatch_code(
    inner: &Arc<Inner>,
    channel: ChannelContext,
    ingress: IngressRequest,
    routes: &RouteTable,
) -> Response<Body> {
    let IngressRequest {
        method,
        version,
        uri,
        header_map,
        body_map,
        req_time,
    } = ingress;

    let raw_code = if method == Method::POST {
        header_map
            .get(types::REQUEST_CODE)
            .cloned()
            .unwrap_or_default()
    } else {
        body_map
            .get(types::REQUEST_CODE)
            .map(value_to_string)
            .unwrap_or_default()
    };

    let route = match RequestCode::parse(&raw_code)
        .and_then(|code| routes.code_route(&code.value().to_string()))
    {
        Some(route) => route,
        None => {
            debug!(code = raw_code.as_str(), "request code not routable");
            let span = ServerSpan::start(&method, version, &uri);
            span.finish_err(&format!("invalid request code `{}`", raw_code));
            return common::make_envelope_response(
                RetCode::RequestCodeInvalid,
                RetCode::RequestCodeInvalid.default_message(),
            );
        }
    };

    let command = match CodeCommand::build(
        method.clone(),
        version,
        raw_code,
        header_map,
        body_map,
        req_time,
    ) {
        Ok(command) => command,
        Err(err) => {
            warn!(error = %err, "failed to build command");
            let span = ServerSpan::start(&method, version, &uri);
            span.finish_err(&err.to_string());
            return common::make_envelope_response(RetCode::RuntimeError, &err.to_string());
        }
    };

    let (writer, reader) = oneshot::channel();
    let ctx = AsyncContext::new(
        command,
        writer,
        None,
        Arc::clone(&inner.completer),
        inner.metrics.clone(),
    );

    let processor = Arc::clone(&route.processor);
    let task_ctx = Arc::clone(&ctx);
    let task_uri = uri.clone();
    let submitted = route
        .pool
        .try_submit(move || run_code_task(processor, channel, task_ctx, task_uri));
    if let Err(err) = submitted {
        inner.metrics.observe_http_discard();
        warn!(pool = route.pool.name(), error = %err, "command dispatch rejected");
        let span = ServerSpan::start(&method, version, &uri);
        span.finish_err(&err.to_string());
        let overload = ctx.request().create_http_command_response(
            RetCode::Overload,
            RetCode::Overload.default_message().to_owned(),
        );
        ctx.on_complete(overload);
    }
    await_completion(reader).await
}

fn run_code_task(
    processor: Arc<dyn CodeProcessor>,
    channel: ChannelContext,
    ctx: Arc<AsyncContext<CodeCommand>>,
    uri: String,
) {
    let request = ctx.request();
    if processor.reject_request() {
        let span = ServerSpan::start(&request.http_method, request.http_version, &uri);
        span.finish_err(RetCode::RejectedByProcessor.default_message());
        let response = request.create_http_command_response(
            RetCode::RejectedByProcessor,
            RetCode::RejectedByProcessor.default_message().to_owned(),
        );
        ctx.on_complete(response);
        return;
    }
    if let Err(err) = processor.process_request(&channel, &ctx) {
        warn!(error = %err, code = request.request_code.as_str(), "processor failed");
        if !ctx.is_complete() {
            let span = ServerSpan::start(&request.http_method, request.http_version, &uri);
            span.finish_err(&err.to_string());
            let response =
                request.create_http_command_response(RetCode::RuntimeError, err.to_string());
            ctx.on_complete(response);
        }
    }
}

async fn await_completion(reader: oneshot::Receiver<Response<Body>>) -> Response<Body> {
    match reader.await {
        Ok(response) => response,
        // Every handle on the context dropped without completing it.
        Err(_) => common::make_envelope_response(RetCode::RuntimeError, "request was not completed"),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
