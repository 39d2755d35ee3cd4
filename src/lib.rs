//! This is the HTTP ingress of the event mesh broker. This deals with
//! accepting HTTP connections, parsing messages and forwarding them to the
//! registered processors.
//!
//! Two registries select the processor for a request: URI prefixes for
//! event commands and numeric request codes for legacy commands. Both are
//! populated before `start()` and read-only afterwards. Processor work
//! runs on bounded per-route worker pools; a saturated pool answers the
//! client with an overload result instead of queueing without bound.

mod body;
mod common;
mod config;
mod context;
mod dispatch;
mod idle;
mod metrics;
mod pool;
mod trace;
mod types;
mod validate;

pub use crate::config::Config;
pub use crate::context::AsyncContext;
pub use crate::dispatch::{
    ChannelContext, CodeProcessor, EventProcessor, RegistrationError,
};
pub use crate::metrics::HttpHandlerMetrics;
pub use crate::pool::{SubmitError, WorkerPool};
pub use crate::types::{
    AppLayer, CodeCommand, CommandBuildError, EventWrapper, ProtocolVersion, RequestCode,
    RequestEnvelope, RetCode, IP, REQUEST_CODE, REQ_C2EVENTMESH_TIMESTAMP,
    REQ_SEND_EVENTMESH_IP, VERSION,
};
pub use tower::BoxError;

use std::error::Error as _;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use byte_unit::Byte;
use http::{Request, Response, StatusCode};
use hyper::server::conn::Http;
use hyper::Body;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::{service_fn, util::BoxService, ServiceBuilder, ServiceExt};
use tracing::{debug, error, info, warn};

use crate::dispatch::{RouteBuilder, RouteTable};
use crate::idle::IdleTimeout;
use crate::metrics::{ConnectionError, ConnectionTermination, RequestTimer, LABEL_STATUS};

// Constants defining the limits of the http handler.

// At most this many live TCP connections are served; a connection pushing
// the count above the limit is dropped before any HTTP exchange.
pub(crate) const MAX_OUTSTANDING_CONNECTIONS: usize = 20000;

// A request with a body bigger than this is rejected with an appropriate
// error code returned to the user.
pub(crate) const MAX_REQUEST_SIZE_BYTES: Byte = Byte::from_bytes(i32::MAX as u128);

// If the request body is not received within this window the request is
// rejected and an appropriate error code is returned to the user.
pub(crate) const MAX_REQUEST_RECEIVE_DURATION: Duration = Duration::from_secs(300); // 5 min

// Deferred completions queue here; sized generously since completion jobs
// are cheap and short-lived.
const COMPLETER_QUEUE_CAPACITY: usize = 10_000;
const COMPLETER_POOL_NAME: &str = "http-async-complete";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HttpError {}

/// Shared state of the http handler, thread-safe throughout.
pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) metrics: HttpHandlerMetrics,
    pub(crate) completer: Arc<WorkerPool>,
    tls: Option<TlsAcceptor>,
    started: AtomicBool,
    frozen: AtomicBool,
    shutdown_done: AtomicBool,
    live_connections: AtomicUsize,
    builder: Mutex<RouteBuilder>,
    routes: RwLock<Option<Arc<RouteTable>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Inner {
    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn routes(&self) -> Option<Arc<RouteTable>> {
        self.routes.read().unwrap().clone()
    }
}

/// The HTTP ingress server. Register processors, then `start()`; requests
/// arriving before the server is started are answered with 503.
pub struct EventMeshHttpServer {
    inner: Arc<Inner>,
}

impl EventMeshHttpServer {
    /// Creates the server. TLS is served only when `config.use_tls` is set
    /// AND an acceptor is supplied; otherwise connections are plaintext.
    pub fn new(
        config: Config,
        tls: Option<TlsAcceptor>,
        registry: &prometheus::Registry,
    ) -> io::Result<EventMeshHttpServer> {
        let metrics = HttpHandlerMetrics::new(registry);
        let completer = WorkerPool::new(
            COMPLETER_POOL_NAME,
            config.completer_threads,
            COMPLETER_QUEUE_CAPACITY,
        )?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(EventMeshHttpServer {
            inner: Arc::new(Inner {
                config,
                metrics,
                completer,
                tls,
                started: AtomicBool::new(false),
                frozen: AtomicBool::new(false),
                shutdown_done: AtomicBool::new(false),
                live_connections: AtomicUsize::new(0),
                builder: Mutex::new(RouteBuilder::default()),
                routes: RwLock::new(None),
                shutdown_tx,
                shutdown_rx,
                local_addr: Mutex::new(None),
            }),
        })
    }

    /// Registers a processor for a legacy request code. Must be called
    /// before `start()`.
    pub fn register_code_processor(
        &self,
        code: RequestCode,
        processor: Arc<dyn CodeProcessor>,
        pool: Arc<WorkerPool>,
    ) -> Result<(), RegistrationError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(RegistrationError::ServerStarted);
        }
        self.inner
            .builder
            .lock()
            .unwrap()
            .register_code(code, processor, pool)
    }

    /// Registers a processor for a URI prefix. Prefixes are matched
    /// longest-first, so the most specific registration wins. Must be
    /// called before `start()`.
    pub fn register_uri_processor(
        &self,
        prefix: &str,
        processor: Arc<dyn EventProcessor>,
        pool: Arc<WorkerPool>,
    ) -> Result<(), RegistrationError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(RegistrationError::ServerStarted);
        }
        self.inner
            .builder
            .lock()
            .unwrap()
            .register_uri(prefix, processor, pool)
    }

    /// Freezes the route tables, binds the listener and starts serving on
    /// the runtime. Returns the bound address; binding to port 0 together
    /// with `config.port_file_path` reports the assigned port.
    pub async fn start(&self) -> io::Result<SocketAddr> {
        if self.inner.started() {
            if let Some(addr) = *self.inner.local_addr.lock().unwrap() {
                return Ok(addr);
            }
        }
        self.inner.frozen.store(true, Ordering::Release);
        let table = Arc::new(self.inner.builder.lock().unwrap().freeze());
        *self.inner.routes.write().unwrap() = Some(table);

        info!(addr = %self.inner.config.listen_addr, "binding http handler");
        let listener = match TcpListener::bind(self.inner.config.listen_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "failed to bind http handler");
                self.shutdown().await;
                return Err(err);
            }
        };
        let local_addr = listener.local_addr()?;
        if let Some(path) = self.inner.config.port_file_path.clone() {
            if let Err(err) = common::create_port_file(&path, local_addr.port()) {
                error!(error = %err, path = %path.display(), "failed to report bound port");
                self.shutdown().await;
                return Err(err);
            }
        }
        *self.inner.local_addr.lock().unwrap() = Some(local_addr);

        let mut http = Http::new();
        http.http1_only(true);
        tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            http,
            self.inner.shutdown_rx.clone(),
        ));

        self.inner.started.store(true, Ordering::Release);
        info!(addr = %local_addr, "http handler serving");
        Ok(local_addr)
    }

    /// Stops serving: new requests are refused, the accept loop exits and
    /// every route pool plus the completer pool is drained and joined.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.started.store(false, Ordering::Release);
        let _ = self.inner.shutdown_tx.send(true);

        let mut pools: Vec<Arc<WorkerPool>> = Vec::new();
        if let Some(table) = self.inner.routes() {
            pools.extend(table.pools());
        }
        pools.extend(self.inner.builder.lock().unwrap().pools());
        pools.push(Arc::clone(&self.inner.completer));
        let drained = tokio::task::spawn_blocking(move || {
            for pool in pools {
                pool.shutdown();
            }
        })
        .await;
        if drained.is_err() {
            warn!("worker pool drain did not run to completion");
        }
        info!("http handler shut down");
    }

    pub fn is_started(&self) -> bool {
        self.inner.started()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Live connection count, as maintained by the connection gate.
    pub fn live_connections(&self) -> usize {
        self.inner.live_connections.load(Ordering::SeqCst)
    }
}

/// Decrements the live-connection count exactly once, when the channel
/// goes inactive.
struct ConnectionPermit {
    inner: Arc<Inner>,
}

impl ConnectionPermit {
    fn acquire(inner: &Arc<Inner>) -> (ConnectionPermit, usize) {
        let live = inner.live_connections.fetch_add(1, Ordering::SeqCst) + 1;
        inner.metrics.connections.inc();
        (
            ConnectionPermit {
                inner: Arc::clone(inner),
            },
            live,
        )
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.inner.live_connections.fetch_sub(1, Ordering::SeqCst);
        self.inner.metrics.connections.dec();
    }
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    http: Http,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((tcp_stream, remote)) => {
                inner.metrics.connections_total.inc();
                let connection_start_time = Instant::now();
                let (permit, live) = ConnectionPermit::acquire(&inner);
                if live > inner.config.max_connections {
                    inner
                        .metrics
                        .observe_connection_error(ConnectionError::Refused);
                    debug!(%remote, live, "connection refused: at capacity");
                    // Dropping the stream is the whole rejection; the
                    // permit's drop restores the count.
                    drop(tcp_stream);
                    drop(permit);
                    continue;
                }
                tokio::spawn(serve_connection(
                    Arc::clone(&inner),
                    http.clone(),
                    tcp_stream,
                    remote,
                    permit,
                    connection_start_time,
                ));
            }
            // Don't exit the loop on a connection error. We will want to
            // continue serving.
            Err(err) => {
                inner
                    .metrics
                    .observe_connection_error(ConnectionError::Accept);
                error!(error = %err, "failed to accept connection");
            }
        }
    }
    debug!("accept loop stopped");
}

async fn serve_connection(
    inner: Arc<Inner>,
    http: Http,
    tcp_stream: TcpStream,
    remote: SocketAddr,
    permit: ConnectionPermit,
    connection_start_time: Instant,
) {
    // Held for the lifetime of the connection; dropping it marks the
    // channel inactive.
    let _permit = permit;

    let layer = if inner.config.use_tls && inner.tls.is_some() {
        AppLayer::Https
    } else {
        AppLayer::Http
    };
    let service = create_main_service(Arc::clone(&inner), remote, layer);
    let io = IdleTimeout::new(tcp_stream, inner.config.idle_timeout());

    let connection_result = match (layer, inner.tls.as_ref()) {
        (AppLayer::Https, Some(acceptor)) => {
            let tls_stream = match acceptor.accept(io).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    inner
                        .metrics
                        .observe_connection_error(ConnectionError::TlsHandshake);
                    warn!(error = %err, %remote, "tls handshake failed");
                    return;
                }
            };
            inner
                .metrics
                .observe_successful_connection_setup(layer, connection_start_time);
            http.serve_connection(tls_stream, service).await
        }
        _ => {
            inner
                .metrics
                .observe_successful_connection_setup(layer, connection_start_time);
            http.serve_connection(io, service).await
        }
    };

    match connection_result {
        Ok(()) => inner
            .metrics
            .observe_connection_termination(layer, ConnectionTermination::Graceful),
        Err(err) if is_idle_timeout(&err) => {
            inner
                .metrics
                .observe_connection_termination(layer, ConnectionTermination::Idle);
            info!(%remote, "closed idle connection");
        }
        Err(err) => {
            inner
                .metrics
                .observe_connection_termination(layer, ConnectionTermination::Abrupt);
            warn!(
                error = %err,
                %remote,
                elapsed = ?connection_start_time.elapsed(),
                "connection closed abruptly"
            );
        }
    }
}

fn is_idle_timeout(err: &hyper::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return io_err.kind() == io::ErrorKind::TimedOut;
        }
        source = cause.source();
    }
    false
}

type RequestWithTimer = (Request<Body>, RequestTimer);
type ResponseWithTimer = (Response<Body>, RequestTimer);

fn create_main_service(
    inner: Arc<Inner>,
    remote: SocketAddr,
    layer: AppLayer,
) -> BoxService<Request<Body>, Response<Body>, HttpError> {
    let metrics_for_map_request = inner.metrics.clone();
    let route_service = service_fn(move |(request, mut timer): RequestWithTimer| {
        let inner = Arc::clone(&inner);
        async move {
            let channel = ChannelContext { remote, layer };
            let response = dispatch::dispatch_request(&inner, channel, request, &mut timer).await;
            Ok::<ResponseWithTimer, HttpError>((response, timer))
        }
    });
    BoxService::new(
        ServiceBuilder::new()
            // Attach a timer as soon as we see a request.
            .map_request(move |request: Request<Body>| {
                let timer = RequestTimer::start(metrics_for_map_request.requests.clone());
                (request, timer)
            })
            .service(route_service)
            .map_result(|result: Result<ResponseWithTimer, HttpError>| match result {
                Ok((response, mut timer)) => {
                    timer.set_label(LABEL_STATUS, response.status().as_str());
                    Ok::<_, HttpError>(response)
                }
                Err(err) => Err(err),
            }),
    )
}
