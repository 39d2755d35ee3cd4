use std::time::{Duration, Instant};

use prometheus::core::Collector;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::common::current_millis;
use crate::types::AppLayer;

pub(crate) const LABEL_TYPE: &str = "type";
pub(crate) const LABEL_STATUS: &str = "status";
pub(crate) const REQUESTS_LABEL_NAMES: [&str; 2] = [LABEL_TYPE, LABEL_STATUS];
pub(crate) const REQUESTS_NUM_LABELS: usize = REQUESTS_LABEL_NAMES.len();

// Placeholder used until the real label value is known.
pub(crate) const UNKNOWN_LABEL: &str = "unknown";

pub(crate) const REQUEST_TYPE_CODE: &str = "code";
pub(crate) const REQUEST_TYPE_URI: &str = "uri";
pub(crate) const REQUEST_TYPE_INVALID: &str = "invalid";

#[derive(Clone, Copy, Debug)]
pub(crate) enum ConnectionError {
    Accept,
    Refused,
    TlsHandshake,
}

impl ConnectionError {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionError::Accept => "accept",
            ConnectionError::Refused => "refused",
            ConnectionError::TlsHandshake => "tls_handshake",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum ConnectionTermination {
    Graceful,
    Abrupt,
    Idle,
}

impl ConnectionTermination {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionTermination::Graceful => "graceful",
            ConnectionTermination::Abrupt => "abrupt",
            ConnectionTermination::Idle => "idle",
        }
    }
}

/// Metrics of the http handler, all registered against the registry handed
/// in at construction.
#[derive(Clone)]
pub struct HttpHandlerMetrics {
    pub(crate) requests: HistogramVec,
    requests_total: IntCounter,
    discards_total: IntCounter,
    decode_duration: Histogram,
    request_round_trip: Histogram,
    pub(crate) connections: IntGauge,
    pub(crate) connections_total: IntCounter,
    connection_setup_duration: HistogramVec,
    connection_errors: IntCounterVec,
    connection_terminations: IntCounterVec,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry.register(Box::new(collector.clone())).unwrap();
    collector
}

impl HttpHandlerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests: register(
                registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "eventmesh_http_request_duration_seconds",
                        "HTTP request latency by request type and response status.",
                    ),
                    &REQUESTS_LABEL_NAMES,
                )
                .unwrap(),
            ),
            requests_total: register(
                registry,
                IntCounter::new(
                    "eventmesh_http_requests_total",
                    "Requests that passed validation.",
                )
                .unwrap(),
            ),
            discards_total: register(
                registry,
                IntCounter::new(
                    "eventmesh_http_discarded_requests_total",
                    "Requests discarded because a route worker pool was saturated.",
                )
                .unwrap(),
            ),
            decode_duration: register(
                registry,
                Histogram::with_opts(HistogramOpts::new(
                    "eventmesh_http_body_decode_duration_seconds",
                    "Time spent decoding request bodies.",
                ))
                .unwrap(),
            ),
            request_round_trip: register(
                registry,
                Histogram::with_opts(HistogramOpts::new(
                    "eventmesh_http_request_round_trip_duration_seconds",
                    "Time from request ingress to dispatch completion.",
                ))
                .unwrap(),
            ),
            connections: register(
                registry,
                IntGauge::new("eventmesh_http_connections", "Live TCP connections.").unwrap(),
            ),
            connections_total: register(
                registry,
                IntCounter::new(
                    "eventmesh_http_connections_total",
                    "Accepted TCP connections.",
                )
                .unwrap(),
            ),
            connection_setup_duration: register(
                registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "eventmesh_http_connection_setup_duration_seconds",
                        "Time from accept to a serving connection, by app layer.",
                    ),
                    &["layer"],
                )
                .unwrap(),
            ),
            connection_errors: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "eventmesh_http_connection_errors_total",
                        "Connections torn down before serving, by error.",
                    ),
                    &["error"],
                )
                .unwrap(),
            ),
            connection_terminations: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "eventmesh_http_connection_terminations_total",
                        "Served connections closed, by app layer and reason.",
                    ),
                    &["layer", "reason"],
                )
                .unwrap(),
            ),
        }
    }

    pub(crate) fn observe_http_request(&self) {
        self.requests_total.inc();
    }

    pub(crate) fn observe_http_discard(&self) {
        self.discards_total.inc();
    }

    pub(crate) fn observe_decode_duration(&self, duration: Duration) {
        self.decode_duration.observe(duration.as_secs_f64());
    }

    /// Records end-to-end latency measured from the ingress timestamp
    /// stamped on the request.
    pub(crate) fn observe_request_round_trip(&self, req_time_ms: i64) {
        let elapsed_ms = (current_millis() - req_time_ms).max(0);
        self.request_round_trip
            .observe(Duration::from_millis(elapsed_ms as u64).as_secs_f64());
    }

    pub(crate) fn observe_connection_error(&self, error: ConnectionError) {
        self.connection_errors
            .with_label_values(&[error.as_str()])
            .inc();
    }

    pub(crate) fn observe_successful_connection_setup(
        &self,
        layer: AppLayer,
        connection_start_time: Instant,
    ) {
        self.connection_setup_duration
            .with_label_values(&[layer.as_str()])
            .observe(connection_start_time.elapsed().as_secs_f64());
    }

    pub(crate) fn observe_connection_termination(
        &self,
        layer: AppLayer,
        reason: ConnectionTermination,
    ) {
        self.connection_terminations
            .with_label_values(&[layer.as_str(), reason.as_str()])
            .inc();
    }
}

/// Times one request and observes it on drop with whatever labels were set
/// by then, so every path through the handler is accounted for.
pub(crate) struct RequestTimer {
    requests: HistogramVec,
    labels: [String; REQUESTS_NUM_LABELS],
    start: Instant,
}

impl RequestTimer {
    pub(crate) fn start(requests: HistogramVec) -> RequestTimer {
        RequestTimer {
            requests,
            labels: [UNKNOWN_LABEL.to_owned(), UNKNOWN_LABEL.to_owned()],
            start: Instant::now(),
        }
    }

    pub(crate) fn set_label(&mut self, name: &str, value: &str) {
        if let Some(idx) = REQUESTS_LABEL_NAMES.iter().position(|n| *n == name) {
            self.labels[idx] = value.to_owned();
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let values = [self.labels[0].as_str(), self.labels[1].as_str()];
        self.requests
            .with_label_values(&values)
            .observe(self.start.elapsed().as_secs_f64());
    }
}
