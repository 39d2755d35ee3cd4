//! Header enrichment and request validation. Enrichment runs first so
//! every downstream consumer (and every error response) sees the stamped
//! ingress timestamp, client address and server address.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use http::{HeaderMap, Method, StatusCode};

use crate::common::current_millis;
use crate::types::{self, ProtocolVersion};
use crate::HttpError;

/// Snapshots the request headers into the canonical string map and stamps
/// the ingress attributes. Returns the map and the ingress timestamp used
/// as the request time everywhere downstream.
pub(crate) fn enrich_headers(
    headers: &HeaderMap,
    remote: SocketAddr,
    server_ip: IpAddr,
) -> (BTreeMap<String, String>, i64) {
    let mut map = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            map.insert(name.as_str().to_owned(), text.to_owned());
        }
    }

    let req_time = current_millis();
    map.insert(
        types::REQ_C2EVENTMESH_TIMESTAMP.to_owned(),
        req_time.to_string(),
    );
    let version_blank = map
        .get(types::VERSION)
        .map(|v| v.trim().is_empty())
        .unwrap_or(true);
    if version_blank {
        map.insert(
            types::VERSION.to_owned(),
            ProtocolVersion::default().as_str().to_owned(),
        );
    }
    map.insert(types::IP.to_owned(), remote.ip().to_string());
    map.insert(
        types::REQ_SEND_EVENTMESH_IP.to_owned(),
        server_ip.to_string(),
    );
    (map, req_time)
}

pub(crate) fn validate_request(
    started: bool,
    method: &Method,
    header_map: &BTreeMap<String, String>,
) -> Result<ProtocolVersion, HttpError> {
    if !started {
        return Err(HttpError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "service is not started".to_owned(),
        });
    }
    if *method != Method::GET && *method != Method::POST {
        return Err(HttpError {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: format!(
                "unsupported method: {}. supported methods: GET, POST",
                method
            ),
        });
    }
    let version = header_map
        .get(types::VERSION)
        .map(String::as_str)
        .unwrap_or("");
    ProtocolVersion::parse(version).ok_or_else(|| HttpError {
        status: StatusCode::BAD_REQUEST,
        message: format!("unknown protocol version `{}`", version),
    })
}
