//! Request body handling: bounded aggregation of the raw bytes, then
//! decoding into the string-keyed attribute map every processor consumes.
//! GET requests decode their query string; POST requests decode JSON,
//! multipart/form-data (file parts are ignored) or form-urlencoded bodies
//! depending on the declared content type.

use std::convert::Infallible;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::stream;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode, Uri};
use hyper::body::HttpBody;
use hyper::Body;
use serde_json::{Map, Value};
use tokio::time::timeout;
use url::form_urlencoded;

use crate::metrics::HttpHandlerMetrics;
use crate::{HttpError, MAX_REQUEST_RECEIVE_DURATION};

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_MULTIPART: &str = "multipart/form-data";

#[derive(Debug, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error("malformed json body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed multipart body: {0}")]
    Multipart(#[from] multer::Error),
    #[error("request body is not a json object")]
    NotAnObject,
}

/// Aggregates the full request body, bounded in size and time. The
/// dispatcher never sees a partial message.
pub(crate) async fn read_body(body: Body, limit: u64) -> Result<Bytes, HttpError> {
    match timeout(MAX_REQUEST_RECEIVE_DURATION, aggregate(body, limit)).await {
        Ok(result) => result,
        Err(_) => Err(HttpError {
            status: StatusCode::REQUEST_TIMEOUT,
            message: format!(
                "request body was not received within {}s",
                MAX_REQUEST_RECEIVE_DURATION.as_secs()
            ),
        }),
    }
}

async fn aggregate(mut body: Body, limit: u64) -> Result<Bytes, HttpError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|err| HttpError {
            status: StatusCode::BAD_REQUEST,
            message: format!("error reading request body: {}", err),
        })?;
        if (buffer.len() + chunk.len()) as u64 > limit {
            return Err(HttpError {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                message: format!("request body exceeds {} bytes", limit),
            });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Decodes a fully-aggregated request into the attribute map, recording
/// the decode latency.
pub(crate) async fn decode_body(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    metrics: &HttpHandlerMetrics,
) -> Result<Map<String, Value>, DecodeError> {
    let start = Instant::now();
    let result = decode(method, uri, headers, body).await;
    metrics.observe_decode_duration(start.elapsed());
    result
}

async fn decode(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Map<String, Value>, DecodeError> {
    if *method == Method::GET {
        return Ok(decode_query_string(uri));
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if content_type.contains(CONTENT_TYPE_JSON) {
        decode_json(body)
    } else if content_type.contains(CONTENT_TYPE_MULTIPART) {
        decode_multipart(content_type, body).await
    } else {
        Ok(decode_form_urlencoded(body))
    }
}

fn decode_query_string(uri: &Uri) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(query) = uri.query() {
        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            // First value wins for repeated parameters.
            map.entry(name.into_owned())
                .or_insert_with(|| Value::String(value.into_owned()));
        }
    }
    map
}

fn decode_json(body: &Bytes) -> Result<Map<String, Value>, DecodeError> {
    if body.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotAnObject),
    }
}

fn decode_form_urlencoded(body: &Bytes) -> Map<String, Value> {
    let mut map = Map::new();
    for (name, value) in form_urlencoded::parse(body) {
        map.entry(name.into_owned())
            .or_insert_with(|| Value::String(value.into_owned()));
    }
    map
}

async fn decode_multipart(
    content_type: &str,
    body: &Bytes,
) -> Result<Map<String, Value>, DecodeError> {
    let boundary = multer::parse_boundary(content_type)?;
    let chunks = stream::iter(std::iter::once(Ok::<Bytes, Infallible>(body.clone())));
    let mut multipart = multer::Multipart::new(chunks, boundary);

    let mut map = Map::new();
    while let Some(field) = multipart.next_field().await? {
        // File parts carry opaque payloads, not attributes.
        if field.file_name().is_some() {
            continue;
        }
        let name = match field.name() {
            Some(name) => name.to_owned(),
            None => continue,
        };
        let value = field.text().await?;
        map.entry(name).or_insert_with(|| Value::String(value));
    }
    Ok(map)
}
