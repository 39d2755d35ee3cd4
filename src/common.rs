//! Response constructors and small helpers shared across the handler.

use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use http::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use http::{Response, StatusCode};
use hyper::Body;
use serde_json::Map;
use tempfile::NamedTempFile;

use crate::types::{self, RetCode};

pub(crate) fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Status-only plaintext response. These are emitted for request
/// validation failures and the channel is torn down once they flush.
pub(crate) fn make_plaintext_response(
    status: StatusCode,
    message: String,
    charset: &str,
) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    let content_type = format!("text/plain; charset={}", charset);
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Bare result envelope, used when no request envelope is available to
/// render one (e.g. a worker abandoned its context).
pub(crate) fn make_envelope_response(ret: RetCode, msg: &str) -> Response<Body> {
    let mut envelope = Map::new();
    envelope.insert("retCode".to_owned(), ret.value().into());
    envelope.insert("retMsg".to_owned(), msg.into());
    envelope.insert("resTime".to_owned(), current_millis().into());
    types::json_response(serde_json::to_vec(&envelope).unwrap())
}

/// Reports the bound port by writing it to a temporary file in the target
/// directory and renaming it into place, so readers never observe a
/// partial write.
pub(crate) fn create_port_file(path: &Path, port: u16) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("port file {} has no parent directory", path.display()),
        )
    })?;
    let mut port_file = NamedTempFile::new_in(dir)?;
    write!(port_file, "{}", port)?;
    port_file.flush()?;
    port_file
        .persist(path)
        .map_err(|persist_err| persist_err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_response_closes_the_channel() {
        let response =
            make_plaintext_response(StatusCode::METHOD_NOT_ALLOWED, "nope".to_owned(), "utf-8");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
    }

    #[test]
    fn envelope_fallback_carries_the_ret_code() {
        let response = make_envelope_response(RetCode::RuntimeError, "boom");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn port_file_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("http.port");
        create_port_file(&path, 4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242");
        // Overwriting is fine; the rename replaces the previous report.
        create_port_file(&path, 4243).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4243");
    }
}
