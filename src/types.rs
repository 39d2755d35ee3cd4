//! Protocol-level types shared across the handler: header keys, the
//! protocol version and request-code enums, result codes, and the two
//! request envelopes (`CodeCommand` for legacy request-code commands,
//! `EventWrapper` for URI-routed event commands).

use std::collections::BTreeMap;
use std::fmt;

use http::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use http::{Method, Response, Version};
use hyper::Body;
use serde_json::{Map, Value};

use crate::common::current_millis;

/// Wire names of the protocol headers. Incoming HTTP header names are
/// case-insensitive; the envelope header maps use these lowercase forms
/// as canonical keys.
pub const VERSION: &str = "version";
pub const REQUEST_CODE: &str = "code";
pub const REQ_C2EVENTMESH_TIMESTAMP: &str = "req_c2eventmesh_timestamp";
pub const IP: &str = "ip";
pub const REQ_SEND_EVENTMESH_IP: &str = "req_send_eventmesh_ip";

const CONTENT_TYPE_JSON: &str = "application/json";

/// Application layer of an accepted connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppLayer {
    Http,
    Https,
}

impl AppLayer {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AppLayer::Http => "http",
            AppLayer::Https => "https",
        }
    }
}

/// Recognized protocol versions carried in the `version` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1.0",
            ProtocolVersion::V2 => "2.0",
        }
    }

    pub fn parse(value: &str) -> Option<ProtocolVersion> {
        match value {
            "1.0" => Some(ProtocolVersion::V1),
            "2.0" => Some(ProtocolVersion::V2),
            _ => None,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V1
    }
}

/// Numeric command identifiers selecting a legacy processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum RequestCode {
    MsgSendSync = 101,
    MsgBatchSend = 102,
    MsgSendAsync = 104,
    HttpPushClientAsync = 105,
    HttpPushClientSync = 106,
    Register = 201,
    Unregister = 202,
    Heartbeat = 203,
    Subscribe = 206,
    Unsubscribe = 207,
    ReplyMessage = 301,
    AdminMetrics = 603,
}

impl RequestCode {
    pub fn value(self) -> i32 {
        self as i32
    }

    pub fn from_value(value: i32) -> Option<RequestCode> {
        match value {
            101 => Some(RequestCode::MsgSendSync),
            102 => Some(RequestCode::MsgBatchSend),
            104 => Some(RequestCode::MsgSendAsync),
            105 => Some(RequestCode::HttpPushClientAsync),
            106 => Some(RequestCode::HttpPushClientSync),
            201 => Some(RequestCode::Register),
            202 => Some(RequestCode::Unregister),
            203 => Some(RequestCode::Heartbeat),
            206 => Some(RequestCode::Subscribe),
            207 => Some(RequestCode::Unsubscribe),
            301 => Some(RequestCode::ReplyMessage),
            603 => Some(RequestCode::AdminMetrics),
            _ => None,
        }
    }

    /// Parses the stringified form carried on the wire.
    pub fn parse(value: &str) -> Option<RequestCode> {
        value.trim().parse::<i32>().ok().and_then(RequestCode::from_value)
    }
}

impl fmt::Display for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Mesh-level result codes carried in response envelopes. Dispatch-level
/// failures are reported with HTTP 200 plus one of these codes; plain HTTP
/// statuses are reserved for request validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum RetCode {
    Success = 0,
    RuntimeError = 2,
    RequestCodeInvalid = 3,
    RejectedByProcessor = 8,
    Overload = 10,
}

impl RetCode {
    pub fn value(self) -> i32 {
        self as i32
    }

    pub fn default_message(self) -> &'static str {
        match self {
            RetCode::Success => "success",
            RetCode::RuntimeError => "eventmesh runtime error",
            RetCode::RequestCodeInvalid => "request code invalid",
            RetCode::RejectedByProcessor => "rejected by processor",
            RetCode::Overload => "eventmesh overloaded",
        }
    }
}

/// Maps an HTTP version to the flavor string attached to trace spans.
pub(crate) fn http_flavor(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2.0",
        _ => "unknown",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandBuildError {
    #[error("request code `{header}` in header conflicts with `{resolved}`")]
    CodeMismatch { header: String, resolved: String },
    #[error("request code `{0}` is not numeric")]
    NotNumeric(String),
}

/// A request/response envelope that can be completed with a result code and
/// rendered as an HTTP response.
pub trait RequestEnvelope: Send + Sync + Sized + 'static {
    /// Builds the response counterpart of this envelope.
    fn create_response(&self, ret: RetCode, msg: String) -> Self;

    /// The result carried by a response envelope; `None` on a request.
    fn result(&self) -> Option<(RetCode, &str)>;

    fn req_time(&self) -> i64;

    /// Renders a completed envelope as a keep-alive JSON response.
    fn http_response(&self) -> Response<Body>;
}

fn envelope_body(ret: RetCode, msg: &str, payload: &Map<String, Value>) -> Vec<u8> {
    let mut envelope = Map::new();
    envelope.insert("retCode".to_owned(), Value::from(ret.value()));
    envelope.insert("retMsg".to_owned(), Value::from(msg));
    envelope.insert("resTime".to_owned(), Value::from(current_millis()));
    for (key, value) in payload {
        envelope.entry(key.clone()).or_insert_with(|| value.clone());
    }
    serde_json::to_vec(&envelope).unwrap()
}

pub(crate) fn json_response(bytes: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(bytes));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// A legacy request-code command and, once completed, its response.
#[derive(Clone, Debug)]
pub struct CodeCommand {
    pub http_method: Method,
    pub http_version: Version,
    pub request_code: String,
    pub header: BTreeMap<String, String>,
    pub body: Map<String, Value>,
    pub req_time: i64,
    res_code: Option<RetCode>,
    res_msg: Option<String>,
}

impl CodeCommand {
    pub fn build(
        http_method: Method,
        http_version: Version,
        request_code: String,
        header: BTreeMap<String, String>,
        body: Map<String, Value>,
        req_time: i64,
    ) -> Result<CodeCommand, CommandBuildError> {
        if request_code.trim().parse::<i32>().is_err() {
            return Err(CommandBuildError::NotNumeric(request_code));
        }
        if let Some(header_code) = header.get(REQUEST_CODE) {
            if header_code != &request_code {
                return Err(CommandBuildError::CodeMismatch {
                    header: header_code.clone(),
                    resolved: request_code,
                });
            }
        }
        Ok(CodeCommand {
            http_method,
            http_version,
            request_code,
            header,
            body,
            req_time,
            res_code: None,
            res_msg: None,
        })
    }

    /// Response with a result code and an empty payload.
    pub fn create_http_command_response(&self, ret: RetCode, msg: String) -> CodeCommand {
        self.create_http_command_response_with_body(ret, msg, Map::new())
    }

    /// Response carrying a processor payload merged into the envelope.
    pub fn create_http_command_response_with_body(
        &self,
        ret: RetCode,
        msg: String,
        payload: Map<String, Value>,
    ) -> CodeCommand {
        CodeCommand {
            http_method: self.http_method.clone(),
            http_version: self.http_version,
            request_code: self.request_code.clone(),
            header: self.header.clone(),
            body: payload,
            req_time: self.req_time,
            res_code: Some(ret),
            res_msg: Some(msg),
        }
    }
}

impl RequestEnvelope for CodeCommand {
    fn create_response(&self, ret: RetCode, msg: String) -> Self {
        self.create_http_command_response(ret, msg)
    }

    fn result(&self) -> Option<(RetCode, &str)> {
        match (self.res_code, &self.res_msg) {
            (Some(code), Some(msg)) => Some((code, msg.as_str())),
            _ => None,
        }
    }

    fn req_time(&self) -> i64 {
        self.req_time
    }

    fn http_response(&self) -> Response<Body> {
        let (ret, msg) = match self.result() {
            Some(result) => result,
            // A command that was never completed carries no result; render
            // it as a runtime error rather than fabricating success.
            None => (RetCode::RuntimeError, "incomplete command"),
        };
        json_response(envelope_body(ret, msg, &self.body))
    }
}

/// A URI-routed event command. The decoded body travels as canonical JSON
/// bytes so event processors see one representation regardless of the
/// original content type.
#[derive(Clone, Debug)]
pub struct EventWrapper {
    pub http_version: Version,
    pub request_uri: String,
    pub header_map: BTreeMap<String, String>,
    pub body_bytes: Vec<u8>,
    pub req_time: i64,
    res: Option<(RetCode, String)>,
}

impl EventWrapper {
    pub fn new(
        http_version: Version,
        request_uri: String,
        header_map: BTreeMap<String, String>,
        body_bytes: Vec<u8>,
        req_time: i64,
    ) -> EventWrapper {
        EventWrapper {
            http_version,
            request_uri,
            header_map,
            body_bytes,
            req_time,
            res: None,
        }
    }

    /// Response wrapper whose body is the bare result envelope.
    pub fn create_http_response(&self, ret: RetCode, msg: String) -> EventWrapper {
        let body = envelope_body(ret, &msg, &Map::new());
        self.create_http_response_with_body(ret, msg, body)
    }

    /// Response wrapper carrying a processor-provided JSON body.
    pub fn create_http_response_with_body(
        &self,
        ret: RetCode,
        msg: String,
        body_bytes: Vec<u8>,
    ) -> EventWrapper {
        EventWrapper {
            http_version: self.http_version,
            request_uri: self.request_uri.clone(),
            header_map: self.header_map.clone(),
            body_bytes,
            req_time: self.req_time,
            res: Some((ret, msg)),
        }
    }
}

impl RequestEnvelope for EventWrapper {
    fn create_response(&self, ret: RetCode, msg: String) -> Self {
        self.create_http_response(ret, msg)
    }

    fn result(&self) -> Option<(RetCode, &str)> {
        self.res.as_ref().map(|(code, msg)| (*code, msg.as_str()))
    }

    fn req_time(&self) -> i64 {
        self.req_time
    }

    fn http_response(&self) -> Response<Body> {
        json_response(self.body_bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_parses_known_values() {
        assert_eq!(ProtocolVersion::parse("1.0"), Some(ProtocolVersion::V1));
        assert_eq!(ProtocolVersion::parse("2.0"), Some(ProtocolVersion::V2));
        assert_eq!(ProtocolVersion::parse("3.0"), None);
        assert_eq!(ProtocolVersion::parse(""), None);
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::V1);
    }

    #[test]
    fn request_code_round_trips_through_wire_form() {
        assert_eq!(RequestCode::parse("101"), Some(RequestCode::MsgSendSync));
        assert_eq!(RequestCode::parse(" 206 "), Some(RequestCode::Subscribe));
        assert_eq!(RequestCode::parse("9999"), None);
        assert_eq!(RequestCode::parse("abc"), None);
        assert_eq!(RequestCode::MsgSendSync.to_string(), "101");
    }

    #[test]
    fn code_command_response_envelope_shape() {
        let cmd = CodeCommand::build(
            Method::POST,
            Version::HTTP_11,
            "101".to_owned(),
            BTreeMap::new(),
            Map::new(),
            7,
        )
        .unwrap();
        let mut payload = Map::new();
        payload.insert("msgId".to_owned(), Value::from("m-1"));
        let response = cmd.create_http_command_response_with_body(
            RetCode::Success,
            "success".to_owned(),
            payload,
        );

        let rendered = response.http_response();
        assert_eq!(rendered.status(), http::StatusCode::OK);
        assert_eq!(
            rendered.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(rendered.headers().get(CONNECTION).unwrap(), "keep-alive");

        let (code, msg) = response.result().unwrap();
        assert_eq!(code, RetCode::Success);
        assert_eq!(msg, "success");
    }

    #[test]
    fn code_command_build_rejects_conflicting_header() {
        let mut header = BTreeMap::new();
        header.insert(REQUEST_CODE.to_owned(), "102".to_owned());
        let err = CodeCommand::build(
            Method::GET,
            Version::HTTP_11,
            "101".to_owned(),
            header,
            Map::new(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, CommandBuildError::CodeMismatch { .. }));
    }

    #[test]
    fn envelope_payload_cannot_clobber_result_fields() {
        let mut payload = Map::new();
        payload.insert("retCode".to_owned(), Value::from(42));
        let body = envelope_body(RetCode::Success, "success", &payload);
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["retCode"], Value::from(0));
        assert_eq!(parsed["retMsg"], Value::from("success"));
        assert!(parsed.get("resTime").is_some());
    }

    #[test]
    fn event_wrapper_error_response_is_an_envelope() {
        let wrapper = EventWrapper::new(
            Version::HTTP_11,
            "/eventmesh/publish".to_owned(),
            BTreeMap::new(),
            Vec::new(),
            0,
        );
        let response = wrapper.create_http_response(
            RetCode::Overload,
            RetCode::Overload.default_message().to_owned(),
        );
        let parsed: Value = serde_json::from_slice(&response.body_bytes).unwrap();
        assert_eq!(parsed["retCode"], Value::from(RetCode::Overload.value()));
        let (code, _) = response.result().unwrap();
        assert_eq!(code, RetCode::Overload);
    }
}
