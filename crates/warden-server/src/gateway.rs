//! Response metadata hand-off to the transport layer.
//!
//! The server does not own an RPC transport; it reports response headers
//! (resolved model id, HTTP status hints) through this seam and the
//! gateway in front of it renders them.

use std::sync::Mutex;

/// Header carrying the resolved authorization model id.
pub const AUTHORIZATION_MODEL_ID_HEADER: &str = "Warden-Authorization-Model-Id";
/// Header hinting the HTTP status code for mutating responses.
pub const X_HTTP_CODE_HEADER: &str = "X-Http-Code";

/// The connection transport the server reports headers through.
pub trait Transport: Send + Sync {
    fn set_header(&self, key: &str, value: &str);
}

/// Transport that discards headers; the default.
#[derive(Debug, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn set_header(&self, _key: &str, _value: &str) {}
}

/// Transport that records headers; used by gateways buffering a response
/// and by tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    headers: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.headers
            .lock()
            .expect("transport header mutex poisoned")
            .clone()
    }

    pub fn last(&self, key: &str) -> Option<String> {
        self.headers()
            .into_iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

impl Transport for RecordingTransport {
    fn set_header(&self, key: &str, value: &str) {
        self.headers
            .lock()
            .expect("transport header mutex poisoned")
            .push((key.to_string(), value.to_string()));
    }
}
