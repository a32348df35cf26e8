//! Continuation-token encoding.
//!
//! List endpoints hand out opaque tokens wrapping the storage layer's
//! cursor state; tokens must round-trip verbatim.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::errors::{ServerError, ServerResult};

/// Encodes and decodes continuation tokens.
pub trait Encoder: Send + Sync {
    fn encode(&self, state: &str) -> String;
    fn decode(&self, token: &str) -> ServerResult<String>;

    /// Encodes an optional cursor, passing `None` through.
    fn encode_option(&self, state: Option<String>) -> Option<String> {
        state.map(|s| self.encode(&s))
    }

    /// Decodes an optional token; empty tokens mean "from the start".
    fn decode_option(&self, token: &Option<String>) -> ServerResult<Option<String>> {
        match token {
            None => Ok(None),
            Some(t) if t.is_empty() => Ok(None),
            Some(t) => Ok(Some(self.decode(t)?)),
        }
    }
}

/// Base64 token encoder.
#[derive(Debug, Default)]
pub struct Base64Encoder;

impl Encoder for Base64Encoder {
    fn encode(&self, state: &str) -> String {
        STANDARD.encode(state)
    }

    fn decode(&self, token: &str) -> ServerResult<String> {
        let bytes = STANDARD
            .decode(token)
            .map_err(|_| ServerError::Validation("invalid continuation token".to_string()))?;
        String::from_utf8(bytes)
            .map_err(|_| ServerError::Validation("invalid continuation token".to_string()))
    }
}
