//! Per-request context: authenticated client identity and internal flags.

/// Claims extracted from the caller's credentials by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub client_id: String,
}

/// Explicit request context passed into every server method.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated caller, if any.
    pub auth_claims: Option<AuthClaims>,
    /// Bypasses the self-authorization gate. Set for internal calls that
    /// must not recurse through the gate.
    pub skip_authz_check: bool,
}

impl RequestContext {
    /// A context with no authenticated caller.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A context authenticated as `client_id`.
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            auth_claims: Some(AuthClaims {
                client_id: client_id.into(),
            }),
            skip_authz_check: false,
        }
    }

    /// Marks this context as exempt from the self-authorization gate.
    pub fn skipping_authz(mut self) -> Self {
        self.skip_authz_check = true;
        self
    }
}
