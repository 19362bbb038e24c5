use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

/// Failure kinds a forwarding operation can end in.
///
/// `UpstreamMalformed` and `RewriteFailure` are mostly absorbed inside the
/// forwarder (pass-through fallback, untouched links); they only reach a
/// client when there is nothing left to degrade to.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("request body too large: {0}")]
    PayloadTooLarge(String),

    #[error("upstream did not answer within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("malformed upstream response: {0}")]
    UpstreamMalformed(String),

    #[error("could not rewrite {0}")]
    RewriteFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ProxyError::InvalidRequest(msg.into())
    }

    /// Stable tag used as the `error` field of JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "InvalidRequest",
            ProxyError::PayloadTooLarge(_) => "PayloadTooLarge",
            ProxyError::UpstreamTimeout(_) => "UpstreamTimeout",
            ProxyError::UpstreamUnreachable(_) => "UpstreamUnreachable",
            ProxyError::UpstreamMalformed(_) => "UpstreamMalformed",
            ProxyError::RewriteFailure(_) => "RewriteFailure",
            ProxyError::Internal(_) => "InternalFault",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a transport error from the outbound client.
    pub fn from_upstream(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ProxyError::UpstreamTimeout(timeout)
        } else if err.is_body() || err.is_decode() {
            ProxyError::UpstreamMalformed(err.without_url().to_string())
        } else if err.is_connect() || err.is_request() || err.is_redirect() {
            ProxyError::UpstreamUnreachable(err.without_url().to_string())
        } else {
            ProxyError::Internal(err.without_url().to_string())
        }
    }
}

/// Body of every error response the endpoint produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.kind().to_string(),
            details: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_maps_to_bad_request() {
        let err = ProxyError::invalid("Missing url parameter");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), "InvalidRequest");
        assert_eq!(err.to_string(), "Missing url parameter");
    }

    #[test]
    fn oversized_body_maps_to_payload_too_large() {
        let err = ProxyError::PayloadTooLarge("length limit exceeded".into());
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.kind(), "PayloadTooLarge");
    }

    #[test]
    fn upstream_failures_map_to_server_error() {
        let timeout = ProxyError::UpstreamTimeout(Duration::from_secs(5));
        let unreachable = ProxyError::UpstreamUnreachable("connection refused".into());
        assert_eq!(timeout.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(unreachable.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_ne!(timeout.kind(), unreachable.kind());
    }
}
