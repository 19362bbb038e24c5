//! HTTP surface of the proxy: the forwarding endpoint on the configured
//! mount path plus a few small JSON endpoints for health and sessions.

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State, rejection::BytesRejection},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD,
        },
    },
    response::{IntoResponse, Json as ResponseJson, Response},
    routing::{any, delete, get},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tower_http::set_header::SetResponseHeaderLayer;
use url::form_urlencoded;

use crate::config::ServerConfig;
use crate::cookies::CookieStore;
use crate::error::ProxyError;
use crate::forwarder::{Forwarder, InboundRequest};

const STATUS_OK: &str = "ok";
const STATUS_NOT_FOUND: &str = "not_found";

/// Response for the index endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResponse {
    pub msg: String,
    pub version: String,
    #[serde(rename = "userAgent")]
    pub user_agent: String,
}

/// Response for the health check endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<String>,
}

/// Query parameters understood by the proxy endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyParams {
    pub url: Option<String>,
    pub session: Option<String>,
}

impl ProxyParams {
    /// Percent-decode `url` and `session`; the first occurrence of each wins.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = ProxyParams::default();
        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "url" if params.url.is_none() => params.url = Some(value.into_owned()),
                "session" if params.session.is_none() => {
                    params.session = Some(value.into_owned())
                }
                _ => {}
            }
        }
        params
    }
}

#[derive(Clone)]
struct AppState {
    forwarder: Arc<Forwarder>,
    cookies: Arc<dyn CookieStore>,
}

pub struct ProxyApi {
    config: ServerConfig,
    forwarder: Arc<Forwarder>,
    cookies: Arc<dyn CookieStore>,
}

impl ProxyApi {
    pub fn new(config: ServerConfig, forwarder: Forwarder, cookies: Arc<dyn CookieStore>) -> Self {
        Self {
            config,
            forwarder: Arc::new(forwarder),
            cookies,
        }
    }

    /// Build the Axum router with all endpoints.
    pub fn create_router(&self) -> Router {
        let state = AppState {
            forwarder: Arc::clone(&self.forwarder),
            cookies: Arc::clone(&self.cookies),
        };

        Router::new()
            .route("/", get(index))
            .route("/health", get(health))
            .route("/sessions", get(list_sessions))
            .route("/sessions/{session}", delete(destroy_session))
            .route(&self.config.mount_path, any(proxy_handler))
            .with_state(state)
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(SetResponseHeaderLayer::overriding(
                ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("*"),
            ))
    }
}

/// Handler for the index page ("/").
async fn index(State(state): State<AppState>) -> ResponseJson<IndexResponse> {
    ResponseJson(IndexResponse {
        msg: "Proxy is ready!".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        user_agent: state.forwarder.user_agent().to_string(),
    })
}

/// Handler for health check ("/health").
async fn health() -> ResponseJson<HealthResponse> {
    ResponseJson(HealthResponse {
        status: STATUS_OK.to_string(),
    })
}

async fn list_sessions(State(state): State<AppState>) -> ResponseJson<SessionsResponse> {
    ResponseJson(SessionsResponse {
        sessions: state.cookies.sessions(),
    })
}

async fn destroy_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> (StatusCode, ResponseJson<HealthResponse>) {
    if state.cookies.clear(&session) {
        info!("[{session}] cookie jar cleared");
        (
            StatusCode::OK,
            ResponseJson(HealthResponse {
                status: STATUS_OK.to_string(),
            }),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            ResponseJson(HealthResponse {
                status: STATUS_NOT_FOUND.to_string(),
            }),
        )
    }
}

/// The proxy endpoint. Any method; `url` and `session` come from the query.
async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    if method == Method::OPTIONS && headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD) {
        return preflight();
    }

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!("Rejecting request body: {rejection}");
            let err = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ProxyError::PayloadTooLarge(rejection.body_text())
            } else {
                ProxyError::invalid(format!("Could not read request body: {rejection}"))
            };
            return err.into_response();
        }
    };

    let params = ProxyParams::from_query(uri.query());
    let inbound = InboundRequest {
        method,
        url: params.url,
        session: params.session,
        headers,
        body,
    };

    match state.forwarder.forward(inbound).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}

fn preflight() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("*"));
    response
}
