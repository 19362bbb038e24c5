//! The request pipeline: validate, build the outbound call, fetch, classify
//! the answer and shape what goes back to the client.
//!
//! One [`Forwarder::forward`] call owns everything it touches except the
//! cookie store. Dropping the future (client went away) drops the in-flight
//! upstream request with it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use log::{debug, error, info, warn};
use reqwest::{Client, redirect};
use url::{Host, Url};

use crate::config::ServerConfig;
use crate::cookies::CookieStore;
use crate::error::ProxyError;
use crate::headers;
use crate::rewrite::{self, ContentRewriter, RewriteContext};

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// A client request as the endpoint received it, before any validation.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub url: Option<String>,
    pub session: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A validated request, ready to be sent upstream.
#[derive(Debug, Clone)]
pub struct TargetRequest {
    pub method: Method,
    pub target_url: Url,
    pub session_key: String,
    pub inbound_headers: HeaderMap,
    /// Only kept for methods that carry a body.
    pub body: Option<Bytes>,
}

/// How an upstream response is turned into the client response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    PassThrough,
    RedirectRewrite,
    HtmlRewrite,
}

/// What the endpoint writes back to the client.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub branch: Branch,
}

impl IntoResponse for ForwardedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

pub struct Forwarder {
    client: Client,
    cookies: Arc<dyn CookieStore>,
    rewriter: ContentRewriter,
    user_agent: HeaderValue,
    mount_path: String,
    default_session: String,
    timeout: Duration,
    allow_loopback: bool,
}

impl Forwarder {
    pub fn new(config: &ServerConfig, cookies: Arc<dyn CookieStore>) -> Result<Self> {
        // Redirects are answered to the client, never followed here.
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(config.upstream.timeout())
            .connect_timeout(config.upstream.connect_timeout())
            .build()
            .context("Failed to build upstream HTTP client")?;

        let user_agent = match &config.upstream.user_agent {
            Some(ua) => ua.clone(),
            None => ua_generator::ua::spoof_ua().to_string(),
        };
        let user_agent =
            HeaderValue::from_str(&user_agent).context("User-Agent is not a valid header value")?;

        Ok(Self {
            client,
            cookies,
            rewriter: ContentRewriter::new(config.inject_frame_shim),
            user_agent,
            mount_path: config.mount_path.clone(),
            default_session: config.default_session.clone(),
            timeout: config.upstream.timeout(),
            allow_loopback: config.allow_loopback,
        })
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.to_str().unwrap_or_default()
    }

    /// Run one request through the whole pipeline.
    pub async fn forward(&self, inbound: InboundRequest) -> Result<ForwardedResponse, ProxyError> {
        let request = self
            .validate(inbound)
            .inspect_err(|e| warn!("Rejected request: {e}"))?;
        let result = self.exchange(&request).await;

        match &result {
            Ok(response) => info!(
                "[{}] {} {} -> {} ({:?})",
                request.session_key,
                request.method,
                request.target_url,
                response.status.as_u16(),
                response.branch
            ),
            Err(e) => error!(
                "[{}] {} {} failed ({}): {e}",
                request.session_key,
                request.method,
                request.target_url,
                e.kind()
            ),
        }
        result
    }

    /// Reject anything that must not reach the network.
    pub fn validate(&self, inbound: InboundRequest) -> Result<TargetRequest, ProxyError> {
        let raw = inbound
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ProxyError::invalid("Missing url parameter"))?;

        let target_url =
            Url::parse(raw).map_err(|e| ProxyError::invalid(format!("Invalid url {raw:?}: {e}")))?;
        if !matches!(target_url.scheme(), "http" | "https") {
            return Err(ProxyError::invalid(format!(
                "Unsupported scheme {:?}, only http and https can be proxied",
                target_url.scheme()
            )));
        }
        if target_url.host().is_none() {
            return Err(ProxyError::invalid(format!("Url {raw:?} has no host")));
        }
        if !self.allow_loopback && is_loopback(&target_url) {
            return Err(ProxyError::invalid(format!(
                "Refusing to proxy loopback host {:?}",
                target_url.host_str().unwrap_or_default()
            )));
        }

        let session_key = inbound
            .session
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.default_session.clone());

        let body = carries_body(&inbound.method).then_some(inbound.body);

        Ok(TargetRequest {
            method: inbound.method,
            target_url,
            session_key,
            inbound_headers: inbound.headers,
            body,
        })
    }

    /// Outbound headers: policy-filtered client headers, a browser-like
    /// User-Agent when the client sent none, and the session's cookies.
    pub fn outbound_headers(&self, request: &TargetRequest) -> HeaderMap {
        let mut out = headers::filter_outbound(&request.inbound_headers);

        if !out.contains_key(header::USER_AGENT) {
            out.insert(header::USER_AGENT, self.user_agent.clone());
        }

        // The store lock is held only for this read, never across the fetch.
        let cookie = self.cookies.get(&request.session_key);
        if !cookie.is_empty() {
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    out.insert(header::COOKIE, value);
                }
                Err(e) => warn!("[{}] stored cookies unusable: {e}", request.session_key),
            }
        }

        out
    }

    async fn exchange(&self, request: &TargetRequest) -> Result<ForwardedResponse, ProxyError> {
        let mut outbound = self
            .client
            .request(request.method.clone(), request.target_url.clone())
            .headers(self.outbound_headers(request));
        if let Some(body) = &request.body {
            outbound = outbound.body(body.clone());
        }

        debug!(
            "[{}] awaiting upstream {} {}",
            request.session_key, request.method, request.target_url
        );
        let upstream = outbound
            .send()
            .await
            .map_err(|e| ProxyError::from_upstream(e, self.timeout))?;

        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();
        let branch = classify(&request.method, status, &upstream_headers);
        debug!("[{}] upstream answered {status}, {branch:?}", request.session_key);

        match branch {
            Branch::RedirectRewrite => {
                // The redirect body is never read; dropping the response releases it.
                drop(upstream);
                self.absorb_cookies(request, &upstream_headers);
                self.redirect_response(request, status, &upstream_headers)
            }
            Branch::HtmlRewrite | Branch::PassThrough => {
                let body = upstream
                    .bytes()
                    .await
                    .map_err(|e| ProxyError::from_upstream(e, self.timeout))?;
                self.absorb_cookies(request, &upstream_headers);

                if branch == Branch::HtmlRewrite {
                    match self.rewrite_html(request, &upstream_headers, &body) {
                        Ok(html) => {
                            let mut headers = headers::filter_inbound(&upstream_headers, true);
                            headers.insert(
                                header::CONTENT_TYPE,
                                HeaderValue::from_static(HTML_CONTENT_TYPE),
                            );
                            return Ok(ForwardedResponse {
                                status,
                                headers,
                                body: Bytes::from(html),
                                branch,
                            });
                        }
                        Err(e) => warn!(
                            "[{}] {} served without rewriting: {e}",
                            request.session_key, request.target_url
                        ),
                    }
                }

                Ok(ForwardedResponse {
                    status,
                    headers: headers::filter_inbound(&upstream_headers, false),
                    body,
                    branch: Branch::PassThrough,
                })
            }
        }
    }

    fn absorb_cookies(&self, request: &TargetRequest, upstream_headers: &HeaderMap) {
        let set_cookies: Vec<String> = upstream_headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        if !set_cookies.is_empty() {
            self.cookies.absorb(&request.session_key, &set_cookies);
        }
    }

    fn context(&self, request: &TargetRequest) -> RewriteContext {
        RewriteContext::new(
            request.target_url.clone(),
            self.mount_path.as_str(),
            request.session_key.as_str(),
        )
    }

    fn redirect_response(
        &self,
        request: &TargetRequest,
        status: StatusCode,
        upstream_headers: &HeaderMap,
    ) -> Result<ForwardedResponse, ProxyError> {
        let mut headers = headers::filter_inbound(upstream_headers, true);

        let location = upstream_headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        match rewrite_location(&self.context(request), location) {
            Some(proxied) => {
                let value = HeaderValue::from_str(&proxied)
                    .map_err(|e| ProxyError::Internal(format!("rewritten Location: {e}")))?;
                headers.insert(header::LOCATION, value);
            }
            None => warn!(
                "[{}] Location {location:?} forwarded unchanged",
                request.session_key
            ),
        }

        Ok(ForwardedResponse {
            status,
            headers,
            body: Bytes::new(),
            branch: Branch::RedirectRewrite,
        })
    }

    fn rewrite_html(
        &self,
        request: &TargetRequest,
        upstream_headers: &HeaderMap,
        body: &[u8],
    ) -> Result<String, ProxyError> {
        // The client only decodes what it negotiated; anything left encoded is opaque.
        if let Some(encoding) = upstream_headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .filter(|encoding| !encoding.trim().eq_ignore_ascii_case("identity"))
        {
            return Err(ProxyError::UpstreamMalformed(format!(
                "undecoded content-encoding {encoding}"
            )));
        }

        let text = rewrite::decode_html(body, content_type(upstream_headers))?;
        Ok(self.rewriter.rewrite(&text, &self.context(request)))
    }
}

fn carries_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

/// Decide which branch an upstream response takes.
///
/// Responses that cannot carry a body (`HEAD`, 1xx, 204, 304) are never
/// rewritten, whatever their content type says.
pub fn classify(method: &Method, status: StatusCode, headers: &HeaderMap) -> Branch {
    let redirect = matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308);
    if redirect && headers.contains_key(header::LOCATION) {
        return Branch::RedirectRewrite;
    }

    let bodiless = *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    let html = content_type(headers)
        .trim_start()
        .get(..9)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("text/html"));
    if html && !bodiless {
        Branch::HtmlRewrite
    } else {
        Branch::PassThrough
    }
}

/// Resolve a `Location` value against the target and route it back through
/// the proxy. `None` when it cannot be resolved to an http(s) URL.
pub fn rewrite_location(ctx: &RewriteContext, location: &str) -> Option<String> {
    let resolved = ctx.target.join(location.trim()).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| ctx.proxied_url(&resolved))
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Some(Host::Ipv6(ip)) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
        None => false,
    }
}
