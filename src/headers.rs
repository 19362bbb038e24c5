//! Header policy shared by both directions of a forwarded exchange.
//!
//! Every header name maps to exactly one [`HeaderDecision`]; names that no
//! rule claims are forwarded untouched. The filters below apply the decision
//! to a whole `HeaderMap`.

use axum::http::{HeaderMap, HeaderValue, header};

/// Connection-scoped headers that never cross the proxy.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Which leg of the exchange a header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client headers about to be sent upstream.
    Outbound,
    /// Upstream headers about to be sent to the client. `body_decoded` is set
    /// when the payload was decompressed or replaced by the forwarder.
    Inbound { body_decoded: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    HopByHop,
    /// The forwarder owns this header (host, codecs, lengths).
    ProxyManaged,
    /// The header would stop the page from being framed.
    Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDecision {
    Forward,
    Drop(DropReason),
    /// Keep the header but remove its `frame-ancestors` directive.
    StripFrameAncestors,
}

/// Classify a single header name. First matching rule wins.
pub fn classify(name: &str, direction: Direction) -> HeaderDecision {
    let name = name.to_ascii_lowercase();
    if HOP_BY_HOP.contains(&name.as_str()) {
        return HeaderDecision::Drop(DropReason::HopByHop);
    }

    match direction {
        Direction::Outbound => match name.as_str() {
            "host" | "content-length" | "accept-encoding" => {
                HeaderDecision::Drop(DropReason::ProxyManaged)
            }
            _ => HeaderDecision::Forward,
        },
        Direction::Inbound { body_decoded } => match name.as_str() {
            "content-encoding" | "content-length" if body_decoded => {
                HeaderDecision::Drop(DropReason::ProxyManaged)
            }
            "x-frame-options" => HeaderDecision::Drop(DropReason::Embedding),
            "content-security-policy" => HeaderDecision::StripFrameAncestors,
            _ => HeaderDecision::Forward,
        },
    }
}

/// Remove the `frame-ancestors` directive from a CSP value.
/// Returns `None` when nothing else is left.
pub fn strip_frame_ancestors(policy: &str) -> Option<String> {
    let remaining: Vec<&str> = policy
        .split(';')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            let name = directive.split_whitespace().next().unwrap_or_default();
            !name.eq_ignore_ascii_case("frame-ancestors")
        })
        .collect();

    if remaining.is_empty() {
        None
    } else {
        Some(remaining.join("; "))
    }
}

/// Header names a message nominates as hop-by-hop through its own `Connection` header.
fn connection_nominated(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Apply the policy to every header in `headers`, preserving order and repeats.
pub fn filter(headers: &HeaderMap, direction: Direction) -> HeaderMap {
    let nominated = connection_nominated(headers);
    let mut out = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        if nominated.iter().any(|n| n == name.as_str()) {
            continue;
        }
        match classify(name.as_str(), direction) {
            HeaderDecision::Forward => {
                out.append(name.clone(), value.clone());
            }
            HeaderDecision::Drop(_) => {}
            HeaderDecision::StripFrameAncestors => {
                if let Some(value) = rewrite_csp(value) {
                    out.append(name.clone(), value);
                }
            }
        }
    }

    out
}

fn rewrite_csp(value: &HeaderValue) -> Option<HeaderValue> {
    // Opaque bytes cannot be parsed into directives; forward them unchanged.
    let Ok(text) = value.to_str() else {
        return Some(value.clone());
    };
    let stripped = strip_frame_ancestors(text)?;
    HeaderValue::from_str(&stripped).ok()
}

/// Client headers prepared for the upstream call.
pub fn filter_outbound(headers: &HeaderMap) -> HeaderMap {
    filter(headers, Direction::Outbound)
}

/// Upstream headers prepared for the client.
pub fn filter_inbound(headers: &HeaderMap, body_decoded: bool) -> HeaderMap {
    filter(headers, Direction::Inbound { body_decoded })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn hop_by_hop_dropped_in_both_directions() {
        for name in HOP_BY_HOP {
            assert_eq!(
                classify(name, Direction::Outbound),
                HeaderDecision::Drop(DropReason::HopByHop)
            );
            assert_eq!(
                classify(name, Direction::Inbound { body_decoded: false }),
                HeaderDecision::Drop(DropReason::HopByHop)
            );
            assert_eq!(
                classify(&name.to_ascii_uppercase(), Direction::Outbound),
                HeaderDecision::Drop(DropReason::HopByHop)
            );
        }
    }

    #[test]
    fn host_is_not_sent_upstream() {
        assert_eq!(
            classify("Host", Direction::Outbound),
            HeaderDecision::Drop(DropReason::ProxyManaged)
        );
    }

    #[test]
    fn unknown_headers_forwarded() {
        assert_eq!(classify("x-custom", Direction::Outbound), HeaderDecision::Forward);
        assert_eq!(
            classify("x-custom", Direction::Inbound { body_decoded: true }),
            HeaderDecision::Forward
        );
        assert_eq!(
            classify("x-frame-options", Direction::Outbound),
            HeaderDecision::Forward
        );
    }

    #[test]
    fn content_encoding_only_dropped_after_decoding() {
        assert_eq!(
            classify("content-encoding", Direction::Inbound { body_decoded: false }),
            HeaderDecision::Forward
        );
        assert_eq!(
            classify("content-encoding", Direction::Inbound { body_decoded: true }),
            HeaderDecision::Drop(DropReason::ProxyManaged)
        );
    }

    #[test]
    fn frame_options_dropped_from_responses() {
        assert_eq!(
            classify("X-Frame-Options", Direction::Inbound { body_decoded: false }),
            HeaderDecision::Drop(DropReason::Embedding)
        );
    }

    #[test]
    fn csp_frame_ancestors_removed() {
        assert_eq!(
            strip_frame_ancestors("frame-ancestors 'none'; default-src 'self'").as_deref(),
            Some("default-src 'self'")
        );
        assert_eq!(
            strip_frame_ancestors("default-src 'self'; FRAME-ANCESTORS https://a.example; img-src *")
                .as_deref(),
            Some("default-src 'self'; img-src *")
        );
    }

    #[test]
    fn csp_with_only_frame_ancestors_dropped() {
        assert_eq!(strip_frame_ancestors("frame-ancestors 'none'"), None);
        assert_eq!(strip_frame_ancestors("frame-ancestors 'none';"), None);

        let filtered = filter_inbound(
            &map(&[("content-security-policy", "frame-ancestors 'none'")]),
            false,
        );
        assert!(filtered.get("content-security-policy").is_none());
    }

    #[test]
    fn response_filter_keeps_repeated_headers() {
        let filtered = filter_inbound(
            &map(&[
                ("set-cookie", "a=1"),
                ("set-cookie", "b=2"),
                ("transfer-encoding", "chunked"),
                ("x-frame-options", "DENY"),
                ("content-security-policy", "frame-ancestors 'none'; default-src 'self'"),
            ]),
            false,
        );
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("x-frame-options").is_none());
        assert_eq!(filtered["content-security-policy"], "default-src 'self'");
    }

    #[test]
    fn connection_nominated_headers_dropped() {
        let filtered = filter_outbound(&map(&[
            ("connection", "keep-alive, x-session-hint"),
            ("x-session-hint", "abc"),
            ("accept", "text/html"),
            ("host", "proxy.local"),
        ]));
        assert!(filtered.get("x-session-hint").is_none());
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("host").is_none());
        assert_eq!(filtered["accept"], "text/html");
    }
}
