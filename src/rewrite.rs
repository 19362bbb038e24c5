//! HTML rewriting that keeps a proxied page working inside a frame.
//!
//! The rewriter works on markup tags found by pattern matching rather than on
//! a parsed DOM. Anything it cannot make sense of is left as it was.

use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_8};
use log::debug;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::{Url, form_urlencoded};

use crate::error::ProxyError;

/// Injected after `<head>`. Makes the usual frame-busting checks see the
/// current window as the top one. Sites that detect framing any other way
/// are not covered.
pub const FRAME_SHIM: &str = concat!(
    "<script>(function(){",
    "var w=window;",
    "function pin(n,v){try{Object.defineProperty(w,n,{get:function(){return v;},configurable:true});}catch(e){}}",
    "pin('top',w);pin('parent',w);pin('frameElement',null);",
    "})();</script>"
);

// An opening tag, allowing `>` inside quoted attribute values.
static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<[a-zA-Z](?:[^>"']|"[^"]*"|'[^']*')*>"#).expect("valid tag regex")
});

static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)(<script\b(?:[^>"']|"[^"]*"|'[^']*')*>).*?</script\s*>"#)
        .expect("valid script regex")
});

static LINK_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\s(?:href|src|action)\s*=\s*)(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid link attribute regex")
});

static HTTP_EQUIV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\shttp-equiv\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid http-equiv regex")
});

static HEAD_OPEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<head(?:\s(?:[^>"']|"[^"]*"|'[^']*')*)?>"#).expect("valid head regex")
});

static ENTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(?:#[xX]([0-9a-fA-F]{1,6});|#([0-9]{1,7});|([a-zA-Z]+);)")
        .expect("valid entity regex")
});

/// Everything needed to turn a link found in one response into a proxied link.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub target: Url,
    pub mount_path: String,
    pub session: String,
}

impl RewriteContext {
    pub fn new(target: Url, mount_path: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            target,
            mount_path: mount_path.into(),
            session: session.into(),
        }
    }

    /// `<mount>?session=<key>&url=<encoded absolute url>`
    pub fn proxied_url(&self, absolute: &Url) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("session", &self.session)
            .append_pair("url", absolute.as_str())
            .finish();
        format!("{}?{}", self.mount_path, query)
    }

    /// Resolve `raw` against the target and route it through the proxy.
    ///
    /// `Ok(None)` means the value should stay as it is: fragments and
    /// non-http schemes.
    pub fn proxy_link(&self, raw: &str) -> Result<Option<String>, ProxyError> {
        let value = unescape_attr(raw.trim());
        if value.is_empty() || value.starts_with('#') {
            return Ok(None);
        }

        let resolved = self
            .target
            .join(&value)
            .map_err(|e| ProxyError::RewriteFailure(format!("{value:?}: {e}")))?;
        if !matches!(resolved.scheme(), "http" | "https") {
            return Ok(None);
        }
        Ok(Some(self.proxied_url(&resolved)))
    }
}

/// Decode the character references that can show up in a URL attribute:
/// `&amp;`-style names and `&#38;`/`&#x26;` numbers. Anything else is kept.
fn unescape_attr(value: &str) -> Cow<'_, str> {
    if !value.contains('&') {
        return Cow::Borrowed(value);
    }
    ENTITY_RE.replace_all(value, |caps: &Captures| {
        let decoded = match (caps.get(1), caps.get(2), caps.get(3)) {
            (Some(hex), _, _) => u32::from_str_radix(hex.as_str(), 16)
                .ok()
                .and_then(char::from_u32),
            (_, Some(dec), _) => dec.as_str().parse().ok().and_then(char::from_u32),
            (_, _, Some(name)) => match name.as_str().to_ascii_lowercase().as_str() {
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "lt" => Some('<'),
                "gt" => Some('>'),
                _ => None,
            },
            _ => None,
        };
        decoded.map_or_else(|| caps[0].to_string(), String::from)
    })
}

/// Rewrites whole HTML documents. Stateless apart from its switches.
#[derive(Debug, Clone)]
pub struct ContentRewriter {
    inject_frame_shim: bool,
}

impl ContentRewriter {
    pub fn new(inject_frame_shim: bool) -> Self {
        Self { inject_frame_shim }
    }

    pub fn rewrite(&self, html: &str, ctx: &RewriteContext) -> String {
        let html = strip_blocking_meta(html);
        let html = rewrite_links(&html, ctx);
        if self.inject_frame_shim {
            inject_frame_shim(&html)
        } else {
            html
        }
    }
}

/// Apply `f` to every opening tag outside of `<script>` bodies.
/// The opening `<script ...>` tag itself is still passed to `f`.
fn map_tags<F>(html: &str, f: F) -> String
where
    F: Fn(&str) -> Cow<'_, str>,
{
    let map_segment = |segment: &str| -> String {
        TAG_RE
            .replace_all(segment, |caps: &Captures| f(&caps[0]).into_owned())
            .into_owned()
    };

    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for caps in SCRIPT_RE.captures_iter(html) {
        let (Some(block), Some(open)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&map_segment(&html[last..block.start()]));
        out.push_str(&f(open.as_str()));
        out.push_str(&html[open.end()..block.end()]);
        last = block.end();
    }
    out.push_str(&map_segment(&html[last..]));
    out
}

fn attr_value<'a>(caps: &'a Captures<'_>) -> &'a str {
    caps.get(2)
        .or_else(|| caps.get(3))
        .or_else(|| caps.get(4))
        .map_or("", |m| m.as_str())
}

/// Drop `<meta http-equiv>` copies of X-Frame-Options and Content-Security-Policy.
pub fn strip_blocking_meta(html: &str) -> String {
    map_tags(html, |tag| {
        if !tag.get(..5).is_some_and(|t| t.eq_ignore_ascii_case("<meta")) {
            return Cow::Borrowed(tag);
        }
        let blocking = HTTP_EQUIV_RE.captures(tag).is_some_and(|caps| {
            let equiv = attr_value(&caps).trim();
            equiv.eq_ignore_ascii_case("x-frame-options")
                || equiv.eq_ignore_ascii_case("content-security-policy")
        });
        if blocking {
            Cow::Borrowed("")
        } else {
            Cow::Borrowed(tag)
        }
    })
}

/// Point `href`, `src` and `action` attributes back at the proxy.
pub fn rewrite_links(html: &str, ctx: &RewriteContext) -> String {
    map_tags(html, |tag| {
        LINK_ATTR_RE.replace_all(tag, |caps: &Captures| {
            let original = &caps[0];
            match ctx.proxy_link(attr_value(caps)) {
                Ok(Some(proxied)) => {
                    let quote = if caps.get(3).is_some() { '\'' } else { '"' };
                    format!("{}{quote}{proxied}{quote}", &caps[1])
                }
                Ok(None) => original.to_string(),
                Err(e) => {
                    debug!("[{}] leaving link as is: {e}", ctx.session);
                    original.to_string()
                }
            }
        })
    })
}

/// Insert [`FRAME_SHIM`] right after the opening `<head>` tag, or at the very
/// start of the document when there is none.
pub fn inject_frame_shim(html: &str) -> String {
    match HEAD_OPEN_RE.find(html) {
        Some(head) => {
            let mut out = String::with_capacity(html.len() + FRAME_SHIM.len());
            out.push_str(&html[..head.end()]);
            out.push_str(FRAME_SHIM);
            out.push_str(&html[head.end()..]);
            out
        }
        None => format!("{FRAME_SHIM}{html}"),
    }
}

/// Decode an HTML body to text using the charset of its content type.
/// Unlabelled bodies are read as UTF-8.
///
/// Fails with [`ProxyError::UpstreamMalformed`] for bytes that are invalid in
/// the declared charset and for labels no encoding answers to.
pub fn decode_html(body: &[u8], content_type: &str) -> Result<String, ProxyError> {
    let encoding = match charset_of(content_type) {
        None => UTF_8,
        Some(label) => Encoding::for_label(label.as_bytes()).ok_or_else(|| {
            ProxyError::UpstreamMalformed(format!("unknown charset {label}"))
        })?,
    };

    let body = if encoding == UTF_8 {
        body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body)
    } else {
        body
    };

    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(Cow::into_owned)
        .ok_or_else(|| {
            ProxyError::UpstreamMalformed(format!("body is not valid {}", encoding.name()))
        })
}

fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    })
}
