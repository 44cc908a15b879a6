//! Request director: picks the upstream for a request and prepares the outbound request.
//!
//! A request normally goes to the configured target. When its query carries a
//! `forward_url` parameter, the unescaped value becomes the upstream for that
//! request only. The response phase resolves the same target again from the
//! inbound URI, and reads the host the client used back from
//! [`ORIGIN_HOST_HEADER`].

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::rewrite::{query_unescape, FORWARD_URL_PARAM};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, HOST, ORIGIN, REFERER,
    UPGRADE,
};
use hyper::{Method, Request, Uri};
use log::{info, warn};
use std::net::SocketAddr;
use url::Url;

/// Carries the `Host` the client sent to the proxy from the request phase to the response phase.
pub static ORIGIN_HOST_HEADER: HeaderName = HeaderName::from_static("x-origin-host");
static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Content codings the response pipeline can decode.
const SUPPORTED_CODINGS: &[&str] = &["gzip", "deflate", "br", "identity"];

/// The upstream origin chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveTarget {
    url: Url,
    dynamic: bool,
}

impl EffectiveTarget {
    /// Resolves the target from an inbound request URI. An unusable `forward_url`
    /// falls back to the configured target.
    pub fn resolve(inbound: &Uri, config: &ProxyConfig) -> Self {
        let dynamic = inbound
            .query()
            .and_then(forward_url_value)
            .and_then(|raw| parse_dynamic_target(&raw, config.use_ssl));

        match dynamic {
            Some(url) => Self { url, dynamic: true },
            None => Self {
                url: config.target.clone(),
                dynamic: false,
            },
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// `host[:port]`, as URLs in upstream content refer to it.
    pub fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme(), self.host())
    }

    /// Outbound URI. A dynamic target is used as is; the static target keeps the inbound path and query.
    pub fn upstream_uri(&self, inbound: &Uri) -> Result<Uri, ProxyError> {
        let uri = if self.dynamic {
            self.url.as_str().parse()?
        } else {
            let path_and_query = inbound.path_and_query().map_or("/", |pq| pq.as_str());
            format!("{}{}", self.origin(), path_and_query).parse()?
        };
        Ok(uri)
    }
}

/// Raw (still escaped) `forward_url` value of a query string.
///
/// When the query starts with `forward_url=`, everything after it is the value,
/// so an unescaped `&` in the forwarded URL stays part of it.
pub fn forward_url_value(query: &str) -> Option<String> {
    let prefix = format!("{}=", FORWARD_URL_PARAM);
    let raw = match query.strip_prefix(&prefix) {
        Some(rest) => rest,
        None => query.split('&').find_map(|pair| pair.strip_prefix(&prefix))?,
    };
    if raw.is_empty() {
        return None;
    }

    let value = query_unescape(raw);
    if value.is_none() {
        warn!("ignoring malformed {} value: {}", FORWARD_URL_PARAM, raw);
    }
    value
}

fn parse_dynamic_target(raw: &str, use_ssl: bool) -> Option<Url> {
    let candidate = if raw.starts_with("//") {
        format!("{}:{}", if use_ssl { "https" } else { "http" }, raw)
    } else {
        raw.to_string()
    };

    let mut url = match Url::parse(&candidate) {
        Ok(url) => url,
        Err(e) => {
            warn!("ignoring {} '{}': {}", FORWARD_URL_PARAM, raw, e);
            return None;
        }
    };

    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => {
            warn!("ignoring {} with unsupported scheme '{}'", FORWARD_URL_PARAM, other);
            return None;
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme).ok()?;
    }
    url.host_str()?;
    url.set_fragment(None);
    Some(url)
}

/// Request-phase facts the response phase of the same exchange needs.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub method: Method,
    /// URI as the client sent it, before retargeting.
    pub inbound_uri: Uri,
    /// Host the client connected to, as recorded in [`ORIGIN_HOST_HEADER`].
    pub proxy_host: String,
}

pub struct RequestDirector<'a> {
    config: &'a ProxyConfig,
}

impl<'a> RequestDirector<'a> {
    pub fn new(config: &'a ProxyConfig) -> Self {
        Self { config }
    }

    /// Retargets `req` at its effective upstream and rewrites its headers.
    pub fn direct<B>(
        &self,
        req: &mut Request<B>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Exchange, ProxyError> {
        let inbound_uri = req.uri().clone();
        let inbound_host = req
            .headers()
            .get(HOST)
            .cloned()
            .or_else(|| inbound_uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));

        let target = EffectiveTarget::resolve(&inbound_uri, self.config);
        let upstream_uri = target.upstream_uri(&inbound_uri)?;
        let referer = format!("{}{}", target.origin(), upstream_uri.path());

        let upgrade = upgrade_protocol(req.headers());
        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        if let Some(protocol) = upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, protocol);
        }
        headers.remove(&ORIGIN_HOST_HEADER);
        if let Some(host) = inbound_host {
            headers.insert(ORIGIN_HOST_HEADER.clone(), host);
        }
        headers.insert(HOST, HeaderValue::from_str(&target.host())?);
        headers.insert(ORIGIN, HeaderValue::from_str(&target.origin())?);
        headers.insert(REFERER, HeaderValue::from_str(&referer)?);

        if let Some(addr) = client_addr {
            let ip = addr.ip().to_string();
            let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip.clone(),
            };
            headers.insert(X_REAL_IP.clone(), HeaderValue::from_str(&ip)?);
            headers.insert(X_FORWARDED_FOR.clone(), HeaderValue::from_str(&forwarded_for)?);
        }
        headers.insert(
            X_FORWARDED_PROTO.clone(),
            HeaderValue::from_static(if self.config.use_ssl { "https" } else { "http" }),
        );
        narrow_accept_encoding(headers);

        for (name, value) in &self.config.request_headers {
            headers.append(name.clone(), value.clone());
        }

        let proxy_host = headers
            .get(&ORIGIN_HOST_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost")
            .to_string();

        info!("[{}]: {}", req.method(), upstream_uri);
        *req.uri_mut() = upstream_uri;

        Ok(Exchange {
            method: req.method().clone(),
            inbound_uri,
            proxy_host,
        })
    }
}

/// The requested protocol when the request asks to switch protocols.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if requested { headers.get(UPGRADE).cloned() } else { None }
}

/// Removes connection-scoped headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Keeps only codings the response pipeline can decode; drops the header when none remain.
fn narrow_accept_encoding(headers: &mut HeaderMap) {
    if !headers.contains_key(ACCEPT_ENCODING) {
        return;
    }

    let kept = headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|coding| {
            let name = coding.split(';').next().unwrap_or_default().trim();
            SUPPORTED_CODINGS.iter().any(|s| name.eq_ignore_ascii_case(s))
        })
        .collect::<Vec<_>>()
        .join(", ");

    headers.remove(ACCEPT_ENCODING);
    if let Ok(value) = HeaderValue::from_str(&kept) {
        if !kept.is_empty() {
            headers.insert(ACCEPT_ENCODING, value);
        }
    }
}
