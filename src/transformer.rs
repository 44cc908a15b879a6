//! Response transformer: adapts an upstream response so it can be served from the proxy's host.

use crate::codec::{self, Encoding};
use crate::common::{self, BoxError, ProxyBody};
use crate::config::ProxyConfig;
use crate::content::{strip_integrity, ContentKind};
use crate::director::{strip_hop_by_hop, EffectiveTarget, Exchange};
use crate::error::ProxyError;
use crate::rewrite::{forward_link, is_http_url, strip_port, HostRewriter};
use bytes::Bytes;
use cookie::{Cookie, SameSite};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
    CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_SECURITY_POLICY, CONTENT_TYPE,
    LOCATION, SET_COOKIE,
};
use http::response::Parts;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Method, Response, StatusCode};
use log::{debug, warn};
use std::borrow::Cow;

pub static X_PROXY_CLIENT: HeaderName = HeaderName::from_static("x-proxy-client");
static EXPECT_CT: HeaderName = HeaderName::from_static("expect-ct");

const PROXY_CLIENT_NAME: &str = "rewrite-bridge";

/// What to do with the upstream body once the headers are transformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyAction {
    Passthrough,
    Rewrite {
        encoding: Encoding,
        /// Host the upstream content refers to itself by.
        origin_host: String,
        html: bool,
    },
}

pub struct ResponseTransformer<'a> {
    config: &'a ProxyConfig,
}

impl<'a> ResponseTransformer<'a> {
    pub fn new(config: &'a ProxyConfig) -> Self {
        Self { config }
    }

    /// Transforms headers and status in place and decides how the body is handled.
    pub fn transform_head(&self, parts: &mut Parts, exchange: &Exchange) -> BodyAction {
        let target = EffectiveTarget::resolve(&exchange.inbound_uri, self.config);
        let origin_host = target.host();
        let proxy_host = exchange.proxy_host.as_str();
        let headers = &mut parts.headers;

        strip_hop_by_hop(headers);
        headers.insert(X_PROXY_CLIENT.clone(), HeaderValue::from_static(PROXY_CLIENT_NAME));
        headers.remove(&EXPECT_CT);
        headers.remove(CONTENT_SECURITY_POLICY);

        if self.config.disable_cache {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }

        // A permanent redirect to a proxy-specific location must not be cached.
        if parts.status == StatusCode::MOVED_PERMANENTLY {
            parts.status = StatusCode::FOUND;
        }

        self.rewrite_cookies(headers, strip_port(proxy_host));

        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(location) = location {
            if let Some(rewritten) = self.rewrite_location(&location, &target, proxy_host) {
                debug!("location {} -> {}", location, rewritten);
                match HeaderValue::from_str(&rewritten) {
                    Ok(value) => {
                        headers.insert(LOCATION, value);
                    }
                    Err(e) => warn!("keeping location {}: {}", location, e),
                }
            }
        }

        if self.config.cors.enabled {
            self.apply_cors(headers);
        }

        for (name, value) in &self.config.response_headers {
            headers.append(name.clone(), value.clone());
        }

        self.body_action(parts, exchange, origin_host)
    }

    fn body_action(&self, parts: &Parts, exchange: &Exchange, origin_host: String) -> BodyAction {
        if exchange.method == Method::HEAD
            || parts.status == StatusCode::NO_CONTENT
            || parts.status == StatusCode::NOT_MODIFIED
        {
            return BodyAction::Passthrough;
        }

        let Some(kind) = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(ContentKind::from_content_type)
        else {
            return BodyAction::Passthrough;
        };
        if !kind.is_rewritable() {
            return BodyAction::Passthrough;
        }

        let declared = parts.headers.get(CONTENT_ENCODING).map(|v| v.to_str().unwrap_or("?"));
        match Encoding::parse(declared) {
            Some(encoding) => BodyAction::Rewrite {
                encoding,
                origin_host,
                html: kind.is_html(),
            },
            None => {
                warn!(
                    "unsupported content-encoding {:?} from {}, body left as is",
                    declared.unwrap_or_default(),
                    origin_host
                );
                BodyAction::Passthrough
            }
        }
    }

    /// Runs the codec pipeline for a body the head phase marked for rewriting.
    pub fn transform_body(
        &self,
        action: &BodyAction,
        exchange: &Exchange,
        headers: &mut HeaderMap,
        raw: Bytes,
    ) -> Result<Bytes, ProxyError> {
        let BodyAction::Rewrite {
            encoding,
            origin_host,
            html,
        } = action
        else {
            return Ok(raw);
        };
        if raw.is_empty() {
            return Ok(raw);
        }

        let rewriter = self.rewriter(origin_host, &exchange.proxy_host);
        let out = codec::transform(raw, *encoding, self.config.preserve_compression, |body| {
            rewrite_content(&rewriter, body, *html)
        })?;

        if out.encoding != *encoding {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(out.encoding.as_str()));
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(out.body.len()));
        Ok(out.body)
    }

    /// Applies both phases. A rewritten body is buffered; any other body is
    /// streamed to the client as it arrives.
    pub async fn transform<B>(
        &self,
        response: Response<B>,
        exchange: &Exchange,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = response.into_parts();
        let action = self.transform_head(&mut parts, exchange);
        if action == BodyAction::Passthrough {
            return Ok(Response::from_parts(parts, common::boxed(body)));
        }

        let raw = body
            .collect()
            .await
            .map_err(|e| {
                let e: BoxError = e.into();
                ProxyError::Http(format!("failed to read upstream body: {}", e))
            })?
            .to_bytes();
        let body = self.transform_body(&action, exchange, &mut parts.headers, raw)?;

        Ok(Response::from_parts(parts, common::full(body)))
    }

    fn rewriter<'r>(&'r self, origin_host: &'r str, proxy_host: &'r str) -> HostRewriter<'r> {
        HostRewriter::new(origin_host, proxy_host)
            .use_ssl(self.config.use_ssl)
            .proxy_external(self.config.proxy_external)
            .ignore_hosts(&self.config.proxy_external_ignores)
    }

    fn rewrite_cookies(&self, headers: &mut HeaderMap, domain: &str) {
        let values: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
        if values.is_empty() {
            return;
        }

        headers.remove(SET_COOKIE);
        for value in values {
            let rewritten = value
                .to_str()
                .ok()
                .and_then(|raw| Cookie::parse(raw.to_string()).ok())
                .and_then(|mut cookie| {
                    self.rewrite_cookie(&mut cookie, domain);
                    HeaderValue::from_str(&cookie.to_string()).ok()
                });
            headers.append(SET_COOKIE, rewritten.unwrap_or(value));
        }
    }

    fn rewrite_cookie(&self, cookie: &mut Cookie<'_>, domain: &str) {
        cookie.set_domain(domain.to_string());
        if !self.config.use_ssl {
            cookie.set_secure(false);
            // Browsers drop `SameSite=None` cookies that are not `Secure`.
            if cookie.same_site() == Some(SameSite::None) {
                cookie.set_same_site(SameSite::Lax);
            }
        }
    }

    fn rewrite_location(
        &self,
        location: &str,
        target: &EffectiveTarget,
        proxy_host: &str,
    ) -> Option<String> {
        if is_http_url(location) || location.starts_with("//") {
            let origin_host = target.host();
            return Some(self.rewriter(&origin_host, proxy_host).rewrite(location));
        }

        // Relative locations already resolve against the proxy for the static target.
        if !target.is_dynamic() {
            return None;
        }
        let absolute = target.url().join(location).ok()?;
        let scheme = if self.config.use_ssl { "https" } else { "http" };
        Some(forward_link(scheme, proxy_host, absolute.as_str()))
    }

    fn apply_cors(&self, headers: &mut HeaderMap) {
        let cors = &self.config.cors;
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));

        for (name, list) in [
            (ACCESS_CONTROL_ALLOW_HEADERS, &cors.allow_headers),
            (ACCESS_CONTROL_EXPOSE_HEADERS, &cors.expose_headers),
        ] {
            if list.is_empty() {
                continue;
            }
            match HeaderValue::from_str(&list.join(", ")) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(e) => warn!("skipping {}: {}", name, e),
            }
        }
    }
}

fn rewrite_content<'c>(rewriter: &HostRewriter<'_>, body: &'c [u8], html: bool) -> Cow<'c, [u8]> {
    let rewritten = rewriter.rewrite_bytes(body);
    if !html {
        return rewritten;
    }

    let stripped = match strip_integrity(&rewritten) {
        Cow::Owned(stripped) => Some(stripped),
        Cow::Borrowed(_) => None,
    };
    match stripped {
        Some(stripped) => Cow::Owned(stripped),
        None => rewritten,
    }
}
