//! Host rewriting for proxied content.
//!
//! Absolute (`http`, `https`, `ws`, `wss`) and protocol-relative URLs found in a
//! body are rewritten so that references to the upstream origin point at the
//! proxy instead. References to other hosts are either left alone or wrapped
//! into a `forward_url` link on the proxy, depending on `proxy_external`.
//!
//! Only text that looks like `scheme://host...` or `//host...` is touched; bare
//! host names are never matched, so scripts and markup without embedded URLs
//! come back byte-for-byte.

use log::trace;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::bytes::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

/// Query parameter carrying the escaped URL of an external resource.
pub const FORWARD_URL_PARAM: &str = "forward_url";

/// Nested query values are unescaped and rewritten at most this many levels deep.
pub const MAX_QUERY_DEPTH: usize = 16;

const SCHEME: &str = r"(?:https?://|wss?://|//)";
const USERINFO: &str = r"(?:[\w.~%!$&'*+,;=-]+(?::[\w.~%!$&'*+,;=-]*)?@)?";
const HOST: &str = r"(?:\[[0-9a-fA-F:.]+\]|[\p{L}\p{N}](?:[\p{L}\p{N}_.-]*[\p{L}\p{N}])?)";
const PORT: &str = r"(?::[0-9]{1,5})?";
const REST: &str = r#"(?:[/?#](?:[^\s"'<>`\\^{}|]*[^\s"'<>`\\^{}|.,;:!?)\]])?)?"#;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("(?i){SCHEME}{USERINFO}{HOST}{PORT}{REST}"))
        .expect("URL pattern is a valid regex")
});

// Left unescaped in query values: alphanumerics plus `-_.~`.
const QUERY_ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Escapes a value for use inside a query string; spaces become `+`.
pub fn query_escape(value: &str) -> String {
    // A literal '%' is emitted as %25, so every %20 here came from a space.
    utf8_percent_encode(value, QUERY_ESCAPE_SET)
        .to_string()
        .replace("%20", "+")
}

/// Reverses [`query_escape`]. Returns `None` on malformed escapes or non-UTF-8 output.
pub fn query_unescape(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'%' {
            let well_formed = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !well_formed {
                return None;
            }
        }
    }

    let spaced = value.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .ok()
        .map(Cow::into_owned)
}

/// Builds `<scheme>://<proxy_host>/?forward_url=<escaped target>`.
pub fn forward_link(scheme: &str, proxy_host: &str, target: &str) -> String {
    format!(
        "{}://{}/?{}={}",
        scheme,
        proxy_host,
        FORWARD_URL_PARAM,
        query_escape(target)
    )
}

/// True for absolute `http://` / `https://` URLs.
pub fn is_http_url(value: &str) -> bool {
    strip_prefix_ignore_ascii_case(value, "http://").is_some()
        || strip_prefix_ignore_ascii_case(value, "https://").is_some()
}

fn strip_prefix_ignore_ascii_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

/// Host name part of an authority (`example.com:8080` -> `example.com`, `[::1]:80` -> `[::1]`).
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn is_valid_hostname(hostname: &str) -> bool {
    let bare = hostname.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>().is_ok() || is_valid_domain(hostname)
}

/// At least two labels; the last one starts with a letter and is two or more characters.
fn is_valid_domain(name: &str) -> bool {
    if name.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    let Some((tld, rest)) = labels.split_last() else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }

    let tld_ok = tld.chars().next().is_some_and(char::is_alphabetic)
        && tld.chars().count() >= 2
        && tld.chars().all(|c| c.is_alphanumeric() || c == '-');

    tld_ok && rest.iter().all(|label| is_valid_label(label))
}

fn is_valid_label(label: &str) -> bool {
    (1..=63).contains(&label.chars().count())
        && label.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        && label.chars().next().is_some_and(char::is_alphanumeric)
        && label.chars().last().is_some_and(char::is_alphanumeric)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
    Relative,
}

impl Scheme {
    fn prefix(self) -> &'static str {
        match self {
            Scheme::Http => "http://",
            Scheme::Https => "https://",
            Scheme::Ws => "ws://",
            Scheme::Wss => "wss://",
            Scheme::Relative => "//",
        }
    }

    fn same_origin(self, use_ssl: bool) -> Scheme {
        match (self, use_ssl) {
            (Scheme::Http | Scheme::Https, true) => Scheme::Https,
            (Scheme::Http | Scheme::Https, false) => Scheme::Http,
            (Scheme::Ws | Scheme::Wss, true) => Scheme::Wss,
            (Scheme::Ws | Scheme::Wss, false) => Scheme::Ws,
            (Scheme::Relative, _) => Scheme::Relative,
        }
    }

    /// Scheme of the proxy link that forwards to a foreign host of this scheme.
    fn forward(self, use_ssl: bool) -> Option<&'static str> {
        match (self, use_ssl) {
            (Scheme::Http | Scheme::Https, true) => Some("https"),
            (Scheme::Http | Scheme::Https, false) => Some("http"),
            (Scheme::Ws | Scheme::Wss, true) => Some("wss"),
            (Scheme::Ws | Scheme::Wss, false) => Some("ws"),
            (Scheme::Relative, _) => None,
        }
    }
}

/// A URL found in content, split without normalising any of its parts.
#[derive(Debug, Clone)]
struct MatchedUrl<'a> {
    scheme: Scheme,
    userinfo: Option<&'a str>,
    host: Cow<'a, str>,
    path: &'a str,
    query: Option<Cow<'a, str>>,
    fragment: Option<&'a str>,
}

impl<'a> MatchedUrl<'a> {
    fn parse(text: &'a str) -> Option<Self> {
        let (scheme, rest) = [
            (Scheme::Https, "https://"),
            (Scheme::Http, "http://"),
            (Scheme::Wss, "wss://"),
            (Scheme::Ws, "ws://"),
            (Scheme::Relative, "//"),
        ]
        .into_iter()
        .find_map(|(scheme, prefix)| {
            strip_prefix_ignore_ascii_case(text, prefix).map(|rest| (scheme, rest))
        })?;

        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        let (userinfo, host) = match authority.rsplit_once('@') {
            Some((userinfo, host)) => (Some(userinfo), host),
            None => (None, authority),
        };
        if host.is_empty() {
            return None;
        }

        let (tail, fragment) = match tail.split_once('#') {
            Some((before, fragment)) => (before, Some(fragment)),
            None => (tail, None),
        };
        let (path, query) = match tail.split_once('?') {
            Some((path, query)) => (path, Some(Cow::Borrowed(query))),
            None => (tail, None),
        };

        Some(Self {
            scheme,
            userinfo,
            host: Cow::Borrowed(host),
            path,
            query,
            fragment,
        })
    }

    fn hostname(&self) -> &str {
        strip_port(&self.host)
    }
}

impl fmt::Display for MatchedUrl<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme.prefix())?;
        if let Some(userinfo) = self.userinfo {
            write!(f, "{}@", userinfo)?;
        }
        write!(f, "{}{}", self.host, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        if let Some(fragment) = self.fragment {
            write!(f, "#{}", fragment)?;
        }
        Ok(())
    }
}

/// Rewrites URLs pointing at `origin_host` so they point at `proxy_host`.
#[derive(Debug, Clone, Copy)]
pub struct HostRewriter<'a> {
    origin_host: &'a str,
    proxy_host: &'a str,
    use_ssl: bool,
    proxy_external: bool,
    ignore_hosts: Option<&'a HashSet<String>>,
}

impl<'a> HostRewriter<'a> {
    pub fn new(origin_host: &'a str, proxy_host: &'a str) -> Self {
        Self {
            origin_host,
            proxy_host,
            use_ssl: false,
            proxy_external: false,
            ignore_hosts: None,
        }
    }

    pub fn use_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    pub fn proxy_external(mut self, proxy_external: bool) -> Self {
        self.proxy_external = proxy_external;
        self
    }

    /// Hosts (lowercase, with or without port) that are never wrapped in a forward link.
    pub fn ignore_hosts(mut self, hosts: &'a HashSet<String>) -> Self {
        self.ignore_hosts = Some(hosts);
        self
    }

    pub fn rewrite(&self, content: &str) -> String {
        match self.rewrite_at_depth(content.as_bytes(), 0) {
            Cow::Borrowed(_) => content.to_string(),
            Cow::Owned(bytes) => String::from_utf8(bytes)
                .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()),
        }
    }

    /// Same as [`rewrite`](Self::rewrite) for bodies that are not guaranteed to be UTF-8.
    pub fn rewrite_bytes<'c>(&self, content: &'c [u8]) -> Cow<'c, [u8]> {
        self.rewrite_at_depth(content, 0)
    }

    fn rewrite_at_depth<'c>(&self, content: &'c [u8], depth: usize) -> Cow<'c, [u8]> {
        if depth > MAX_QUERY_DEPTH {
            trace!("query nesting deeper than {}, leaving value as is", MAX_QUERY_DEPTH);
            return Cow::Borrowed(content);
        }

        URL_PATTERN.replace_all(content, |caps: &Captures| {
            let matched = &caps[0];
            let before = caps.get(0).map_or(&[][..], |m| &content[..m.start()]);

            std::str::from_utf8(matched)
                .ok()
                .and_then(|text| self.rewrite_url(text, before, depth))
                .map(String::into_bytes)
                .unwrap_or_else(|| matched.to_vec())
        })
    }

    /// Returns the replacement for one matched URL, or `None` to keep it verbatim.
    fn rewrite_url(&self, text: &str, before: &[u8], depth: usize) -> Option<String> {
        let mut url = MatchedUrl::parse(text)?;
        if is_glued(url.scheme, before) {
            return None;
        }

        let same_origin = url.host.eq_ignore_ascii_case(self.origin_host);
        if !same_origin && !is_valid_hostname(url.hostname()) {
            return None;
        }

        if let Some(query) = url.query.take() {
            let rewritten = match self.rewrite_query(&query, depth) {
                Cow::Owned(rewritten) => Some(rewritten),
                Cow::Borrowed(_) => None,
            };
            url.query = Some(rewritten.map_or(query, Cow::Owned));
        }

        if same_origin {
            url.scheme = url.scheme.same_origin(self.use_ssl);
            url.host = Cow::Borrowed(self.proxy_host);
            return Some(url.to_string());
        }

        if !self.proxy_external || self.is_ignored(&url) {
            return None;
        }

        let scheme = url.scheme.forward(self.use_ssl)?;
        trace!("forwarding external url {} through {}", url, self.proxy_host);
        Some(forward_link(scheme, self.proxy_host, &url.to_string()))
    }

    fn is_ignored(&self, url: &MatchedUrl<'_>) -> bool {
        self.ignore_hosts.is_some_and(|hosts| {
            hosts.contains(&url.host.to_ascii_lowercase())
                || hosts.contains(&url.hostname().to_ascii_lowercase())
        })
    }

    fn rewrite_query<'q>(&self, query: &'q str, depth: usize) -> Cow<'q, str> {
        let mut changed = false;
        let pairs: Vec<Cow<'q, str>> = query
            .split('&')
            .map(|pair| match pair.split_once('=') {
                // An existing forward link already carries a rewritten target.
                Some((key, value)) if !value.is_empty() && key != FORWARD_URL_PARAM => {
                    match self.rewrite_query_value(value, depth) {
                        Some(value) => {
                            changed = true;
                            Cow::Owned(format!("{}={}", key, value))
                        }
                        None => Cow::Borrowed(pair),
                    }
                }
                _ => Cow::Borrowed(pair),
            })
            .collect();

        if changed {
            Cow::Owned(pairs.join("&"))
        } else {
            Cow::Borrowed(query)
        }
    }

    fn rewrite_query_value(&self, value: &str, depth: usize) -> Option<String> {
        match query_unescape(value) {
            Some(unescaped) => {
                let rewritten = self.rewrite_at_depth(unescaped.as_bytes(), depth + 1);
                if rewritten.as_ref() == unescaped.as_bytes() {
                    return None;
                }
                Some(query_escape(&String::from_utf8_lossy(&rewritten)))
            }
            None => {
                let rewritten = self.rewrite_at_depth(value.as_bytes(), depth + 1);
                if rewritten.as_ref() == value.as_bytes() {
                    return None;
                }
                Some(String::from_utf8_lossy(&rewritten).into_owned())
            }
        }
    }
}

/// Whether a match is the tail of a longer token: `//host` inside `file:///` or
/// `foo://host`, `a//host`, or a scheme such as `xhttps://`.
fn is_glued(scheme: Scheme, before: &[u8]) -> bool {
    let Some(&last) = before.last() else {
        return false;
    };
    // `\x22https://...` in script strings: the escape ends the previous token.
    if ends_with_escape(before) {
        return false;
    }
    match scheme {
        Scheme::Relative => matches!(last, b':' | b'/' | b'\\') || last.is_ascii_alphanumeric(),
        _ => last.is_ascii_alphanumeric() || matches!(last, b'+' | b'-' | b'.'),
    }
}

fn ends_with_escape(before: &[u8]) -> bool {
    [(b'x', 2), (b'u', 4)].into_iter().any(|(marker, digits)| {
        before.len() >= digits + 2 && {
            let tail = &before[before.len() - digits - 2..];
            tail[0] == b'\\' && tail[1] == marker && tail[2..].iter().all(u8::is_ascii_hexdigit)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter<'a>(origin: &'a str, proxy: &'a str) -> HostRewriter<'a> {
        HostRewriter::new(origin, proxy)
    }

    #[test]
    fn test_query_escape_matches_form_encoding() {
        assert_eq!(query_escape("https://example.com.hk"), "https%3A%2F%2Fexample.com.hk");
        assert_eq!(query_escape("a b+c~d*e"), "a+b%2Bc~d%2Ae");
        assert_eq!(query_escape("百度"), "%E7%99%BE%E5%BA%A6");
    }

    #[test]
    fn test_query_unescape() {
        assert_eq!(query_unescape("a+b%2Bc").as_deref(), Some("a b+c"));
        assert_eq!(query_unescape("http%3A%2F%2Fexample.com%2F").as_deref(), Some("http://example.com/"));
        assert_eq!(query_unescape("100%"), None);
        assert_eq!(query_unescape("%zz"), None);
        assert_eq!(query_unescape("%ff"), None);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("localhost:8080"), "localhost");
        assert_eq!(strip_port("localhost"), "localhost");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("example.com:"), "example.com:");
    }

    #[test]
    fn test_hostname_validation() {
        assert!(is_valid_hostname("example.com"));
        assert!(is_valid_hostname("static.cdn.example.co.uk"));
        assert!(is_valid_hostname("192.168.0.7"));
        assert!(is_valid_hostname("[::1]"));
        assert!(is_valid_hostname("例子.中国"));
        assert!(!is_valid_hostname("g"));
        assert!(!is_valid_hostname("999.1.1.1"));
        assert!(!is_valid_hostname("foo_"));
    }

    #[test]
    fn test_is_http_url() {
        assert!(is_http_url("https://example.com/a"));
        assert!(is_http_url("HTTP://example.com"));
        assert!(!is_http_url("/relative/path"));
        assert!(!is_http_url("//example.com"));
        assert!(!is_http_url("wss://example.com"));
    }

    #[test]
    fn test_use_ssl_upgrades_scheme() {
        let out = rewriter("example.com", "proxy.local").use_ssl(true).rewrite("see http://example.com/a");
        assert_eq!(out, "see https://proxy.local/a");
    }

    #[test]
    fn test_websocket_scheme_follows_ssl() {
        let plain = rewriter("example.com", "localhost:8080").rewrite("wss://example.com/socket");
        assert_eq!(plain, "ws://localhost:8080/socket");

        let secure = rewriter("example.com", "proxy.local").use_ssl(true).rewrite("ws://example.com/socket");
        assert_eq!(secure, "wss://proxy.local/socket");
    }

    #[test]
    fn test_websocket_external_forward() {
        let out = rewriter("example.com", "localhost:8080")
            .proxy_external(true)
            .rewrite("wss://push.other.net/live");
        assert_eq!(out, "ws://localhost:8080/?forward_url=wss%3A%2F%2Fpush.other.net%2Flive");
    }

    #[test]
    fn test_each_occurrence_rewritten_independently() {
        let input = r#"<a href="https://example.com/a">x</a><img src="//example.com/b.png"><a href="https://example.com/a">y</a>"#;
        let out = rewriter("example.com", "localhost:8080").rewrite(input);
        assert_eq!(
            out,
            r#"<a href="http://localhost:8080/a">x</a><img src="//localhost:8080/b.png"><a href="http://localhost:8080/a">y</a>"#
        );
    }

    #[test]
    fn test_trailing_punctuation_not_part_of_url() {
        let out = rewriter("example.com", "localhost:8080").rewrite("Visit https://example.com/docs.");
        assert_eq!(out, "Visit http://localhost:8080/docs.");
    }

    #[test]
    fn test_fragment_and_userinfo_preserved() {
        let out = rewriter("example.com", "localhost:8080").rewrite("https://user@example.com/p?q=1#top");
        assert_eq!(out, "http://user@localhost:8080/p?q=1#top");
    }

    #[test]
    fn test_host_comparison_ignores_case() {
        let out = rewriter("example.com", "localhost:8080").rewrite("HTTPS://Example.COM/a");
        assert_eq!(out, "http://localhost:8080/a");
    }

    #[test]
    fn test_port_must_match_exactly() {
        let out = rewriter("example.com:8080", "localhost").rewrite("https://example.com/demo");
        assert_eq!(out, "https://example.com/demo");
    }

    #[test]
    fn test_ignored_hosts_pass_through() {
        let ignores: HashSet<String> = ["cdn.other.net".to_string()].into_iter().collect();
        let out = rewriter("example.com", "localhost:8080")
            .proxy_external(true)
            .ignore_hosts(&ignores)
            .rewrite("https://cdn.other.net/lib.js https://api.other.net/v1");
        assert_eq!(
            out,
            "https://cdn.other.net/lib.js http://localhost:8080/?forward_url=https%3A%2F%2Fapi.other.net%2Fv1"
        );
    }

    #[test]
    fn test_relative_external_url_untouched() {
        let out = rewriter("example.com", "localhost:8080")
            .proxy_external(true)
            .rewrite("//cdn.other.net/lib.js");
        assert_eq!(out, "//cdn.other.net/lib.js");
    }

    #[test]
    fn test_other_schemes_untouched() {
        let rw = rewriter("example.com", "localhost:8080").proxy_external(true);
        assert_eq!(rw.rewrite("ftp://example.com/file"), "ftp://example.com/file");
        assert_eq!(rw.rewrite("myapp://example.com/open"), "myapp://example.com/open");
    }

    #[test]
    fn test_scheme_glued_to_word_untouched() {
        let rw = rewriter("example.com", "localhost:8080").proxy_external(true);
        for text in [
            "xhttps://example.com/a",
            "git+https://example.com/repo.git",
            "a//example.com/b",
            "web-wss://example.com/feed",
            "v1.http://example.com/",
        ] {
            assert_eq!(rw.rewrite(text), text);
        }

        assert_eq!(rw.rewrite(" https://example.com/a"), " http://localhost:8080/a");
        assert_eq!(rw.rewrite("(//example.com/b"), "(//localhost:8080/b");
    }

    #[test]
    fn test_url_after_script_escape_rewritten() {
        let rw = rewriter("example.com", "localhost:8080");
        assert_eq!(
            rw.rewrite(r"\x22https://example.com/a\x22"),
            r"\x22http://localhost:8080/a\x22"
        );
        assert_eq!(
            rw.rewrite(r"\u0022//example.com/b\u0022"),
            r"\u0022//localhost:8080/b\u0022"
        );
    }

    #[test]
    fn test_nested_query_url_rewritten() {
        let out = rewriter("example.com", "localhost:8080")
            .rewrite("https://example.com/login?next=https%3A%2F%2Fexample.com%2Fhome&x=1");
        assert_eq!(
            out,
            "http://localhost:8080/login?next=http%3A%2F%2Flocalhost%3A8080%2Fhome&x=1"
        );
    }

    #[test]
    fn test_unchanged_query_keeps_original_escaping() {
        let input = "https://example.com/s?q=a%2fb&r=%7E&flag&empty=";
        let out = rewriter("example.com", "localhost:8080").rewrite(input);
        assert_eq!(out, "http://localhost:8080/s?q=a%2fb&r=%7E&flag&empty=");
    }

    #[test]
    fn test_rewriting_is_idempotent_on_proxy_host() {
        let input = r#"<a href="https://example.com/a?u=https%3A%2F%2Fother.net%2Fx">a</a> <script src="https://other.net/s.js"></script>"#;
        let first = rewriter("example.com", "localhost:8080").proxy_external(true).rewrite(input);
        let second = rewriter("localhost:8080", "localhost:8080").proxy_external(true).rewrite(&first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_deep_nesting_is_bounded() {
        let mut url = "https://example.com/".to_string();
        for _ in 0..(MAX_QUERY_DEPTH + 8) {
            url = format!("https://example.com/?u={}", query_escape(&url));
        }
        let out = rewriter("example.com", "localhost:8080").rewrite(&url);
        assert!(out.starts_with("http://localhost:8080/?u=http%3A%2F%2Flocalhost%3A8080"));
    }

    #[test]
    fn test_non_utf8_bytes_survive() {
        let input: &[u8] = b"\xff\xfe href=\"https://example.com/x\" \xc0";
        let out = rewriter("example.com", "localhost:8080").rewrite_bytes(input);
        assert_eq!(out.as_ref(), b"\xff\xfe href=\"http://localhost:8080/x\" \xc0".as_slice());
    }
}
