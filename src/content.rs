//! Decides which upstream bodies get rewritten, based on their `Content-Type`.

use regex::bytes::{NoExpand, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;

/// File extensions whose bodies are scanned for URLs.
pub const REWRITABLE_EXTENSIONS: &[&str] = &[
    "html", "htm", "xhtml", "xml", "yml", "yaml", "css", "js", "txt", "text", "json",
];

/// Subset of [`REWRITABLE_EXTENSIONS`] that is treated as markup.
pub const HTML_EXTENSIONS: &[&str] = &["html", "htm", "xhtml"];

static INTEGRITY_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\sintegrity="[^"]+""#).expect("integrity pattern is a valid regex")
});

/// Extensions associated with a response's media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentKind {
    extensions: Vec<&'static str>,
}

impl ContentKind {
    /// Classifies a `Content-Type` header value; `None` when no extension is known for it.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence.is_empty() {
            return None;
        }

        let extensions = extensions_for(&essence);
        if extensions.is_empty() {
            None
        } else {
            Some(Self { extensions })
        }
    }

    pub fn extensions(&self) -> &[&'static str] {
        &self.extensions
    }

    pub fn is_rewritable(&self) -> bool {
        self.extensions.iter().any(|ext| REWRITABLE_EXTENSIONS.contains(ext))
    }

    pub fn is_html(&self) -> bool {
        self.extensions.iter().any(|ext| HTML_EXTENSIONS.contains(ext))
    }
}

fn extensions_for(essence: &str) -> Vec<&'static str> {
    let mut extensions: Vec<&'static str> = mime_guess::get_mime_extensions_str(essence)
        .map(<[&str]>::to_vec)
        .unwrap_or_default();

    // Types the mime table leaves out or only knows under another alias.
    let known: &[&'static str] = match essence {
        "text/html" => &["html", "htm"],
        "application/xhtml+xml" => &["xhtml"],
        "text/javascript" | "application/javascript" | "application/x-javascript"
        | "application/ecmascript" | "text/ecmascript" => &["js"],
        "application/json" | "text/json" => &["json"],
        "text/plain" => &["txt", "text"],
        "text/css" => &["css"],
        "text/xml" | "application/xml" => &["xml"],
        "application/yaml" | "application/x-yaml" | "text/yaml" | "text/x-yaml" => &["yaml", "yml"],
        other if other.starts_with("application/") && other.ends_with("+json") => &["json"],
        other if other.starts_with("application/") && other.ends_with("+xml") => &["xml"],
        _ => &[],
    };

    for ext in known {
        if !extensions.contains(ext) {
            extensions.push(ext);
        }
    }
    extensions
}

/// Removes `integrity="..."` attributes; rewritten subresources no longer match their hashes.
pub fn strip_integrity(body: &[u8]) -> Cow<'_, [u8]> {
    INTEGRITY_ATTRIBUTE.replace_all(body, NoExpand(b""))
}
