//! Local override folder: files placed here are served instead of the upstream's.

use crate::common::{self, ProxyBody};
use crate::error::ProxyError;
use hyper::{Method, Response, StatusCode, Uri};
use log::debug;
use percent_encoding::percent_decode_str;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct OverrideResponder {
    root: PathBuf,
}

impl OverrideResponder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a request path into the folder. `None` when a segment is not valid
    /// UTF-8 or would leave the folder.
    pub fn resolve_path(&self, request_path: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for segment in request_path.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            let decoded = percent_decode_str(segment).decode_utf8().ok()?;
            if decoded == ".." || decoded.contains(['/', '\\', '\0']) {
                return None;
            }
            path.push(&*decoded);
        }
        Some(path)
    }

    /// Serves the matching file for a `GET`. `Ok(None)` means the request should be proxied.
    pub async fn respond(
        &self,
        method: &Method,
        uri: &Uri,
    ) -> Result<Option<Response<ProxyBody>>, ProxyError> {
        if method != Method::GET {
            return Ok(None);
        }
        let Some(file_path) = self.resolve_path(uri.path()) else {
            return Ok(None);
        };

        let metadata = match tokio::fs::metadata(&file_path).await {
            Ok(metadata) => metadata,
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            return Ok(None);
        }

        let contents = match tokio::fs::read(&file_path).await {
            Ok(contents) => contents,
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        debug!("serving {} from override folder", file_path.display());

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", Self::guess_mime_type(&file_path))
            .header("Content-Length", contents.len().to_string());
        if let Ok(modified) = metadata.modified() {
            response = response.header("Last-Modified", httpdate::fmt_http_date(modified));
        }

        response
            .body(common::full(contents))
            .map(Some)
            .map_err(|e| ProxyError::Http(e.to_string()))
    }

    fn guess_mime_type(file_path: &Path) -> String {
        let mime = mime_guess::from_path(file_path).first_or_octet_stream();

        // Add charset for text-based MIME types
        let mime_str = mime.as_ref();
        if mime_str.starts_with("text/")
            || mime_str == "application/json"
            || mime_str == "application/javascript"
            || mime_str == "application/xml"
        {
            format!("{}; charset=utf-8", mime_str)
        } else {
            mime_str.to_string()
        }
    }
}

fn is_absent(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}
