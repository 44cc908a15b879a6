//! Content codec pipeline: decode an upstream body, rewrite it, and encode it again.

use crate::error::ProxyError;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 6;
const BROTLI_WINDOW: u32 = 22;

/// `Content-Encoding` values the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    /// LZW; recognised but never decoded, bodies pass through as-is.
    Compress,
}

impl Encoding {
    /// Parses a `Content-Encoding` header. An absent header means identity;
    /// `None` is returned for anything else the pipeline cannot handle.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        let Some(value) = value else {
            return Some(Encoding::Identity);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Some(Encoding::Identity),
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            "br" => Some(Encoding::Brotli),
            "compress" | "x-compress" => Some(Encoding::Compress),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Brotli => "br",
            Encoding::Compress => "compress",
        }
    }

    pub fn decode(&self, body: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let mut out = Vec::with_capacity(body.len().saturating_mul(4));
        match self {
            Encoding::Identity | Encoding::Compress => out.extend_from_slice(body),
            Encoding::Gzip => {
                MultiGzDecoder::new(body)
                    .read_to_end(&mut out)
                    .map_err(|e| ProxyError::codec(self.as_str(), e))?;
            }
            Encoding::Deflate => {
                // Some servers send raw deflate streams without the zlib wrapper.
                if ZlibDecoder::new(body).read_to_end(&mut out).is_err() {
                    out.clear();
                    DeflateDecoder::new(body)
                        .read_to_end(&mut out)
                        .map_err(|e| ProxyError::codec(self.as_str(), e))?;
                }
            }
            Encoding::Brotli => {
                brotli::Decompressor::new(body, BROTLI_BUFFER_SIZE)
                    .read_to_end(&mut out)
                    .map_err(|e| ProxyError::codec(self.as_str(), e))?;
            }
        }
        Ok(out)
    }

    pub fn encode(&self, body: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let err = |e: std::io::Error| ProxyError::codec(self.as_str(), e);
        match self {
            Encoding::Identity | Encoding::Compress => Ok(body.to_vec()),
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body).map_err(err)?;
                encoder.finish().map_err(err)
            }
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body).map_err(err)?;
                encoder.finish().map_err(err)
            }
            Encoding::Brotli => {
                let mut writer = brotli::CompressorWriter::new(
                    Vec::new(),
                    BROTLI_BUFFER_SIZE,
                    BROTLI_QUALITY,
                    BROTLI_WINDOW,
                );
                writer.write_all(body).map_err(err)?;
                writer.flush().map_err(err)?;
                Ok(writer.into_inner())
            }
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running a body through [`transform`].
#[derive(Debug, Clone)]
pub struct Transformed {
    pub body: Bytes,
    /// Encoding of `body`; differs from the input encoding when compression was dropped.
    pub encoding: Encoding,
}

/// Decodes `raw`, applies `rewrite`, and re-encodes with the same scheme when
/// `preserve_compression` is set; otherwise the rewritten bytes are emitted as identity.
pub fn transform<F>(
    raw: Bytes,
    encoding: Encoding,
    preserve_compression: bool,
    rewrite: F,
) -> Result<Transformed, ProxyError>
where
    F: FnOnce(&[u8]) -> Cow<'_, [u8]>,
{
    match encoding {
        Encoding::Compress => Ok(Transformed { body: raw, encoding }),
        Encoding::Identity => {
            let body = match rewrite(&raw) {
                Cow::Borrowed(_) => raw.clone(),
                Cow::Owned(rewritten) => Bytes::from(rewritten),
            };
            Ok(Transformed { body, encoding })
        }
        Encoding::Gzip | Encoding::Deflate | Encoding::Brotli => {
            let decoded = encoding.decode(&raw)?;
            let changed = match rewrite(&decoded) {
                Cow::Borrowed(_) => None,
                Cow::Owned(rewritten) => Some(rewritten),
            };

            if preserve_compression {
                let body = match changed {
                    Some(rewritten) => Bytes::from(encoding.encode(&rewritten)?),
                    None => raw,
                };
                Ok(Transformed { body, encoding })
            } else {
                Ok(Transformed {
                    body: Bytes::from(changed.unwrap_or(decoded)),
                    encoding: Encoding::Identity,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shout(body: &[u8]) -> Cow<'_, [u8]> {
        Cow::Owned(body.to_ascii_uppercase())
    }

    fn untouched(body: &[u8]) -> Cow<'_, [u8]> {
        Cow::Borrowed(body)
    }

    fn never_called(_: &[u8]) -> Cow<'_, [u8]> {
        panic!("compress bodies are never rewritten")
    }

    #[test]
    fn test_parse_encoding() {
        assert_eq!(Encoding::parse(None), Some(Encoding::Identity));
        assert_eq!(Encoding::parse(Some("")), Some(Encoding::Identity));
        assert_eq!(Encoding::parse(Some("GZIP")), Some(Encoding::Gzip));
        assert_eq!(Encoding::parse(Some("x-gzip")), Some(Encoding::Gzip));
        assert_eq!(Encoding::parse(Some("deflate")), Some(Encoding::Deflate));
        assert_eq!(Encoding::parse(Some(" br ")), Some(Encoding::Brotli));
        assert_eq!(Encoding::parse(Some("compress")), Some(Encoding::Compress));
        assert_eq!(Encoding::parse(Some("zstd")), None);
        assert_eq!(Encoding::parse(Some("gzip, br")), None);
    }

    #[test]
    fn test_compressed_encodings_survive_encode_decode() {
        let text = b"<a href=\"https://example.com/\">example</a>".repeat(20);
        for encoding in [Encoding::Gzip, Encoding::Deflate, Encoding::Brotli] {
            let packed = encoding.encode(&text).unwrap();
            assert_ne!(packed, text, "{} should change the bytes", encoding);
            assert_eq!(encoding.decode(&packed).unwrap(), text);
        }
    }

    #[test]
    fn test_raw_deflate_is_accepted() {
        let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"raw deflate body").unwrap();
        let packed = encoder.finish().unwrap();

        assert_eq!(Encoding::Deflate.decode(&packed).unwrap(), b"raw deflate body");
    }

    #[test]
    fn test_transform_drops_compression_by_default() {
        let raw = Bytes::from(Encoding::Gzip.encode(b"hello").unwrap());
        let out = transform(raw, Encoding::Gzip, false, shout).unwrap();

        assert_eq!(out.encoding, Encoding::Identity);
        assert_eq!(out.body.as_ref(), b"HELLO");
    }

    #[test]
    fn test_transform_preserves_compression() {
        for encoding in [Encoding::Gzip, Encoding::Deflate, Encoding::Brotli] {
            let raw = Bytes::from(encoding.encode(b"hello").unwrap());
            let out = transform(raw, encoding, true, shout).unwrap();

            assert_eq!(out.encoding, encoding);
            assert_eq!(encoding.decode(&out.body).unwrap(), b"HELLO");
        }
    }

    #[test]
    fn test_unchanged_compressed_body_is_reused() {
        let raw = Bytes::from(Encoding::Brotli.encode(b"static").unwrap());
        let out = transform(raw.clone(), Encoding::Brotli, true, untouched).unwrap();
        assert_eq!(out.body, raw);
    }

    #[test]
    fn test_identity_transform() {
        let out = transform(Bytes::from_static(b"plain"), Encoding::Identity, true, shout).unwrap();
        assert_eq!(out.encoding, Encoding::Identity);
        assert_eq!(out.body.as_ref(), b"PLAIN");

        let raw = Bytes::from_static(b"plain");
        let out = transform(raw.clone(), Encoding::Identity, false, untouched).unwrap();
        assert_eq!(out.body, raw);
    }

    #[test]
    fn test_compress_passes_through_without_rewriting() {
        let raw = Bytes::from_static(b"\x1f\x9d lzw data");
        let out = transform(raw.clone(), Encoding::Compress, false, never_called).unwrap();

        assert_eq!(out.encoding, Encoding::Compress);
        assert_eq!(out.body, raw);
    }

    #[test]
    fn test_corrupt_body_is_an_error() {
        let err = transform(Bytes::from_static(b"not gzip"), Encoding::Gzip, false, shout).unwrap_err();
        assert!(matches!(err, ProxyError::Codec { ref encoding, .. } if encoding == "gzip"));
    }
}
