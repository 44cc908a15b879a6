use crate::error::ProxyError;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes};
use hyper::{Response, StatusCode};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response the proxy writes: buffered after a rewrite, streamed otherwise.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::<BoxError>::into).boxed_unsync()
}

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    boxed(Full::new(bytes.into()))
}

pub fn empty() -> ProxyBody {
    boxed(Empty::<Bytes>::new())
}

/// Response shapes shared by the proxy's error paths.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Creates a proxy error response with custom message
    pub fn proxy_error(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, &format!("Proxy Error: {}", message))
    }

    /// Creates a generic error response with custom status and message
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full(message.to_string()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

pub struct TlsConfig;

impl TlsConfig {
    /// Creates a TLS configuration from PEM certificate and key files
    pub fn create_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, ProxyError> {
        let mut private_key_file = BufReader::new(
            File::open(private_key_path)
                .map_err(|e| ProxyError::Config(format!("Failed to open private key file: {}", e)))?,
        );

        let mut cert_file = BufReader::new(
            File::open(cert_path)
                .map_err(|e| ProxyError::Config(format!("Failed to open certificate file: {}", e)))?,
        );

        let certs = rustls_pemfile::certs(&mut cert_file)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(ProxyError::Config("No valid certificate found".to_string()));
        }

        let private_key = rustls_pemfile::private_key(&mut private_key_file)
            .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
            .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}
