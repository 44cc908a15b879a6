use crate::common::TlsConfig;
use crate::config::{Config, ProxyConfig};
use crate::error::ProxyError;
use crate::reverse_proxy::ReverseProxy;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// A configured proxy that has not yet bound its listener.
pub struct ProxyServer {
    proxy: ReverseProxy,
    addr: SocketAddr,
    private_key: Option<String>,
    certificate: Option<String>,
}

impl ProxyServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_tls(&self) -> bool {
        self.private_key.is_some() && self.certificate.is_some()
    }

    pub fn proxy(&self) -> &ReverseProxy {
        &self.proxy
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ProxyError> {
        match (&self.private_key, &self.certificate) {
            (Some(key), Some(cert)) => {
                info!("Loading TLS material from {} and {}", key, cert);
                let config = TlsConfig::create_config(key, cert)?;
                Ok(Some(TlsAcceptor::from(Arc::new(config))))
            }
            _ => Ok(None),
        }
    }

    /// Binds the listen address and serves until the listener fails.
    pub async fn run(self) -> Result<(), ProxyError> {
        let tls = self.tls_acceptor()?;
        let listener = TcpListener::bind(self.addr).await?;
        Arc::new(self.proxy).serve(listener, tls).await
    }
}

pub struct ProxyFactory;

impl ProxyFactory {
    pub fn create_proxy(config: Config) -> Result<ProxyServer, ProxyError> {
        let proxy_config = ProxyConfig::from_config(&config)?;
        info!(
            "Proxying {} on {} (client scheme: {})",
            proxy_config.target,
            config.listen_addr,
            if proxy_config.use_ssl { "https" } else { "http" }
        );
        debug!(
            "preserve_compression: {}, disable_cache: {}, cors: {}, proxy_external: {}, overwrite_folder: {:?}",
            proxy_config.preserve_compression,
            proxy_config.disable_cache,
            proxy_config.cors.enabled,
            proxy_config.proxy_external,
            proxy_config.overwrite_folder
        );

        Ok(ProxyServer {
            proxy: ReverseProxy::new(proxy_config),
            addr: config.listen_addr,
            private_key: config.private_key,
            certificate: config.certificate,
        })
    }
}
