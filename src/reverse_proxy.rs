use crate::common::{self, ProxyBody, ResponseBuilder};
use crate::config::ProxyConfig;
use crate::director::{upgrade_protocol, Exchange, RequestDirector};
use crate::error::ProxyError;
use crate::static_files::OverrideResponder;
use crate::transformer::ResponseTransformer;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

type HttpClient = Client<HttpsConnector<HttpConnector>, Incoming>;

/// Wires the override folder, director, upstream client and transformer together.
pub struct ReverseProxy {
    config: Arc<ProxyConfig>,
    client: HttpClient,
    overrides: Option<OverrideResponder>,
}

impl ReverseProxy {
    pub fn new(config: ProxyConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build(HttpsConnector::new_with_connector(http));

        let overrides = config.overwrite_folder.clone().map(OverrideResponder::new);

        Self {
            config: Arc::new(config),
            client,
            overrides,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Handles one inbound request. Only a cancelled exchange is returned as an
    /// error, which makes hyper close the connection without writing a response.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if let Some(overrides) = &self.overrides {
            let (method, uri) = (req.method().clone(), req.uri().clone());
            match overrides.respond(&method, &uri).await {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {}
                Err(e) => {
                    error!("Override folder error for {}: {}", uri.path(), e);
                    return Ok(ResponseBuilder::error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &e.to_string(),
                    ));
                }
            }
        }

        match self.process_request(req, client_addr).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_cancellation() => {
                debug!("Exchange with {} cancelled: {}", client_addr, e);
                Err(e)
            }
            Err(e) => {
                error!("Proxy error: {}", e);
                Ok(ResponseBuilder::proxy_error(&e.to_string()))
            }
        }
    }

    async fn process_request(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let client_upgrade = upgrade_protocol(req.headers()).map(|_| hyper::upgrade::on(&mut req));
        let exchange = RequestDirector::new(&self.config).direct(&mut req, Some(client_addr))?;

        // Only the wait for the response head is bounded; streamed bodies may stay open.
        let response = timeout(self.config.request_timeout, self.client.request(req))
            .await
            .map_err(|_| self.timed_out())??;
        debug!("Upstream answered {} for {}", response.status(), exchange.inbound_uri);

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                return Ok(tunnel(client_upgrade, response, &exchange));
            }
        }

        self.transform(response, &exchange).await
    }

    /// Rewritable bodies are collected before the head is sent, under their own timeout.
    async fn transform(
        &self,
        response: Response<Incoming>,
        exchange: &Exchange,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        timeout(
            self.config.request_timeout,
            ResponseTransformer::new(&self.config).transform(response, exchange),
        )
        .await
        .map_err(|_| self.timed_out())?
    }

    fn timed_out(&self) -> ProxyError {
        ProxyError::Timeout(self.config.request_timeout.as_secs())
    }

    /// Accepts connections until the listener fails, one task per connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr()?;
        let scheme = if tls.is_some() { "https" } else { "http" };
        info!("Listening on {}://{} -> {}", scheme, local_addr, self.config.target);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let proxy = self.clone();
            let tls = tls.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            proxy.serve_connection(TokioIo::new(tls_stream), remote_addr).await
                        }
                        Err(e) => warn!("Error establishing TLS connection from {}: {}", remote_addr, e),
                    },
                    None => proxy.serve_connection(TokioIo::new(stream), remote_addr).await,
                }
            });
        }
    }

    async fn serve_connection<I>(self: Arc<Self>, io: I, remote_addr: SocketAddr)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let service = service_fn(move |req| {
            let proxy = self.clone();
            async move { proxy.handle(req, remote_addr).await }
        });

        if let Err(e) = ServerBuilder::new()
            .keep_alive(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!("Connection from {} closed: {}", remote_addr, e);
        }
    }
}

/// Answers the client with the upstream's 101 and splices both upgraded
/// connections once hyper has handed them over.
fn tunnel(
    client_upgrade: OnUpgrade,
    mut response: Response<Incoming>,
    exchange: &Exchange,
) -> Response<ProxyBody> {
    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let uri = exchange.inbound_uri.clone();

    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok((client, upstream)) => {
                let mut client = TokioIo::new(client);
                let mut upstream = TokioIo::new(upstream);
                match copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((sent, received)) => {
                        debug!("Tunnel for {} closed: {} bytes up, {} bytes down", uri, sent, received)
                    }
                    Err(e) => debug!("Tunnel for {} failed: {}", uri, e),
                }
            }
            Err(e) => warn!("Upgrade for {} failed: {}", uri, e),
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, common::empty())
}
