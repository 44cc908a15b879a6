use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_TYPE, HOST, LOCATION, SET_COOKIE, UPGRADE};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rewrite_bridge::codec::Encoding;
use rewrite_bridge::config::ProxyConfig;
use rewrite_bridge::reverse_proxy::ReverseProxy;
use rewrite_bridge::rewrite::query_escape;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use url::Url;

async fn upstream(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == "/echo" {
        return Ok(echo_upgrade(req));
    }

    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    let host = header("host");

    let response = match req.uri().path() {
        "/page" => {
            let html = format!(
                r#"<a href="http://{}/next">next</a><img src="https://cdn.example.net/x.png">"#,
                host
            );
            Response::builder()
                .header(CONTENT_TYPE, "text/html")
                .header(CONTENT_ENCODING, "gzip")
                .body(Full::new(Bytes::from(Encoding::Gzip.encode(html.as_bytes()).unwrap())))
        }
        "/redirect" => Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(LOCATION, format!("http://{}/page", host))
            .body(Full::new(Bytes::new())),
        "/cookie" => Response::builder()
            .header(SET_COOKIE, "token=1; Domain=upstream.test; Path=/; Secure")
            .body(Full::new(Bytes::from_static(b"ok"))),
        "/headers" => {
            let echo = format!(
                "host={} origin-host={} real-ip={} query={}",
                host,
                header("x-origin-host"),
                header("x-real-ip"),
                req.uri().query().unwrap_or("-")
            );
            Response::builder()
                .header(CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from(echo)))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    };
    Ok(response.unwrap())
}

/// Switches to a raw echo protocol once the client asks for an upgrade.
fn echo_upgrade(req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.headers().get(UPGRADE).map(|v| v.as_bytes()) != Some(b"echo".as_slice()) {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    tokio::spawn(async move {
        let upgraded = hyper::upgrade::on(req).await.unwrap();
        let mut io = TokioIo::new(upgraded);
        let mut buf = [0u8; 64];
        loop {
            match io.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "echo")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Upstream that sends one server-sent event and then keeps the stream open.
async fn spawn_event_stream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\n\
                          Content-Type: text/event-stream\r\n\
                          Transfer-Encoding: chunked\r\n\r\n\
                          d\r\ndata: hello\n\n\r\n",
                    )
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    addr
}

async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = ServerBuilder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream))
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

async fn spawn_proxy(config: ProxyConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = Arc::new(ReverseProxy::new(config));
    tokio::spawn(proxy.serve(listener, None));
    addr
}

fn config_for(target: SocketAddr) -> ProxyConfig {
    ProxyConfig::new(Url::parse(&format!("http://{}", target)).unwrap())
}

async fn get(url: String) -> (StatusCode, http::HeaderMap, String) {
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let request = Request::get(url).body(Full::new(Bytes::new())).unwrap();
    let response = client.request(request).await.unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_page_is_decompressed_and_rewritten() {
    let upstream_addr = spawn_upstream().await;
    let proxy_addr = spawn_proxy(config_for(upstream_addr)).await;

    let (status, headers, body) = get(format!("http://{}/page", proxy_addr)).await;

    assert_eq!(status, StatusCode::OK);
    assert_ne!(headers.get(CONTENT_ENCODING).map(|v| v.as_bytes()), Some(b"gzip".as_slice()));
    assert_eq!(headers["x-proxy-client"], "rewrite-bridge");
    assert_eq!(
        body,
        format!(
            r#"<a href="http://{}/next">next</a><img src="https://cdn.example.net/x.png">"#,
            proxy_addr
        )
    );
}

#[tokio::test]
async fn test_redirect_points_back_at_proxy() {
    let upstream_addr = spawn_upstream().await;
    let proxy_addr = spawn_proxy(config_for(upstream_addr)).await;

    let (status, headers, _) = get(format!("http://{}/redirect", proxy_addr)).await;

    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(headers[LOCATION], format!("http://{}/page", proxy_addr).as_str());
}

#[tokio::test]
async fn test_cookie_domain_and_secure_flag() {
    let upstream_addr = spawn_upstream().await;
    let proxy_addr = spawn_proxy(config_for(upstream_addr)).await;

    let (_, headers, body) = get(format!("http://{}/cookie", proxy_addr)).await;

    let cookie = headers[SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("token=1"));
    assert!(cookie.contains("Domain=127.0.0.1"));
    assert!(!cookie.contains("Secure"));
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_upstream_sees_target_host_and_client() {
    let upstream_addr = spawn_upstream().await;
    let proxy_addr = spawn_proxy(config_for(upstream_addr)).await;

    let (_, _, body) = get(format!("http://{}/headers?a=1", proxy_addr)).await;

    assert_eq!(
        body,
        format!(
            "host={} origin-host={} real-ip=127.0.0.1 query=a=1",
            upstream_addr, proxy_addr
        )
    );
}

#[tokio::test]
async fn test_forward_url_reaches_dynamic_target() {
    let upstream_addr = spawn_upstream().await;
    let config = ProxyConfig::new(Url::parse("http://static-target.invalid").unwrap());
    let proxy_addr = spawn_proxy(config).await;

    let target = format!("http://{}/headers?x=1", upstream_addr);
    let (status, _, body) = get(format!(
        "http://{}/?forward_url={}",
        proxy_addr,
        query_escape(&target)
    ))
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with(&format!("host={} origin-host={}", upstream_addr, proxy_addr)));
    assert!(body.ends_with("query=x=1"));
}

#[tokio::test]
async fn test_override_folder_wins_over_upstream() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page"), "local copy").unwrap();

    let upstream_addr = spawn_upstream().await;
    let mut config = config_for(upstream_addr);
    config.overwrite_folder = Some(dir.path().to_path_buf());
    let proxy_addr = spawn_proxy(config).await;

    let (status, _, body) = get(format!("http://{}/page", proxy_addr)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "local copy");

    let (status, _, body) = get(format!("http://{}/cookie", proxy_addr)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let proxy_addr = spawn_proxy(config_for(closed_addr)).await;
    let (status, headers, body) = get(format!("http://{}/anything", proxy_addr)).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(headers[CONTENT_TYPE], "text/plain; charset=utf-8");
    assert!(body.starts_with("Proxy Error: "));
}

#[tokio::test]
async fn test_host_header_is_not_forwarded_verbatim() {
    let upstream_addr = spawn_upstream().await;
    let proxy_addr = spawn_proxy(config_for(upstream_addr)).await;

    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let request = Request::get(format!("http://{}/headers", proxy_addr))
        .header(HOST, "public.example.org")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();

    assert!(body.starts_with(
        format!("host={} origin-host=public.example.org", upstream_addr).as_bytes()
    ));
}

#[tokio::test]
async fn test_event_stream_outlives_request_timeout() {
    let upstream_addr = spawn_event_stream().await;
    let mut config = config_for(upstream_addr);
    config.request_timeout = Duration::from_secs(1);
    let proxy_addr = spawn_proxy(config).await;

    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let request = Request::get(format!("http://{}/events", proxy_addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = timeout(Duration::from_secs(5), client.request(request))
        .await
        .expect("response head should arrive before the stream ends")
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let mut body = response.into_body();
    let frame = timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("first event should be forwarded while the stream is open")
        .unwrap()
        .unwrap();
    assert_eq!(frame.into_data().unwrap().as_ref(), b"data: hello\n\n");
}

#[tokio::test]
async fn test_upgrade_is_tunnelled_to_upstream() {
    let upstream_addr = spawn_upstream().await;
    let proxy_addr = spawn_proxy(config_for(upstream_addr)).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(
            format!(
                "GET /echo HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
                proxy_addr
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut byte)).await.unwrap().unwrap();
        assert_eq!(n, 1, "connection closed before the response head ended");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap().to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 101"), "unexpected head: {}", head);
    assert!(head.contains("upgrade: echo"));

    stream.write_all(b"ping over the tunnel").await.unwrap();
    let mut echoed = [0u8; 20];
    timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping over the tunnel");
}
