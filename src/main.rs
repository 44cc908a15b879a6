use anyhow::{anyhow, bail, Context};
use clap::Parser;
use log::{error, info, warn};
use rewrite_bridge::config::{Config, HeaderEntry, LogFormat, LogLevel};
use rewrite_bridge::config_validation::ConfigValidator;
use rewrite_bridge::logging;
use rewrite_bridge::proxy::ProxyFactory;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Serve an upstream site from this host, rewriting links, cookies and redirects to point back at the proxy"
)]
struct Args {
    #[clap(value_name = "TARGET", help = "Upstream origin to proxy (e.g. https://example.com)")]
    target: Option<String>,

    #[clap(short, long, value_name = "IP", help = "Address to listen on [default: 0.0.0.0]")]
    address: Option<IpAddr>,

    #[clap(short, long, env = "PORT", value_name = "PORT", help = "Port to listen on [default: 80]")]
    port: Option<u16>,

    #[clap(long, help = "Keep the upstream content-encoding when rewriting compressed bodies")]
    compress: bool,

    #[clap(long, help = "Add permissive CORS headers to every response")]
    cors: bool,

    #[clap(long, value_name = "HEADERS", value_delimiter = ',', help = "Comma separated Access-Control-Allow-Headers")]
    cors_allow_headers: Vec<String>,

    #[clap(long, value_name = "HEADERS", value_delimiter = ',', help = "Comma separated Access-Control-Expose-Headers")]
    cors_expose_headers: Vec<String>,

    #[clap(long, help = "Tell clients not to cache proxied responses")]
    no_cache: bool,

    #[clap(long, help = "Route links to other hosts through the proxy as well")]
    proxy_external: bool,

    #[clap(long, value_name = "HOST", help = "Host left untouched by --proxy-external (can be used multiple times)")]
    proxy_external_ignore: Vec<String>,

    #[clap(long, value_name = "KEY=VALUE", help = "Header added to upstream requests (can be used multiple times)")]
    req_header: Vec<HeaderEntry>,

    #[clap(long, value_name = "KEY=VALUE", help = "Header added to client responses (can be used multiple times)")]
    res_header: Vec<HeaderEntry>,

    #[clap(long, value_name = "DIR", help = "Serve files from this folder instead of the upstream when they exist")]
    overwrite: Option<PathBuf>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn or error [default: info]")]
    log_level: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json [default: text]")]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file)
                .map_err(|e| anyhow!("Failed to load configuration file {}: {}", config_file, e))?
        }
        None => Config::default(),
    };
    apply_args(&mut config, &args);

    if let (Some(logging), Some(level)) = (config.logging.as_mut(), args.log_level) {
        logging.level = Some(level);
    }
    logging::init(
        config.logging.clone(),
        args.log_level.unwrap_or_default(),
        args.log_format.unwrap_or_default(),
    )
    .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    let validation = ConfigValidator::new(&config).validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid {
        for err in &validation.errors {
            error!("{}", err);
        }
        bail!("Invalid configuration: {}", validation.errors.join("; "));
    }

    let server = ProxyFactory::create_proxy(config).context("Failed to create proxy")?;
    info!("Starting proxy server on {}", server.addr());

    tokio::select! {
        result = server.run() => {
            result.context("Proxy server stopped")?;
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

/// Command line values win over the configuration file.
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(target) = &args.target {
        config.target = Some(target.clone());
    }

    let ip = args.address.unwrap_or_else(|| config.listen_addr.ip());
    let port = args.port.unwrap_or_else(|| config.listen_addr.port());
    config.listen_addr = SocketAddr::new(ip, port);

    if args.compress {
        config.preserve_compression = true;
    }
    if args.no_cache {
        config.disable_cache = true;
    }
    if args.cors {
        config.cors.enabled = true;
    }
    if !args.cors_allow_headers.is_empty() {
        config.cors.allow_headers = trimmed(&args.cors_allow_headers);
    }
    if !args.cors_expose_headers.is_empty() {
        config.cors.expose_headers = trimmed(&args.cors_expose_headers);
    }
    if args.proxy_external {
        config.proxy_external = true;
    }
    config
        .proxy_external_ignores
        .extend(args.proxy_external_ignore.iter().cloned());
    config.request_headers.extend(args.req_header.iter().cloned());
    config.response_headers.extend(args.res_header.iter().cloned());

    if let Some(folder) = &args.overwrite {
        config.overwrite_folder = Some(folder.clone());
    }
    if let Some(key) = &args.private_key {
        config.private_key = Some(key.clone());
    }
    if let Some(cert) = &args.certificate {
        config.certificate = Some(cert.clone());
    }
}

fn trimmed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let sample = Config {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        target: Some("https://example.com".to_string()),
        request_headers: vec![HeaderEntry {
            name: "X-Requested-By".to_string(),
            value: "rewrite-bridge".to_string(),
        }],
        proxy_external_ignores: vec!["fonts.googleapis.com".to_string()],
        logging: Some(Default::default()),
        ..Config::default()
    };

    sample
        .to_file(file_path)
        .map_err(|e| anyhow!("Failed to write {}: {}", file_path, e))
}
