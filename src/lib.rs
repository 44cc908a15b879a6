pub mod codec;
pub mod common;
pub mod config;
pub mod config_validation;
pub mod content;
pub mod director;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod reverse_proxy;
pub mod rewrite;
pub mod static_files;
pub mod transformer;

pub use config::{Config, ProxyConfig};
pub use error::ProxyError;
pub use proxy::ProxyFactory;
pub use reverse_proxy::ReverseProxy;
pub use rewrite::HostRewriter;
