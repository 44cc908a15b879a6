//! Configuration checks run before the listener starts.
//!
//! Errors stop startup; warnings are logged and the proxy still runs.

use crate::config::{parse_target, Config};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_target(&mut result);
        self.validate_tls(&mut result);
        self.validate_headers(&mut result);
        self.validate_overwrite_folder(&mut result);
        self.validate_external_ignores(&mut result);
        self.validate_timeouts(&mut result);

        result
    }

    fn validate_target(&self, result: &mut ValidationResult) {
        let Some(target) = self.config.target.as_deref() else {
            result.add_error("An upstream target is required (e.g. https://example.com)".to_string());
            return;
        };

        match parse_target(target) {
            Ok(origin) => {
                let trimmed = target.trim_end_matches('/');
                if trimmed != origin.as_str().trim_end_matches('/') {
                    result.add_warning(format!(
                        "Target '{}' has a path or query; only {} is used",
                        target, origin
                    ));
                }
            }
            Err(e) => result.add_error(e.to_string()),
        }
    }

    fn validate_tls(&self, result: &mut ValidationResult) {
        match (&self.config.private_key, &self.config.certificate) {
            (Some(_), None) => result.add_error("A private key was given without a certificate".to_string()),
            (None, Some(_)) => result.add_error("A certificate was given without a private key".to_string()),
            (Some(key), Some(cert)) => {
                for (label, path) in [("Private key", key), ("Certificate", cert)] {
                    if !Path::new(path).is_file() {
                        result.add_error(format!("{} file '{}' does not exist", label, path));
                    }
                }
            }
            (None, None) => {
                if self.config.use_ssl == Some(true) {
                    result.add_warning(
                        "use_ssl is set without TLS material; an upstream TLS terminator is assumed".to_string(),
                    );
                }
            }
        }
    }

    fn validate_headers(&self, result: &mut ValidationResult) {
        let entries = self
            .config
            .request_headers
            .iter()
            .map(|entry| ("request", entry))
            .chain(self.config.response_headers.iter().map(|entry| ("response", entry)));

        for (direction, entry) in entries {
            if http::header::HeaderName::from_bytes(entry.name.as_bytes()).is_err() {
                result.add_error(format!("Invalid {} header name '{}'", direction, entry.name));
            }
            if http::header::HeaderValue::from_str(&entry.value).is_err() {
                result.add_error(format!("Invalid value for {} header '{}'", direction, entry.name));
            }
        }
    }

    fn validate_overwrite_folder(&self, result: &mut ValidationResult) {
        if let Some(folder) = &self.config.overwrite_folder {
            if !folder.is_dir() {
                result.add_error(format!(
                    "Overwrite folder '{}' is not a directory",
                    folder.display()
                ));
            }
        }
    }

    fn validate_external_ignores(&self, result: &mut ValidationResult) {
        for host in &self.config.proxy_external_ignores {
            if host.contains("://") || host.contains('/') {
                result.add_warning(format!(
                    "proxy_external_ignores entry '{}' should be a host name, not a URL",
                    host
                ));
            }
        }
        if !self.config.proxy_external && !self.config.proxy_external_ignores.is_empty() {
            result.add_warning("proxy_external_ignores has no effect unless proxy_external is enabled".to_string());
        }
    }

    fn validate_timeouts(&self, result: &mut ValidationResult) {
        if self.config.connect_timeout_secs == Some(0) {
            result.add_error("connect_timeout_secs must be greater than 0".to_string());
        }
        if self.config.request_timeout_secs == Some(0) {
            result.add_error("request_timeout_secs must be greater than 0".to_string());
        }
    }
}
