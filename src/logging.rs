use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

pub struct CustomLogger {
    level: LevelFilter,
    targets: Vec<LogTarget>,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let level = config.level.unwrap_or_default().to_level_filter();
        let format = config.format.unwrap_or_default();
        let mut targets = config.targets.unwrap_or_default();
        if targets.is_empty() {
            targets.push(LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            });
        }

        let mut writers = Vec::new();
        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or("File output type requires path")?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            level,
            targets,
            format,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config)?;
        log::set_max_level(logger.max_level());
        log::set_boxed_logger(Box::new(logger))?;
        Ok(())
    }

    /// Most verbose level any target accepts.
    fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|target| self.target_level(target))
            .max()
            .unwrap_or(self.level)
    }

    fn target_level(&self, target: &LogTarget) -> LevelFilter {
        target.level.map_or(self.level, LogLevel::to_level_filter)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    }

    fn format_json(record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        let log_entry = json!({
            "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "level": record.level().to_string().to_lowercase(),
            "target": record.target(),
            "module": record.module_path().unwrap_or("unknown"),
            "line": record.line().unwrap_or(0),
            "message": record.args().to_string(),
        });
        log_entry.to_string()
    }
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => Self::format_json(record),
        };

        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if record.level() <= self.target_level(target) {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

/// `env_logger` honouring `RUST_LOG`, used when no `logging` block is configured.
pub fn init_fallback(level: LogLevel, format: LogFormat) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", CustomLogger::format_json(record)));
    }
    builder.init();
}

/// Installs the configured logger, or `env_logger` with the given defaults.
pub fn init(
    config: Option<LoggingConfig>,
    default_level: LogLevel,
    default_format: LogFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match config {
        Some(config) => CustomLogger::init(config),
        None => {
            init_fallback(default_level, default_format);
            Ok(())
        }
    }
}
