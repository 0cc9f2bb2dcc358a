//! Level-gated logging on the standard `log` facade
//!
//! Configure once at startup, then use the standard `log` macros
//! (`info!`, `debug!`, `error!`) everywhere. Three destinations are
//! supported: console (stderr), a file with size-based rotation, and a
//! null sink for tests and embedding.
//!
//! ```rust,no_run
//! use webstone_core::logging::{init_logging, LogDestination, LoggingConfig, LogLevel};
//!
//! let config = LoggingConfig {
//!     level: LogLevel::Info,
//!     destination: LogDestination::File {
//!         path: "logs/webstone.log".into(),
//!         max_file_size: 10_000_000,
//!     },
//! };
//! init_logging(&config).unwrap();
//! log::info!("server starting");
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use serde::Deserialize;

static INIT: Once = Once::new();

/// Severity threshold, lowest to highest verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Where log records go
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum LogDestination {
    Console,
    File {
        path: PathBuf,
        #[serde(default = "default_max_file_size")]
        max_file_size: u64,
    },
    Null,
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub destination: LogDestination,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: LogLevel::Info, destination: LogDestination::Console }
    }
}

/// Install the webstone logger as the global `log` backend.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    INIT.call_once(|| {
        let logger = WebstoneLogger::new(config);
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(config.level.to_filter());
        }
    });
    Ok(())
}

struct WebstoneLogger {
    level: LogLevel,
    writer: LogWriter,
}

enum LogWriter {
    Console,
    File(Mutex<RotatingFile>),
    Null,
}

impl WebstoneLogger {
    fn new(config: &LoggingConfig) -> Self {
        let writer = match &config.destination {
            LogDestination::Console => LogWriter::Console,
            LogDestination::File { path, max_file_size } => {
                LogWriter::File(Mutex::new(RotatingFile::new(path.clone(), *max_file_size)))
            }
            LogDestination::Null => LogWriter::Null,
        };
        Self { level: config.level, writer }
    }
}

fn format_record(record: &log::Record) -> String {
    format!(
        "{} [{}] {}: {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

impl log::Log for WebstoneLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level.to_filter()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);
        match &self.writer {
            LogWriter::Console => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
            LogWriter::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write(line.as_bytes());
                }
            }
            LogWriter::Null => {}
        }
    }

    fn flush(&self) {
        match &self.writer {
            LogWriter::Console => {
                let _ = std::io::stderr().flush();
            }
            LogWriter::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.flush();
                }
            }
            LogWriter::Null => {}
        }
    }
}

/// Append-only log file that rolls over to `<path>.old` once it grows
/// past `max_size`.
struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn new(path: PathBuf, max_size: u64) -> Self {
        Self { path, max_size, file: None, written: 0 }
    }

    fn open(&mut self) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
            self.file = Some(file);
        }
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;
        let rotated = rotated_path(&self.path);
        let _ = fs::remove_file(&rotated);
        fs::rename(&self.path, &rotated)?;
        self.written = 0;
        self.open()
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.open()?;
        if self.written + data.len() as u64 > self.max_size && self.written > 0 {
            self.rotate()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(data)?;
            self.written += data.len() as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert!(matches!(config.destination, LogDestination::Console));
    }

    #[test]
    fn test_level_deserializes_lowercase() {
        let level: LogLevel = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(level, LogLevel::Debug);
    }

    #[test]
    fn test_rotated_path_keeps_extension() {
        assert_eq!(
            rotated_path(Path::new("logs/webstone.log")),
            PathBuf::from("logs/webstone.log.old")
        );
    }

    #[test]
    fn test_rotating_file_rolls_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let mut file = RotatingFile::new(path.clone(), 16);

        file.write(b"0123456789abcdef").unwrap();
        file.write(b"next generation\n").unwrap();
        file.flush().unwrap();

        assert!(rotated_path(&path).exists());
        let current = fs::read_to_string(&path).unwrap();
        assert_eq!(current, "next generation\n");
    }
}
