//! On-disk configuration model
//!
//! The whole server is driven by one JSON document: socket and worker
//! pool tuning, HTTP engine parameters, the virtual directory hierarchy
//! with its listing templates, handler registrations and URL mapping
//! rules, plus the MIME table and logging setup.
//!
//! The `{tab}` token inside listing templates expands to a TAB character
//! at load time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WebstoneError};
use crate::logging::LoggingConfig;

/// Tuning of the generic acceptor and worker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the listener binds to
    pub bind_addr: IpAddr,
    /// Backlog passed to `listen`
    pub backlog: i32,
    /// Set SO_REUSEADDR before binding
    pub reuse_addr: bool,
    /// Keep idle workers alive to pick up pooled connections
    pub enable_pooling: bool,
    /// Upper bound on concurrently running workers
    pub workers_count: usize,
    /// Seconds an idle worker waits for a handoff before retiring
    pub worker_life_time: u64,
    /// Per-socket read timeout, seconds
    pub socket_read_timeout: u64,
    /// Per-socket write timeout, seconds
    pub socket_write_timeout: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            backlog: 128,
            reuse_addr: true,
            enable_pooling: true,
            workers_count: 500,
            worker_life_time: 300,
            socket_read_timeout: 60,
            socket_write_timeout: 60,
        }
    }
}

impl ServerSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_write_timeout)
    }
}

/// HTTP engine parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Port the HTTP listener binds to (0 picks an ephemeral port)
    pub port: u16,
    /// Port of the administrative control channel
    pub command_port: u16,
    /// Socket timeout on the control channel, seconds
    pub command_socket_timeout: u64,
    /// Value of the `Server` response header
    pub server_version: String,
    /// Honor `Connection: Keep-Alive`
    pub keep_alive_enabled: bool,
    /// Seconds an idle pooled connection may wait for its next request
    pub keep_alive_timeout: u64,
    /// Response buffer size; bodies that fit are sent fixed-length
    pub response_buffer_size: usize,
    /// Upper bound of a single chunk in chunked framing
    pub max_chunk_size: usize,
    /// Directory multipart uploads spill into
    pub uploads_dir: PathBuf,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            command_port: 8081,
            command_socket_timeout: 30,
            server_version: format!("webstone/{}", env!("CARGO_PKG_VERSION")),
            keep_alive_enabled: true,
            keep_alive_timeout: 5,
            response_buffer_size: 2 * 1024 * 1024,
            max_chunk_size: 65535,
            uploads_dir: PathBuf::from("uploads"),
        }
    }
}

/// Add or remove a default document relative to the parent directory's
/// merged list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultDocumentRule {
    pub action: DocumentAction,
    pub name: String,
}

/// Binds a file extension (or `*`) to a named handler.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerBinding {
    pub ext: String,
    pub handler: String,
}

/// A URL rewrite rule: requests matching `regex` (relative to the
/// directory) are rewritten to `url`, with `{0}`, `{1}`, ... replaced
/// by captured groups.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingRule {
    pub regex: String,
    pub url: String,
}

/// The six HTML fragments a directory listing is assembled from.
/// Unset fragments are inherited from the parent directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListingTemplates {
    pub header: Option<String>,
    pub parent_directory: Option<String>,
    pub virtual_directory: Option<String>,
    pub directory: Option<String>,
    pub file: Option<String>,
    pub footer: Option<String>,
}

impl ListingTemplates {
    fn expand_tabs(&mut self) {
        for slot in [
            &mut self.header,
            &mut self.parent_directory,
            &mut self.virtual_directory,
            &mut self.directory,
            &mut self.file,
            &mut self.footer,
        ] {
            if let Some(t) = slot.as_mut() {
                *t = t.replace("{tab}", "\t");
            }
        }
    }
}

/// One virtual directory record. The root carries an absolute `path`
/// and no parent; descendants name their parent and either a
/// `relative_path` under it or an absolute `path` of their own (which
/// makes them a linked directory).
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub virtual_path: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default)]
    pub browsing_enabled: Option<bool>,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub default_documents: Vec<DefaultDocumentRule>,
    #[serde(default)]
    pub handlers: Vec<HandlerBinding>,
    #[serde(default)]
    pub mappings: Vec<MappingRule>,
    #[serde(default)]
    pub templates: ListingTemplates,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub http: HttpSettings,
    pub logging: LoggingConfig,
    pub directories: Vec<DirectoryConfig>,
    pub mime_types: HashMap<String, String>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WebstoneError::SettingsLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_json::from_str(&raw).map_err(|e| {
            WebstoneError::SettingsLoad(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.finish();
        Ok(config)
    }

    /// Post-deserialization fixups shared by `load` and tests.
    pub fn finish(&mut self) {
        for dir in &mut self.directories {
            dir.templates.expand_tabs();
        }
        let mut mime = default_mime_types();
        mime.extend(self.mime_types.drain());
        self.mime_types = mime;
    }

    /// Content type for a file extension (lowercased, without the dot),
    /// falling back to `application/octet-stream`.
    pub fn mime_type(&self, ext: &str) -> &str {
        self.mime_types
            .get(&ext.to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or("application/octet-stream")
    }
}

fn default_mime_types() -> HashMap<String, String> {
    [
        ("html", "text/html"),
        ("htm", "text/html"),
        ("txt", "text/plain"),
        ("css", "text/css"),
        ("js", "application/javascript"),
        ("json", "application/json"),
        ("xml", "text/xml"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("svg", "image/svg+xml"),
        ("ico", "image/x-icon"),
        ("pdf", "application/pdf"),
        ("zip", "application/zip"),
        ("gz", "application/gzip"),
        ("tar", "application/x-tar"),
        ("mp3", "audio/mpeg"),
        ("mp4", "video/mp4"),
        ("wasm", "application/wasm"),
        ("woff2", "font/woff2"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_settings_defaults() {
        let settings = ServerSettings::default();
        assert_eq!(settings.workers_count, 500);
        assert_eq!(settings.worker_life_time, 300);
        assert!(settings.enable_pooling);
        assert!(settings.reuse_addr);
    }

    #[test]
    fn test_http_settings_defaults() {
        let http = HttpSettings::default();
        assert_eq!(http.response_buffer_size, 2 * 1024 * 1024);
        assert_eq!(http.max_chunk_size, 65535);
        assert!(http.keep_alive_enabled);
        assert_eq!(http.keep_alive_timeout, 5);
    }

    #[test]
    fn test_mime_lookup_with_fallback() {
        let mut config = Config::default();
        config.finish();
        assert_eq!(config.mime_type("HTML"), "text/html");
        assert_eq!(config.mime_type("weird"), "application/octet-stream");
    }

    #[test]
    fn test_mime_override_from_config() {
        let mut config: Config =
            serde_json::from_str(r#"{"mime_types": {"txt": "text/x-custom"}}"#).unwrap();
        config.finish();
        assert_eq!(config.mime_type("txt"), "text/x-custom");
        assert_eq!(config.mime_type("css"), "text/css");
    }

    #[test]
    fn test_directory_config_parses() {
        let json = r#"{
            "name": "docs",
            "parent": "root",
            "virtual_path": "docs",
            "relative_path": "docs",
            "browsing_enabled": true,
            "default_documents": [{"action": "add", "name": "index.html"}],
            "handlers": [{"ext": "py", "handler": "python"}],
            "mappings": [{"regex": "^old/(.*)$", "url": "new/{0}"}],
            "templates": {"header": "<pre>{tab}{page-url}"}
        }"#;
        let mut dir: DirectoryConfig = serde_json::from_str(json).unwrap();
        dir.templates.expand_tabs();
        assert_eq!(dir.default_documents[0].action, DocumentAction::Add);
        assert_eq!(dir.handlers[0].ext, "py");
        assert_eq!(dir.templates.header.as_deref(), Some("<pre>\t{page-url}"));
    }
}
