//! Per-request composition object
//!
//! One `HttpContext` lives for exactly one request on a connection. It
//! owns the parsed request header, the bounded body stream, the
//! response under construction, the decoded parameter maps and any
//! upload spill files (deleted when the context is dropped).

use std::collections::HashMap;
use std::net::{IpAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::http::params::UploadedFile;
use crate::http::request::{RequestBodyStream, RequestHeader};
use crate::http::response::HttpResponse;
use crate::http::{constants, HttpMethod};
use crate::net::{check_readable, check_writable, read_from_socket, ClientConnection, ReadCompletion};

/// The slice of global settings the request engine needs.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub response_buffer_size: usize,
    pub max_chunk_size: usize,
    pub server_version: String,
    pub uploads_dir: PathBuf,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&Config> for ContextConfig {
    fn from(config: &Config) -> Self {
        Self {
            response_buffer_size: config.http.response_buffer_size,
            max_chunk_size: config.http.max_chunk_size,
            server_version: config.http.server_version.clone(),
            uploads_dir: config.http.uploads_dir.clone(),
            read_timeout: config.server.read_timeout(),
            write_timeout: config.server.write_timeout(),
        }
    }
}

pub struct HttpContext {
    stream: TcpStream,
    pub peer_ip: IpAddr,
    pub peer_port: u16,

    pub request_header: RequestHeader,
    pub request_stream: RequestBodyStream,
    pub response: HttpResponse,
    pub method: HttpMethod,

    /// Decoded request path without the query string
    pub virtual_path: String,
    /// Virtual path after URL mapping rules were applied
    pub mapped_virtual_path: String,
    /// Filesystem target the resolver settled on
    pub file_system_path: PathBuf,

    pub get_parameters: HashMap<String, String>,
    pub post_parameters: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub uploaded_files: HashMap<String, UploadedFile>,

    pub uploads_dir: PathBuf,
    read_timeout: Duration,
    write_timeout: Duration,
    server_version: String,
}

impl HttpContext {
    pub fn new(client: &ClientConnection, config: &ContextConfig) -> Result<Self> {
        Ok(Self {
            stream: client.stream.try_clone()?,
            peer_ip: client.ip,
            peer_port: client.port,
            request_header: RequestHeader::default(),
            request_stream: RequestBodyStream::default(),
            response: HttpResponse::new(config.response_buffer_size, config.max_chunk_size),
            method: HttpMethod::Unknown,
            virtual_path: String::new(),
            mapped_virtual_path: String::new(),
            file_system_path: PathBuf::new(),
            get_parameters: HashMap::new(),
            post_parameters: HashMap::new(),
            cookies: HashMap::new(),
            uploaded_files: HashMap::new(),
            uploads_dir: config.uploads_dir.clone(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            server_version: config.server_version.clone(),
        })
    }

    /// Read and parse the request header block.
    ///
    /// Returns `Ok(false)` when the peer closed without sending a
    /// request - on a pooled connection that simply ends the keep-alive
    /// loop. The wait for the first byte of a subsequent keep-alive
    /// request is bounded by `keep_alive_timeout` instead of the
    /// regular read timeout.
    pub fn init(&mut self, is_keep_alive: bool, keep_alive_timeout: Duration) -> Result<bool> {
        if is_keep_alive {
            self.stream.set_read_timeout(Some(keep_alive_timeout))?;
        }

        let check = ReadCompletion::end_mark(constants::HEADERS_END_MARK);
        let read = read_from_socket(&mut self.stream, &check, false);

        if is_keep_alive {
            let _ = self.stream.set_read_timeout(Some(self.read_timeout));
        }
        let read = read?;

        if read.connection_closed || read.data.is_empty() {
            return Ok(false);
        }
        let mark_end = match read.mark_end {
            Some(end) => end,
            None => return Ok(false),
        };

        let header_block = std::str::from_utf8(&read.data[..mark_end])
            .map_err(|_| crate::error::WebstoneError::request("request header is not valid UTF-8"))?;
        self.request_header = RequestHeader::parse(header_block)?;

        let body_prefix = read.data[mark_end..].to_vec();
        self.request_stream.init(
            body_prefix,
            self.request_header.content_length,
            Some(self.stream.try_clone()?),
        );

        self.response.init(self.stream.try_clone()?);
        self.response.set_server_name(&self.server_version);

        Ok(true)
    }

    /// Best-effort liveness probe used by long-running handlers.
    pub fn is_client_connected(&self) -> bool {
        if self.request_stream.has_buffered_content() {
            return true;
        }
        if !self.request_stream.is_read() {
            return check_readable(&self.stream, self.read_timeout);
        }
        let _ = self.stream.set_write_timeout(Some(self.write_timeout));
        check_writable(&self.stream)
    }

    /// Default the response to `200` / `text/html` unless the handler
    /// already chose otherwise.
    pub fn set_html_response(&mut self) {
        if self.response.header.status.is_none() {
            self.response.header.status = Some(200);
        }
        if !self.response.header.has_header(constants::headers::CONTENT_TYPE) {
            self.response
                .header
                .set_content_type(constants::values::CONTENT_TYPE_TEXT_HTML, None);
        }
    }
}

impl Drop for HttpContext {
    fn drop(&mut self) {
        for upload in self.uploaded_files.values() {
            if upload.upload_path.as_os_str().is_empty() {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&upload.upload_path) {
                log::error!(
                    "upload deletion failed: {}, file: {}",
                    e,
                    upload.upload_path.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::test_support::socket_pair;
    use std::io::Write;

    fn test_config() -> ContextConfig {
        ContextConfig {
            response_buffer_size: 1024,
            max_chunk_size: 64,
            server_version: "webstone/test".into(),
            uploads_dir: std::env::temp_dir(),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
        }
    }

    fn client_for(stream: TcpStream) -> ClientConnection {
        let peer = stream.peer_addr().unwrap();
        ClientConnection { stream, ip: peer.ip(), port: peer.port() }
    }

    #[test]
    fn test_init_parses_header_and_hands_off_body() {
        let (mut remote, local) = socket_pair();
        remote
            .write_all(b"POST /form HTTP/1.1\r\nHost: x\r\nContent-Length: 9\r\n\r\nkey=value")
            .unwrap();

        let client = client_for(local);
        let mut ctx = HttpContext::new(&client, &test_config()).unwrap();
        assert!(ctx.init(false, Duration::from_secs(1)).unwrap());

        assert_eq!(ctx.request_header.method, "POST");
        assert_eq!(ctx.request_header.content_length, 9);
        assert!(ctx.request_stream.has_buffered_content());

        let mut body = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = ctx.request_stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
        assert_eq!(body, b"key=value");
    }

    #[test]
    fn test_init_peer_close_returns_false() {
        let (remote, local) = socket_pair();
        drop(remote);

        let client = client_for(local);
        let mut ctx = HttpContext::new(&client, &test_config()).unwrap();
        assert!(!ctx.init(true, Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_keep_alive_silence_returns_false() {
        let (_remote, local) = socket_pair();
        let client = client_for(local);
        let mut ctx = HttpContext::new(&client, &test_config()).unwrap();
        assert!(!ctx.init(true, Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn test_spill_files_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("a.png");
        std::fs::write(&spill, b"data").unwrap();

        let (remote, local) = socket_pair();
        let client = client_for(local);
        let mut ctx = HttpContext::new(&client, &test_config()).unwrap();
        ctx.uploaded_files.insert(
            "photo".into(),
            UploadedFile {
                name: "photo".into(),
                file_name: "a.png".into(),
                content_type: String::new(),
                is_file_data: true,
                file_size: 4,
                upload_path: spill.clone(),
            },
        );

        assert!(spill.exists());
        drop(ctx);
        drop(remote);
        assert!(!spill.exists());
    }

    #[test]
    fn test_set_html_response_defaults() {
        let (_remote, local) = socket_pair();
        let client = client_for(local);
        let mut ctx = HttpContext::new(&client, &test_config()).unwrap();

        ctx.set_html_response();
        assert_eq!(ctx.response.header.status, Some(200));
        assert_eq!(ctx.response.header.headers.get("Content-Type"), Some("text/html"));

        // an explicit choice is left alone
        ctx.response.header.status = Some(404);
        ctx.set_html_response();
        assert_eq!(ctx.response.header.status, Some(404));
    }
}
