//! Response header serialization and the buffered response stream
//!
//! Framing is decided once, just before the first byte reaches the
//! socket: a response whose body is fully buffered when `end()` runs
//! (or whose handler set `Content-Length` itself) goes out
//! fixed-length; anything that outgrows the buffer switches to chunked
//! transfer encoding on its first flush. Once the headers are on the
//! wire the choice is locked.

use std::fmt::Write as _;
use std::net::TcpStream;

use crate::error::{Result, WebstoneError};
use crate::http::{constants, format_date_rfc1123, status_phrase, Headers, HttpMethod};
use crate::net::write_to_socket;

/// Status code and headers of a response under construction.
#[derive(Debug, Default)]
pub struct ResponseHeader {
    /// None until a component decides the outcome
    pub status: Option<u16>,
    pub headers: Headers,
}

impl ResponseHeader {
    pub fn status_line(status: u16) -> String {
        format!(
            "{} {} {}{}",
            constants::HTTP_VERSION,
            status,
            status_phrase(status),
            constants::CRLF
        )
    }

    /// Serialize the status line, every header in insertion order and
    /// the terminating blank line.
    pub fn get_content(&self) -> String {
        let mut out = Self::status_line(self.status.unwrap_or(200));
        for (name, value) in self.headers.iter() {
            let _ = write!(out, "{}{}{}{}", name, constants::HEADER_VALUE_DELIMITER, value, constants::CRLF);
        }
        out.push_str(constants::CRLF);
        out
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.headers.set(constants::headers::CONTENT_LENGTH, length.to_string());
    }

    pub fn set_content_type(&mut self, content_type: &str, charset: Option<&str>) {
        let value = match charset {
            Some(cs) if !cs.is_empty() => format!("{content_type}; charset={cs}"),
            _ => content_type.to_string(),
        };
        self.headers.set(constants::headers::CONTENT_TYPE, value);
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    pub fn clear(&mut self) {
        self.status = None;
        self.headers.clear();
    }
}

/// Buffered body writer with fixed-length / chunked framing.
#[derive(Debug)]
pub struct ResponseStream {
    max_buffer_size: usize,
    max_chunk_size: usize,
    buffer: Vec<u8>,
    chunked: bool,
    send_content: bool,
    stream: Option<TcpStream>,
}

impl ResponseStream {
    pub fn new(max_buffer_size: usize, max_chunk_size: usize) -> Self {
        Self {
            max_buffer_size,
            max_chunk_size,
            buffer: Vec::new(),
            chunked: false,
            send_content: true,
            stream: None,
        }
    }

    pub fn init(&mut self, stream: TcpStream) {
        self.stream = Some(stream);
    }

    pub fn buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Would appending `incoming` bytes trigger a flush?
    pub fn will_be_flushed(&self, incoming: usize) -> bool {
        self.buffer.len() + incoming >= self.max_buffer_size
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub(crate) fn set_chunked_mode(&mut self) {
        self.chunked = true;
    }

    /// Body suppression for HEAD: sizes are still accounted, bytes are
    /// never written.
    pub(crate) fn set_send_content(&mut self, send: bool) {
        self.send_content = send;
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.max_buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Send bytes bypassing the buffer; only valid before chunked mode.
    pub(crate) fn write_directly(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(!self.chunked, "direct writes are not chunk-framed");
        if !self.send_content {
            return Ok(());
        }
        if let Some(stream) = self.stream.as_mut() {
            write_to_socket(stream, data)?;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() || !self.send_content {
            return Ok(());
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };

        if self.chunked {
            let mut pos = 0;
            while pos < self.buffer.len() {
                let chunk_len = self.max_chunk_size.min(self.buffer.len() - pos);
                let head = format!("{chunk_len:x}{}", constants::CRLF);
                write_to_socket(stream, head.as_bytes())?;
                write_to_socket(stream, &self.buffer[pos..pos + chunk_len])?;
                write_to_socket(stream, constants::CRLF_BYTES)?;
                pos += chunk_len;
            }
        } else {
            let data = std::mem::take(&mut self.buffer);
            write_to_socket(stream, &data)?;
            return Ok(());
        }

        self.buffer.clear();
        Ok(())
    }

    /// Terminate chunked framing with the zero-length chunk.
    pub(crate) fn end(&mut self) -> Result<()> {
        if self.chunked && self.send_content {
            if let Some(stream) = self.stream.as_mut() {
                write_to_socket(stream, constants::LAST_CHUNK)?;
            }
        }
        Ok(())
    }
}

/// A response in flight: `Fresh -> HeadersSent -> Finished`.
#[derive(Debug)]
pub struct HttpResponse {
    pub header: ResponseHeader,
    pub stream: ResponseStream,
    headers_sent: bool,
    finished: bool,
    server_name: String,
    method: HttpMethod,
}

impl HttpResponse {
    pub fn new(max_buffer_size: usize, max_chunk_size: usize) -> Self {
        Self {
            header: ResponseHeader::default(),
            stream: ResponseStream::new(max_buffer_size, max_chunk_size),
            headers_sent: false,
            finished: false,
            server_name: String::new(),
            method: HttpMethod::Unknown,
        }
    }

    pub fn init(&mut self, stream: TcpStream) {
        self.stream.init(stream);
    }

    pub fn set_server_name(&mut self, name: &str) {
        self.server_name = name.to_string();
    }

    pub fn set_http_method(&mut self, method: HttpMethod) {
        self.method = method;
        self.stream.set_send_content(method != HttpMethod::Head);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Append body bytes; headers go out first once the buffer is about
    /// to overflow (switching the body to chunked framing).
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(WebstoneError::ResponseAlreadySent);
        }
        if !self.headers_sent && self.stream.will_be_flushed(data.len()) {
            self.send_headers()?;
        }
        self.stream.write(data)
    }

    pub fn write_str(&mut self, data: &str) -> Result<()> {
        self.write(data.as_bytes())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.headers_sent {
            self.send_headers()?;
        }
        self.stream.flush()
    }

    /// Complete the response. A body still fully buffered at this point
    /// is sent fixed-length with an exact `Content-Length`.
    pub fn end(&mut self) -> Result<()> {
        if self.finished {
            return Err(WebstoneError::ResponseAlreadySent);
        }
        if !self.headers_sent {
            self.header.set_content_length(self.stream.buffered_len() as u64);
        }
        self.flush()?;
        self.stream.end()?;

        // nudge the kernel to push the tail out
        if let Some(stream) = self.stream.stream() {
            use std::io::Write;
            let _ = (&mut &*stream).flush();
        }

        self.finished = true;
        Ok(())
    }

    /// One-shot response: requires the `Fresh` state, sends headers with
    /// an exact `Content-Length` and the payload directly, bypassing the
    /// buffer and chunked framing.
    pub fn write_complete_response(&mut self, payload: &str) -> Result<()> {
        if self.headers_sent {
            return Err(WebstoneError::ResponseAlreadySent);
        }
        if self.finished {
            return Err(WebstoneError::ResponseAlreadySent);
        }

        self.header.set_content_length(payload.len() as u64);
        self.send_headers()?;
        self.stream.write_directly(payload.as_bytes())?;
        self.finished = true;
        Ok(())
    }

    /// `write_complete_response` with `Content-Type: text/html`.
    pub fn write_complete_html_response(&mut self, payload: &str) -> Result<()> {
        self.header
            .set_content_type(constants::values::CONTENT_TYPE_TEXT_HTML, None);
        self.write_complete_response(payload)
    }

    fn send_headers(&mut self) -> Result<()> {
        if self.headers_sent {
            return Err(WebstoneError::Application("HTTP headers already sent".into()));
        }

        // no explicit length by now means the body size is unknown
        if !self.header.has_header(constants::headers::CONTENT_LENGTH) {
            self.stream.set_chunked_mode();
            self.header.headers.set(
                constants::headers::TRANSFER_ENCODING,
                constants::values::TRANSFER_ENCODING_CHUNKED,
            );
        }

        if !self.server_name.is_empty() {
            self.header.headers.set(constants::headers::SERVER, self.server_name.clone());
        }
        self.header
            .headers
            .set(constants::headers::DATE, format_date_rfc1123(chrono::Utc::now()));

        let content = self.header.get_content();
        if let Some(stream) = self.stream.stream() {
            let mut stream = stream;
            use std::io::Write;
            stream.write_all(content.as_bytes())?;
        }

        self.headers_sent = true;
        Ok(())
    }
}
