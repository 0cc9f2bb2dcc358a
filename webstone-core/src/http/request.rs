//! Request header parsing and the bounded body stream

use std::io::Read;
use std::net::TcpStream;

use crate::error::{Result, WebstoneError};
use crate::http::{constants, Headers};

/// Parsed request line and header block.
///
/// `Content-Length` is promoted into the numeric field and never stored
/// in the generic header map.
#[derive(Debug, Default)]
pub struct RequestHeader {
    pub method: String,
    /// Path as received, including any query string
    pub path: String,
    pub version_high: u32,
    pub version_low: u32,
    pub content_length: u64,
    pub headers: Headers,
}

impl RequestHeader {
    /// Parse a complete header block (request line + headers). The
    /// trailing CRLFCRLF may or may not be present; empty lines are
    /// skipped.
    pub fn parse(block: &str) -> Result<Self> {
        let mut lines = block.split(constants::CRLF).filter(|l| !l.is_empty());

        let request_line = lines
            .next()
            .ok_or_else(|| WebstoneError::request("empty request header"))?;

        let mut header = RequestHeader::default();
        header.parse_request_line(request_line)?;

        for line in lines {
            let pos = line.find(':').ok_or_else(|| {
                WebstoneError::request(format!("incorrect request header: {line}"))
            })?;
            let name = &line[..pos];
            let value = line[pos + 1..].trim();
            header.load_header(name, value)?;
        }

        Ok(header)
    }

    fn parse_request_line(&mut self, line: &str) -> Result<()> {
        let mut parts = line.split_ascii_whitespace();
        let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v)) => (m, p, v),
            _ => {
                return Err(WebstoneError::request(format!("incorrect request line: {line}")));
            }
        };

        self.method = method.to_string();
        self.path = path.to_string();

        let version = version.strip_prefix("HTTP/").unwrap_or(version);
        match version.split_once('.') {
            Some((high, low)) => {
                self.version_high = parse_version_part(high, line)?;
                self.version_low = parse_version_part(low, line)?;
            }
            None => {
                self.version_high = parse_version_part(version, line)?;
                self.version_low = 0;
            }
        }

        Ok(())
    }

    fn load_header(&mut self, name: &str, value: &str) -> Result<()> {
        if name.eq_ignore_ascii_case(constants::headers::CONTENT_LENGTH) {
            self.content_length = value.parse().map_err(|_| {
                WebstoneError::request(format!("incorrect Content-Length value: {value}"))
            })?;
        } else {
            self.headers.set(name, value);
        }
        Ok(())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// Header value, or the empty string when absent.
    pub fn header(&self, name: &str) -> &str {
        self.headers.get(name).unwrap_or("")
    }
}

fn parse_version_part(part: &str, line: &str) -> Result<u32> {
    part.parse()
        .map_err(|_| WebstoneError::request(format!("incorrect HTTP version: {line}")))
}

/// Fixed-length request body reader.
///
/// Bytes over-read during header parsing are drained first, then the
/// socket, capped so the total never exceeds the declared
/// content-length.
#[derive(Debug, Default)]
pub struct RequestBodyStream {
    content_length: u64,
    consumed: u64,
    prefix: Vec<u8>,
    prefix_pos: usize,
    stream: Option<TcpStream>,
}

impl RequestBodyStream {
    pub fn init(&mut self, prefix: Vec<u8>, content_length: u64, stream: Option<TcpStream>) {
        self.content_length = content_length;
        self.consumed = 0;
        self.prefix_pos = 0;
        self.stream = stream;
        self.prefix = if content_length > 0 { prefix } else { Vec::new() };
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// True while over-read bytes remain un-consumed.
    pub fn has_buffered_content(&self) -> bool {
        self.prefix_pos < self.prefix.len()
    }

    /// True once the whole declared body has been returned.
    pub fn is_read(&self) -> bool {
        self.consumed == self.content_length
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Read the next slice of the body; 0 means the body is complete.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.content_length == 0 || buf.is_empty() {
            return Ok(0);
        }

        // over-read remainder from header parsing goes out first
        if self.has_buffered_content() {
            let available = &self.prefix[self.prefix_pos..];
            let take = available.len().min(buf.len());
            let take = take.min((self.content_length - self.consumed) as usize);
            buf[..take].copy_from_slice(&available[..take]);
            self.prefix_pos += take;
            self.consumed += take as u64;
            return Ok(take);
        }

        if self.consumed == self.content_length {
            return Ok(0);
        }

        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(0),
        };

        let cap = buf.len().min((self.content_length - self.consumed) as usize);
        let n = stream.read(&mut buf[..cap])?;
        self.consumed += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let header = RequestHeader::parse("GET /users?page=1 HTTP/1.1\r\n").unwrap();
        assert_eq!(header.method, "GET");
        assert_eq!(header.path, "/users?page=1");
        assert_eq!((header.version_high, header.version_low), (1, 1));
    }

    #[test]
    fn test_parse_version_without_minor() {
        let header = RequestHeader::parse("GET / HTTP/1\r\n").unwrap();
        assert_eq!((header.version_high, header.version_low), (1, 0));
    }

    #[test]
    fn test_parse_headers_and_content_length() {
        let block = "POST /submit HTTP/1.1\r\nHost: localhost\r\nContent-Length: 42\r\nX-Custom: a: b\r\n\r\n";
        let header = RequestHeader::parse(block).unwrap();

        assert_eq!(header.content_length, 42);
        // promoted out of the generic map
        assert!(!header.has_header("Content-Length"));
        assert_eq!(header.header("host"), "localhost");
        // value may itself contain a colon
        assert_eq!(header.header("x-custom"), "a: b");
    }

    #[test]
    fn test_header_spelling_preserved_lookup_insensitive() {
        let header = RequestHeader::parse("GET / HTTP/1.1\r\nUsEr-AgEnT: test\r\n").unwrap();
        assert_eq!(header.header("user-agent"), "test");
        let names: Vec<&str> = header.headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["UsEr-AgEnT"]);
    }

    #[test]
    fn test_malformed_header_line_fails() {
        let result = RequestHeader::parse("GET / HTTP/1.1\r\nBadHeaderNoColon\r\n");
        assert!(matches!(result, Err(WebstoneError::RequestProcessing(_))));
    }

    #[test]
    fn test_reparse_roundtrip() {
        let block = "GET / HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n";
        let first = RequestHeader::parse(block).unwrap();

        let mut serialized = format!(
            "{} {} HTTP/{}.{}\r\n",
            first.method, first.path, first.version_high, first.version_low
        );
        for (name, value) in first.headers.iter() {
            serialized.push_str(&format!("{name}: {value}\r\n"));
        }
        let second = RequestHeader::parse(&serialized).unwrap();

        assert_eq!(second.header("Host"), first.header("Host"));
        assert_eq!(second.header("Accept"), first.header("Accept"));
        assert_eq!(second.headers.len(), first.headers.len());
    }

    #[test]
    fn test_body_stream_prefix_then_done() {
        let mut body = RequestBodyStream::default();
        body.init(b"hello".to_vec(), 5, None);

        let mut buf = [0u8; 3];
        assert_eq!(body.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert!(!body.is_read());

        assert_eq!(body.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert!(body.is_read());
        assert_eq!(body.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_body_stream_never_exceeds_content_length() {
        let mut body = RequestBodyStream::default();
        // prefix longer than the declared body
        body.init(b"abcdef".to_vec(), 4, None);

        let mut buf = [0u8; 16];
        let n = body.read(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert!(body.is_read());
        assert_eq!(body.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_body_stream_zero_content_length() {
        let mut body = RequestBodyStream::default();
        body.init(b"ignored".to_vec(), 0, None);
        let mut buf = [0u8; 8];
        assert_eq!(body.read(&mut buf).unwrap(), 0);
        assert!(body.is_read());
        assert!(!body.has_buffered_content());
    }

    #[test]
    fn test_body_stream_reads_socket_after_prefix() {
        use crate::net::test_support::socket_pair;
        use std::io::Write;

        let (mut client, server) = socket_pair();
        client.write_all(b" world").unwrap();

        let mut body = RequestBodyStream::default();
        body.init(b"hello".to_vec(), 11, Some(server));

        let mut collected = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = body.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"hello world");
        assert!(body.is_read());
    }
}
