//! HTTP/1.1 engine
//!
//! - [`request`] - header parsing and the bounded request body stream
//! - [`response`] - header serialization and the buffered response
//!   stream with automatic fixed-length / chunked framing
//! - [`params`] - query string, cookie, urlencoded and multipart
//!   decoding with upload spill files
//! - [`context`] - the per-request composition object
//! - [`messages`] - HTML error page fragments

pub mod context;
pub mod messages;
pub mod params;
pub mod request;
pub mod response;

/// Method classification after the 501 gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Unknown,
    Get,
    Post,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Unknown => "UNKNOWN",
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
        }
    }
}

/// Header collection preserving the received spelling and insertion
/// order; lookups are case-insensitive and duplicate names overwrite.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => self.entries[i] = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// Reason phrase for a status code; anything outside the table is
/// "Undefined".
pub fn status_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        306 => "(Unused)",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Undefined",
    }
}

/// `<code> <phrase>`, as used in status lines and error page titles.
pub fn status_description(status: u16) -> String {
    format!("{} {}", status, status_phrase(status))
}

/// Protocol constants.
pub mod constants {
    pub const HTTP_VERSION: &str = "HTTP/1.1";
    pub const CRLF: &str = "\r\n";
    pub const CRLF_BYTES: &[u8] = b"\r\n";
    pub const HEADERS_END_MARK: &[u8] = b"\r\n\r\n";
    pub const HEADER_VALUE_DELIMITER: &str = ": ";
    pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

    pub const SLASH: &str = "/";

    pub const DEFAULT_CONTENT_CHARSET: &str = "ISO-8859-1";
    pub const ANY_CHARSET_MARK: &str = "*";
    pub const MULTIPART_BOUNDARY_MARK: &str = "boundary=";
    pub const MULTIPART_BOUNDARY_PREFIX: &str = "--";
    pub const ALL_EXTENSIONS_MARK: &str = "*";

    pub mod headers {
        pub const ACCEPT_CHARSET: &str = "Accept-Charset";
        pub const ALLOW: &str = "Allow";
        pub const CONNECTION: &str = "Connection";
        pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
        pub const CONTENT_LENGTH: &str = "Content-Length";
        pub const CONTENT_LOCATION: &str = "Content-Location";
        pub const CONTENT_TYPE: &str = "Content-Type";
        pub const COOKIE: &str = "Cookie";
        pub const DATE: &str = "Date";
        pub const ETAG: &str = "ETag";
        pub const IF_NONE_MATCH: &str = "If-None-Match";
        pub const LAST_MODIFIED: &str = "Last-Modified";
        pub const LOCATION: &str = "Location";
        pub const PROXY_CONNECTION: &str = "Proxy-Connection";
        pub const SERVER: &str = "Server";
        pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    }

    pub mod values {
        pub const CONNECTION_KEEP_ALIVE: &str = "Keep-Alive";
        pub const CONNECTION_CLOSE: &str = "Close";
        pub const TRANSFER_ENCODING_CHUNKED: &str = "chunked";
        pub const CONTENT_TYPE_TEXT_HTML: &str = "text/html";
        pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
        pub const CONTENT_TYPE_MULTIPART_FORM_DATA: &str = "multipart/form-data";
        pub const CONTENT_DISPOSITION_FORM_DATA: &str = "form-data";
    }
}

/// RFC 1123 date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_date_rfc1123(time: chrono::DateTime<chrono::Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn test_headers_duplicate_overwrites() {
        let mut headers = Headers::new();
        headers.set("Host", "a");
        headers.set("host", "b");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Host"), Some("b"));
    }

    #[test]
    fn test_headers_preserve_insertion_order() {
        let mut headers = Headers::new();
        headers.set("B", "2");
        headers.set("A", "1");
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn test_status_phrases() {
        assert_eq!(status_phrase(200), "OK");
        assert_eq!(status_phrase(304), "Not Modified");
        assert_eq!(status_phrase(406), "Not Acceptable");
        assert_eq!(status_phrase(505), "HTTP Version Not Supported");
        assert_eq!(status_phrase(599), "Undefined");
    }

    #[test]
    fn test_format_date_rfc1123() {
        let time = chrono::Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(format_date_rfc1123(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
