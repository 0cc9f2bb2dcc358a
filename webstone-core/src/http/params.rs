//! Request parameter decoding
//!
//! Query strings, cookies, urlencoded POST bodies and streaming
//! multipart/form-data with on-disk upload spill. The multipart scanner
//! never buffers the whole body: it keeps a rolling window and forwards
//! part content to its sink (a POST parameter or a spill file) as it
//! arrives, holding back just enough bytes to catch a boundary split
//! across reads.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use crate::error::{Result, WebstoneError};
use crate::http::constants::{self, headers, values};
use crate::http::context::HttpContext;
use crate::util::{decode_url, find_sequence, parse_key_value_pairs};

/// One uploaded multipart field.
#[derive(Debug, Clone, Default)]
pub struct UploadedFile {
    /// Logical form field name
    pub name: String,
    /// Original filename sent by the client
    pub file_name: String,
    pub content_type: String,
    pub is_file_data: bool,
    /// Filled by stat-ing the spill file once the upload completes
    pub file_size: u64,
    /// On-disk spill location; empty for parts without a filename
    pub upload_path: PathBuf,
}

impl UploadedFile {
    /// Parse a part header block (`Content-Disposition`, optional
    /// `Content-Type`).
    pub fn load_part_header(header: &str) -> Result<Self> {
        let mut info = UploadedFile::default();

        for line in header.split(constants::CRLF).filter(|l| !l.is_empty()) {
            let pos = line
                .find(':')
                .ok_or_else(|| WebstoneError::request(format!("incorrect part header: {line}")))?;
            let name = &line[..pos];
            let value = line[pos + 1..].trim();

            if name.eq_ignore_ascii_case(headers::CONTENT_DISPOSITION) {
                if !value.starts_with(values::CONTENT_DISPOSITION_FORM_DATA) {
                    return Err(WebstoneError::request(format!(
                        "incorrect Content-Disposition type: {line}"
                    )));
                }
                let pairs = parse_key_value_pairs(value, ';', "\"");
                info.name = pairs
                    .get("name")
                    .cloned()
                    .ok_or_else(|| {
                        WebstoneError::request(format!(
                            "'name' attribute is absent in Content-Disposition header: {line}"
                        ))
                    })?;
                if let Some(file_name) = pairs.get("filename") {
                    info.is_file_data = true;
                    info.file_name = file_name.clone();
                }
            } else if name.eq_ignore_ascii_case(headers::CONTENT_TYPE) {
                info.content_type = value.to_string();
            }
        }

        Ok(info)
    }
}

/// Sink of an in-flight multipart part.
enum PartSink {
    Field(Vec<u8>),
    File(Option<File>),
}

struct OpenPart {
    info: UploadedFile,
    field_name: String,
    sink: PartSink,
}

impl HttpContext {
    /// Decode the query string portion of the request path into
    /// `get_parameters`.
    pub fn parse_query_string_params(&mut self) {
        let path = &self.request_header.path;
        let query = match path.find('?') {
            Some(pos) if pos + 1 < path.len() => &path[pos + 1..],
            _ => return,
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            match pair.find('=') {
                Some(pos) => {
                    self.get_parameters
                        .insert(decode_url(&pair[..pos]), decode_url(&pair[pos + 1..]));
                }
                None => {
                    self.get_parameters.insert(decode_url(pair), String::new());
                }
            }
        }
    }

    /// Decode the `Cookie` header into `cookies`.
    pub fn parse_cookies(&mut self) {
        if !self.request_header.has_header(headers::COOKIE) {
            return;
        }
        let cookie_header = self.request_header.header(headers::COOKIE).to_string();

        for item in cookie_header.split(';').map(str::trim).filter(|i| !i.is_empty()) {
            match item.find('=') {
                Some(pos) => {
                    self.cookies
                        .insert(decode_url(&item[..pos]), decode_url(&item[pos + 1..]));
                }
                None => {
                    self.cookies.insert(decode_url(item), String::new());
                }
            }
        }
    }

    /// Decode the POST body into `post_parameters` (and, for multipart
    /// uploads, `uploaded_files`). Consumes the request body stream.
    pub fn parse_post_params(&mut self) -> Result<()> {
        let content_type = self.request_header.header(headers::CONTENT_TYPE).to_string();

        if content_type
            .to_ascii_lowercase()
            .starts_with(values::CONTENT_TYPE_MULTIPART_FORM_DATA)
        {
            let boundary = content_type
                .find(constants::MULTIPART_BOUNDARY_MARK)
                .map(|pos| content_type[pos + constants::MULTIPART_BOUNDARY_MARK.len()..].to_string())
                .ok_or_else(|| {
                    WebstoneError::request("multipart content type without a boundary")
                })?;
            return self.load_multipart_form_data(&boundary);
        }

        if self.request_header.content_length == 0 {
            return Ok(());
        }

        // streaming key=value machine over the urlencoded body
        let mut buf = vec![0u8; self.read_buffer_size()];
        let mut key: Vec<u8> = Vec::new();
        let mut value: Vec<u8> = Vec::new();
        let mut key_loaded = false;

        loop {
            let n = self.request_stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for &b in &buf[..n] {
                match b {
                    b'&' if !key.is_empty() => {
                        self.insert_post_pair(&key, &value);
                        key.clear();
                        value.clear();
                        key_loaded = false;
                    }
                    b'=' if !key_loaded => key_loaded = true,
                    _ if key_loaded => value.push(b),
                    _ => key.push(b),
                }
            }
        }

        if !key.is_empty() {
            self.insert_post_pair(&key, &value);
        }

        Ok(())
    }

    fn insert_post_pair(&mut self, key: &[u8], value: &[u8]) {
        self.post_parameters.insert(
            decode_url(&String::from_utf8_lossy(key)),
            decode_url(&String::from_utf8_lossy(value)),
        );
    }

    fn read_buffer_size(&self) -> usize {
        let cap = self.response.stream.buffer_size().max(1);
        let len = self.request_header.content_length as usize;
        cap.min(len.max(1))
    }

    /// Streaming multipart/form-data scan.
    ///
    /// The body is `--B CRLF headers CRLFCRLF body CRLF` repeated,
    /// terminated by `--B--`. Part bodies are forwarded to their sink
    /// as they arrive; only the last `len(CRLF--B) - 1` bytes are held
    /// back so a boundary split across reads is still recognized.
    pub fn load_multipart_form_data(&mut self, boundary: &str) -> Result<()> {
        let boundary_begin = format!("{}{}", constants::MULTIPART_BOUNDARY_PREFIX, boundary);
        let boundary_with_break = format!("{}{}", constants::CRLF, boundary_begin);
        let boundary_end = format!("{}{}", boundary_begin, constants::MULTIPART_BOUNDARY_PREFIX);
        // part headers start right after `--B CRLF`
        let header_offset = boundary_begin.len() + constants::CRLF.len();
        let hold_back = boundary_with_break.len() - 1;

        let mut chunk = vec![0u8; self.read_buffer_size()];
        let mut window: Vec<u8> = Vec::new();
        let mut part: Option<OpenPart> = None;
        let mut exhausted = false;

        'scan: loop {
            if !exhausted {
                let n = self.request_stream.read(&mut chunk)?;
                if n == 0 {
                    exhausted = true;
                } else {
                    window.extend_from_slice(&chunk[..n]);
                }
            }

            loop {
                if part.is_none() {
                    // closing boundary ends the scan
                    if window.starts_with(boundary_end.as_bytes()) {
                        self.drain_request_body(&mut chunk)?;
                        break 'scan;
                    }
                    if window.len() < boundary_end.len() && !exhausted {
                        break; // cannot tell the final boundary apart yet
                    }
                    if !window.starts_with(boundary_begin.as_bytes()) {
                        return Err(WebstoneError::request(
                            "multipart body does not start with the boundary",
                        ));
                    }
                    let header_end = match find_sequence(&window, constants::HEADERS_END_MARK) {
                        Some(pos) => pos,
                        None if exhausted => {
                            return Err(WebstoneError::request(
                                "unterminated multipart part header",
                            ));
                        }
                        None => break,
                    };

                    let header_block =
                        String::from_utf8_lossy(&window[header_offset..header_end]).into_owned();
                    let info = UploadedFile::load_part_header(&header_block)?;
                    let field_name = decode_url(&info.name);

                    let sink = if info.is_file_data {
                        PartSink::File(self.open_spill_file(&field_name, &info)?)
                    } else {
                        PartSink::Field(Vec::new())
                    };

                    window.drain(..header_end + constants::HEADERS_END_MARK.len());
                    part = Some(OpenPart { info, field_name, sink });
                    continue;
                }

                match find_sequence(&window, boundary_with_break.as_bytes()) {
                    Some(pos) => {
                        if let Some(open) = part.as_mut() {
                            forward(open, &window[..pos])?;
                        }
                        // drop the CRLF; the boundary stays for the
                        // next round
                        window.drain(..pos + constants::CRLF.len());
                        if let Some(finished) = part.take() {
                            self.close_part(finished)?;
                        }
                    }
                    None if exhausted => {
                        return Err(WebstoneError::request(
                            "multipart part is not terminated by a boundary",
                        ));
                    }
                    None => {
                        if window.len() > hold_back {
                            let forward_len = window.len() - hold_back;
                            if let Some(open) = part.as_mut() {
                                forward(open, &window[..forward_len])?;
                            }
                            window.drain(..forward_len);
                        }
                        break;
                    }
                }
            }

            if exhausted && part.is_none() && window.is_empty() {
                break;
            }
            if exhausted && part.is_none() && !window.starts_with(boundary_end.as_bytes()) {
                // leftover garbage after the last part
                return Err(WebstoneError::request("malformed multipart body tail"));
            }
        }

        self.load_upload_sizes();
        Ok(())
    }

    fn open_spill_file(&mut self, field_name: &str, info: &UploadedFile) -> Result<Option<File>> {
        if info.file_name.is_empty() {
            // a file part without a filename is recorded but not spilled
            self.uploaded_files.insert(field_name.to_string(), info.clone());
            return Ok(None);
        }

        fs::create_dir_all(&self.uploads_dir)?;

        // only the final path component of the client name is honored
        let base_name = PathBuf::from(&info.file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| info.file_name.clone());

        // avoid collisions by prefixing '$' until the name is free
        let mut prefix = String::new();
        let upload_path = loop {
            let candidate = self.uploads_dir.join(format!("{prefix}{base_name}"));
            if !candidate.exists() {
                break candidate;
            }
            prefix.push('$');
        };

        let file = File::create(&upload_path)?;

        let mut recorded = info.clone();
        recorded.upload_path = upload_path;
        self.uploaded_files.insert(field_name.to_string(), recorded);

        Ok(Some(file))
    }

    fn close_part(&mut self, part: OpenPart) -> Result<()> {
        match part.sink {
            PartSink::Field(bytes) => {
                let value = decode_url(&String::from_utf8_lossy(&bytes));
                self.post_parameters
                    .entry(part.field_name)
                    .and_modify(|v| v.push_str(&value))
                    .or_insert(value);
            }
            PartSink::File(file) => {
                if let Some(mut file) = file {
                    file.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Eat whatever body bytes remain so the connection stays usable
    /// for keep-alive.
    fn drain_request_body(&mut self, chunk: &mut [u8]) -> Result<()> {
        while !self.request_stream.is_read() {
            if self.request_stream.read(chunk)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn load_upload_sizes(&mut self) {
        for upload in self.uploaded_files.values_mut() {
            if upload.upload_path.as_os_str().is_empty() {
                continue;
            }
            match fs::metadata(&upload.upload_path) {
                Ok(meta) => upload.file_size = meta.len(),
                Err(e) => log::error!(
                    "uploaded file properties loading failed: {}, file: {}",
                    e,
                    upload.upload_path.display()
                ),
            }
        }
    }
}

fn forward(part: &mut OpenPart, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    match &mut part.sink {
        PartSink::Field(bytes) => bytes.extend_from_slice(data),
        PartSink::File(Some(file)) => file.write_all(data)?,
        PartSink::File(None) => {}
    }
    Ok(())
}
