//! Conditional file serving
//!
//! GET/HEAD only. The ETag is a stable digest over the absolute path
//! and the last-write time, so a changed file invalidates the client
//! cache without reading the content. Bodies are streamed through the
//! response buffer in buffer-sized slices.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::http::constants::headers;
use crate::http::context::HttpContext;
use crate::http::{format_date_rfc1123, messages, HttpMethod};
use crate::server::{process_error_403, process_error_405, resolver, ServerRuntime};

/// Serve the regular file the resolver settled on.
pub fn process_direct_file_request(
    runtime: &Arc<ServerRuntime>,
    ctx: &mut HttpContext,
) -> Result<()> {
    if ctx.method != HttpMethod::Get && ctx.method != HttpMethod::Head {
        return process_error_405(ctx, "GET, HEAD");
    }

    let mut file = match File::open(&ctx.file_system_path) {
        Ok(file) => file,
        // existence was checked by the resolver; an open failure here
        // is a permission problem
        Err(_) => return process_error_403(ctx, messages::ERROR_403_ACCESS_DENIED),
    };

    let meta = file.metadata()?;
    let file_size = meta.len();
    let modified = meta.modified().unwrap_or(UNIX_EPOCH);
    let etag = calculate_file_etag(&ctx.file_system_path, modified);

    if ctx.request_header.has_header(headers::IF_NONE_MATCH)
        && ctx.request_header.header(headers::IF_NONE_MATCH) == etag
    {
        ctx.response.header.status = Some(304);
        ctx.response.header.set_content_length(0);
        ctx.response.header.headers.set(headers::ETAG, etag);
        return Ok(());
    }

    log::debug!("send file: {}", ctx.file_system_path.display());

    ctx.response.header.status = Some(200);
    ctx.response.header.set_content_length(file_size);
    let content_type = runtime.mime_type(&resolver::target_extension(&ctx.file_system_path));
    ctx.response.header.set_content_type(&content_type, None);
    ctx.response.header.headers.set(headers::ETAG, etag);
    ctx.response
        .header
        .headers
        .set(headers::LAST_MODIFIED, format_date_rfc1123(modified.into()));

    let buffer_size = (file_size as usize).min(ctx.response.stream.buffer_size()).max(1);
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        ctx.response.write(&buffer[..n])?;
    }

    Ok(())
}

/// Stable hash of `(absolute path, last-write time)`.
pub fn calculate_file_etag(path: &Path, modified: SystemTime) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let seconds = modified.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    hasher.update(seconds.to_le_bytes());

    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_etag_is_stable() {
        let t = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let a = calculate_file_etag(Path::new("/www/a.txt"), t);
        let b = calculate_file_etag(Path::new("/www/a.txt"), t);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_etag_changes_with_path_and_time() {
        let t = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let base = calculate_file_etag(Path::new("/www/a.txt"), t);
        assert_ne!(base, calculate_file_etag(Path::new("/www/b.txt"), t));
        assert_ne!(
            base,
            calculate_file_etag(Path::new("/www/a.txt"), t + Duration::from_secs(1))
        );
    }
}
