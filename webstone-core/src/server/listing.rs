//! Directory request handling
//!
//! Default-document redirection first; otherwise a browsable HTML
//! listing rendered from the directory's templates: header, optional
//! parent link, one row per entry (virtual directories, real
//! directories, files, in that order) and a footer with counts.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::http::constants::{self, headers, values};
use crate::http::context::HttpContext;
use crate::http::{messages, HttpMethod};
use crate::server::{
    file, process_error_403, process_error_404, process_error_405, process_error_406,
    process_server_error, resolver, ServerRuntime,
};
use crate::vdir::{DirectoryEntry, DEFAULT_CHARSET};

/// Substitution tokens of the listing templates.
const PAGE_URL_MARK: &str = "{page-url}";
const PARENT_URL_MARK: &str = "{parent-url}";
const URL_MARK: &str = "{url}";
const NAME_MARK: &str = "{name}";
const SIZE_MARK: &str = "{size}";
const TIME_MARK: &str = "{time}";
const FILES_COUNT_MARK: &str = "{files-count}";
const DIRECTORIES_COUNT_MARK: &str = "{directories-count}";
const ERRORS_COUNT_MARK: &str = "{errors-count}";

/// Listing entry kinds; the ordering doubles as the sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ItemKind {
    VirtualDirectory,
    Directory,
    File,
}

#[derive(Debug)]
struct DirectoryItem {
    kind: ItemKind,
    name: String,
    url: String,
    size: Option<u64>,
    modified: Option<SystemTime>,
}

/// Handle a request whose target resolved to a directory.
pub fn process_directory_request(
    runtime: &Arc<ServerRuntime>,
    ctx: &mut HttpContext,
    dir: &DirectoryEntry,
) -> Result<()> {
    // a present default document takes over the request entirely
    for doc in &dir.default_documents {
        let doc_path = ctx.file_system_path.join(doc);
        if !doc_path.exists() {
            continue;
        }

        ctx.file_system_path = doc_path;
        ctx.virtual_path.push_str(doc);
        log::debug!("redirection to \"{}\"", ctx.virtual_path);

        ctx.response
            .header
            .headers
            .set(headers::CONTENT_LOCATION, ctx.virtual_path.clone());

        if resolver::run_handlers(runtime, ctx, dir)? {
            return Ok(());
        }
        return file::process_direct_file_request(runtime, ctx);
    }

    if !dir.browsing_enabled {
        return process_error_403(ctx, messages::ERROR_403_BROWSE_CONTENT);
    }

    if ctx.method != HttpMethod::Get && ctx.method != HttpMethod::Head {
        return process_error_405(ctx, "GET, HEAD");
    }

    if !ctx.file_system_path.exists() {
        return process_error_404(ctx);
    }
    if !ctx.file_system_path.is_dir() {
        log::error!(
            "file path retrieved instead of directory: \"{}\"",
            ctx.file_system_path.display()
        );
        return process_server_error(ctx, 500, messages::SERVER_ERROR_FILE_INSTEAD_DIRECTORY);
    }

    // the client must accept the directory's charset
    if ctx.request_header.has_header(headers::ACCEPT_CHARSET) {
        let accepted = ctx.request_header.header(headers::ACCEPT_CHARSET);
        let charset_ok = accepted.contains(constants::ANY_CHARSET_MARK)
            || contains_ignore_case(accepted, &dir.charset)
            || dir.charset.eq_ignore_ascii_case(DEFAULT_CHARSET);
        if !charset_ok {
            log::error!("charset \"{}\" is not allowed in \"{}\"", dir.charset, accepted);
            return process_error_406(ctx, messages::ERROR_406_CHARSET_NOT_ALLOWED);
        }
    }

    render_listing(runtime, ctx, dir)
}

fn render_listing(
    runtime: &Arc<ServerRuntime>,
    ctx: &mut HttpContext,
    dir: &DirectoryEntry,
) -> Result<()> {
    ctx.response.header.status = Some(200);
    ctx.response
        .header
        .set_content_type(values::CONTENT_TYPE_TEXT_HTML, Some(&dir.charset));

    let header = dir.header_template.replace(PAGE_URL_MARK, &ctx.virtual_path);
    ctx.response.write_str(&header)?;

    if ctx.virtual_path != constants::SLASH {
        let parent_url = parent_directory_url(&ctx.virtual_path);
        let record = dir.parent_directory_template.replace(PARENT_URL_MARK, &parent_url);
        ctx.response.write_str(&record)?;
    }

    let mut items = Vec::new();

    // linked children appear as virtual directories of their parent
    let tree = runtime.tree();
    for entry in tree.iter() {
        if entry.is_linked_directory
            && entry.parent_name == dir.name
            && ctx.virtual_path == dir.virtual_path
        {
            items.push(DirectoryItem {
                kind: ItemKind::VirtualDirectory,
                name: entry.relative_path.clone(),
                url: entry.virtual_path.clone(),
                size: None,
                modified: std::fs::metadata(&entry.real_path)
                    .and_then(|m| m.modified())
                    .ok(),
            });
        }
    }

    let mut error_count = 0usize;
    read_directory_content(&ctx.file_system_path, &ctx.virtual_path, &mut items, &mut error_count);

    items.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));

    let mut file_count = 0usize;
    let mut dir_count = 0usize;
    for item in &items {
        let template = match item.kind {
            ItemKind::VirtualDirectory => &dir.virtual_directory_template,
            ItemKind::Directory => {
                dir_count += 1;
                &dir.directory_template
            }
            ItemKind::File => {
                file_count += 1;
                &dir.file_template
            }
        };
        let record = format_item_record(template, item);
        ctx.response.write_str(&record)?;
    }

    let footer = dir
        .footer_template
        .replace(PAGE_URL_MARK, &ctx.virtual_path)
        .replace(FILES_COUNT_MARK, &file_count.to_string())
        .replace(DIRECTORIES_COUNT_MARK, &dir_count.to_string())
        .replace(ERRORS_COUNT_MARK, &error_count.to_string());
    ctx.response.write_str(&footer)?;

    ctx.response.end()
}

/// Virtual path with the last non-terminal segment removed. `..`
/// segments are deliberately not normalized; this only feeds the
/// parent link of a listing.
fn parent_directory_url(virtual_path: &str) -> String {
    let trimmed = &virtual_path[..virtual_path.len().saturating_sub(1)];
    match trimmed.rfind('/') {
        Some(pos) => virtual_path[..pos + 1].to_string(),
        None => constants::SLASH.to_string(),
    }
}

fn read_directory_content(
    dir_path: &Path,
    dir_virtual_path: &str,
    items: &mut Vec<DirectoryItem>,
    error_count: &mut usize,
) {
    let entries = match std::fs::read_dir(dir_path) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("directory \"{}\" content loading failed: {}", dir_path.display(), e);
            *error_count += 1;
            return;
        }
    };

    for entry in entries {
        let item = entry.map_err(Into::into).and_then(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata()?;
            let modified = meta.modified().ok();
            Ok::<DirectoryItem, std::io::Error>(if meta.is_dir() {
                DirectoryItem {
                    kind: ItemKind::Directory,
                    url: format!("{dir_virtual_path}{name}/"),
                    name,
                    size: None,
                    modified,
                }
            } else {
                DirectoryItem {
                    kind: ItemKind::File,
                    url: format!("{dir_virtual_path}{name}"),
                    size: Some(meta.len()),
                    name,
                    modified,
                }
            })
        });

        match item {
            Ok(item) => items.push(item),
            Err(e) => {
                log::error!(
                    "entry loading failed in directory \"{}\": {}",
                    dir_virtual_path,
                    e
                );
                *error_count += 1;
            }
        }
    }
}

fn format_item_record(template: &str, item: &DirectoryItem) -> String {
    let mut record = template.replace(URL_MARK, &item.url).replace(NAME_MARK, &item.name);
    if let Some(size) = item.size {
        record = record.replace(SIZE_MARK, &size.to_string());
    }
    if let Some(modified) = item.modified {
        record = record.replace(TIME_MARK, &format_listing_time(modified));
    }
    record
}

fn format_listing_time(time: SystemTime) -> String {
    let time: DateTime<Utc> = time.into();
    time.format("%d.%m.%Y %H:%M:%S").to_string()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}
