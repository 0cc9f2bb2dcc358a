//! URL-to-resource resolution
//!
//! Walks the virtual directory tree for the nearest configured
//! ancestor, applies its URL mapping rules against the original
//! relative path, computes the filesystem target, dispatches extension
//! handlers and finally decides between file serving, directory
//! handling, trailing-slash redirects and 404.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;

use crate::error::Result;
use crate::http::constants;
use crate::http::context::HttpContext;
use crate::server::{
    listing, process_error_404, redirect_request, strip_query, ServerRuntime,
};
use crate::util::decode_url;
use crate::vdir::DirectoryEntry;

/// Resolve the request target.
///
/// Returns `Ok(true)` when the target is a regular file the caller
/// should serve; `Ok(false)` when the request was fully answered here
/// (handler, listing, redirect or error).
pub fn find_target(runtime: &Arc<ServerRuntime>, ctx: &mut HttpContext) -> Result<bool> {
    let tree = runtime.tree();

    if tree.root().is_none() {
        log::error!("root web directory (\"/\") is not registered");
        process_error_404(ctx)?;
        return Ok(false);
    }
    let parent = tree
        .nearest_ancestor(&ctx.virtual_path)
        .expect("tree has a root")
        .clone();

    apply_mappings(ctx, &parent);

    // filesystem target: the directory itself, or the decoded suffix
    // joined under its real path
    if ctx.mapped_virtual_path == parent.virtual_path {
        ctx.file_system_path = parent.real_path.clone();
    } else {
        let suffix = decode_url(&ctx.mapped_virtual_path[parent.virtual_path.len()..]);
        if suffix.split('/').any(|seg| seg == "..") {
            process_error_404(ctx)?;
            return Ok(false);
        }
        ctx.file_system_path = parent.real_path.join(suffix);
    }

    if run_handlers(runtime, ctx, &parent)? {
        return Ok(false); // fully served by a handler
    }

    if ctx.file_system_path.is_dir() {
        if ctx.virtual_path == ctx.mapped_virtual_path {
            if ctx.virtual_path.ends_with(constants::SLASH) {
                listing::process_directory_request(runtime, ctx, &parent)?;
            } else {
                let location = format!("{}{}", ctx.virtual_path, constants::SLASH);
                redirect_request(ctx, &location, 302)?;
            }
        } else {
            listing::process_directory_request(runtime, ctx, &parent)?;
        }
        return Ok(false);
    }

    // a linked directory addressed without its trailing slash
    let slashed = format!("{}{}", ctx.virtual_path, constants::SLASH);
    let is_linked_dir = tree
        .iter()
        .any(|entry| entry.is_linked_directory && entry.virtual_path == slashed);
    if is_linked_dir {
        redirect_request(ctx, &slashed, 302)?;
        return Ok(false);
    }

    if !ctx.file_system_path.exists() {
        process_error_404(ctx)?;
        return Ok(false);
    }

    Ok(true)
}

/// Run the directory's mapping rules in order. Every rule is tried
/// against the request's original relative path - one rule's rewrite
/// never feeds another rule's match, so when several rules match the
/// last one wins.
fn apply_mappings(ctx: &mut HttpContext, parent: &DirectoryEntry) {
    if parent.mappings.is_empty() {
        return;
    }

    let relative = ctx.virtual_path[parent.virtual_path.len()..].to_string();

    for (regex, template) in &parent.mappings {
        let Some(caps) = full_match(regex, &relative) else {
            continue;
        };

        let mut target = template.clone();
        for i in 1..caps.len() {
            let value = caps.get(i).map(|m| m.as_str()).unwrap_or("");
            target = target.replace(&format!("{{{}}}", i - 1), value);
        }

        ctx.request_header.path = format!("{}{}", parent.virtual_path, target);
        ctx.mapped_virtual_path = strip_query(&ctx.request_header.path);
    }
}

/// Anchored match over the whole relative path.
fn full_match<'a>(regex: &Regex, input: &'a str) -> Option<regex::Captures<'a>> {
    let caps = regex.captures(input)?;
    let whole = caps.get(0)?;
    (whole.start() == 0 && whole.end() == input.len()).then_some(caps)
}

/// Dispatch the directory's extension handlers against the current
/// target, in registration order; the first handler returning `true`
/// ends the resolution.
pub(crate) fn run_handlers(
    runtime: &Arc<ServerRuntime>,
    ctx: &mut HttpContext,
    dir: &DirectoryEntry,
) -> Result<bool> {
    if dir.handlers.is_empty() {
        return Ok(false);
    }

    let extension = target_extension(&ctx.file_system_path);
    log::debug!(
        "run handlers for \"{}\", directory: \"{}\"",
        ctx.file_system_path.display(),
        dir.name
    );

    for (ext, handler_name) in &dir.handlers {
        let ext = ext.trim_start_matches('.');
        if ext != constants::ALL_EXTENSIONS_MARK && !ext.eq_ignore_ascii_case(&extension) {
            continue;
        }
        match runtime.handler(handler_name) {
            Some(handler) => {
                if handler.handle(ctx)? {
                    return Ok(true);
                }
            }
            None => log::warn!("handler \"{}\" is not registered", handler_name),
        }
    }

    Ok(false)
}

pub(crate) fn target_extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DirectoryConfig, ListingTemplates, MappingRule};
    use crate::http::context::{ContextConfig, HttpContext};
    use crate::http::request::RequestHeader;
    use crate::net::test_support::socket_pair;
    use crate::net::ClientConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn runtime_with(
        root: &Path,
        mappings: Vec<MappingRule>,
        handlers: Vec<crate::config::HandlerBinding>,
    ) -> Arc<ServerRuntime> {
        let mut config = Config::default();
        config.finish();
        config.directories.push(DirectoryConfig {
            name: "root".into(),
            parent: None,
            virtual_path: None,
            path: Some(root.to_path_buf()),
            relative_path: None,
            browsing_enabled: Some(true),
            charset: None,
            default_documents: Vec::new(),
            handlers,
            mappings,
            templates: ListingTemplates::default(),
        });
        Arc::new(ServerRuntime::new(config).unwrap())
    }

    fn context(path: &str) -> (HttpContext, std::net::TcpStream) {
        let (remote, local) = socket_pair();
        let peer = local.peer_addr().unwrap();
        let client = ClientConnection { stream: local, ip: peer.ip(), port: peer.port() };
        let config = ContextConfig {
            response_buffer_size: 4096,
            max_chunk_size: 64,
            server_version: "webstone/test".into(),
            uploads_dir: std::env::temp_dir(),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        };
        let mut ctx = HttpContext::new(&client, &config).unwrap();
        ctx.request_header =
            RequestHeader::parse(&format!("GET {path} HTTP/1.1\r\n")).unwrap();
        ctx.virtual_path = crate::server::strip_query(path);
        ctx.mapped_virtual_path = ctx.virtual_path.clone();
        ctx.method = crate::http::HttpMethod::Get;
        (ctx, remote)
    }

    #[test]
    fn test_mappings_match_original_path_only() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            dir.path(),
            vec![
                MappingRule { regex: "^old/(.*)$".into(), url: "mid/{0}".into() },
                MappingRule { regex: "^mid/(.*)$".into(), url: "new/{0}".into() },
            ],
            Vec::new(),
        );
        let (mut ctx, _remote) = context("/old/page.html");

        let tree = runtime.tree();
        let parent = tree.nearest_ancestor("/old/page.html").unwrap().clone();
        apply_mappings(&mut ctx, &parent);

        // the second rule never sees the first rule's rewrite
        assert_eq!(ctx.mapped_virtual_path, "/mid/page.html");
        assert_eq!(ctx.request_header.path, "/mid/page.html");
    }

    #[test]
    fn test_last_matching_rule_wins() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            dir.path(),
            vec![
                MappingRule { regex: "^old/(.*)$".into(), url: "first/{0}".into() },
                MappingRule { regex: "^old/page\\.html$".into(), url: "second/page.html".into() },
            ],
            Vec::new(),
        );
        let (mut ctx, _remote) = context("/old/page.html");

        let tree = runtime.tree();
        let parent = tree.nearest_ancestor("/old/page.html").unwrap().clone();
        apply_mappings(&mut ctx, &parent);

        assert_eq!(ctx.mapped_virtual_path, "/second/page.html");
    }

    #[test]
    fn test_mapping_strips_query_from_mapped_path() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            dir.path(),
            vec![MappingRule { regex: "^page/(\\d+)$".into(), url: "view.html?id={0}".into() }],
            Vec::new(),
        );
        let (mut ctx, _remote) = context("/page/7");

        let tree = runtime.tree();
        let parent = tree.nearest_ancestor("/page/7").unwrap().clone();
        apply_mappings(&mut ctx, &parent);

        assert_eq!(ctx.request_header.path, "/view.html?id=7");
        assert_eq!(ctx.mapped_virtual_path, "/view.html");
    }

    #[test]
    fn test_unmatched_group_substitutes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            dir.path(),
            vec![MappingRule { regex: "^a(?:/(x))?/b$".into(), url: "t/{0}".into() }],
            Vec::new(),
        );
        let (mut ctx, _remote) = context("/a/b");

        let tree = runtime.tree();
        let parent = tree.nearest_ancestor("/a/b").unwrap().clone();
        apply_mappings(&mut ctx, &parent);

        assert_eq!(ctx.mapped_virtual_path, "/t/");
    }

    #[test]
    fn test_find_target_serves_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();
        let runtime = runtime_with(dir.path(), Vec::new(), Vec::new());
        let (mut ctx, _remote) = context("/hello.txt");

        assert!(find_target(&runtime, &mut ctx).unwrap());
        assert_eq!(ctx.file_system_path, dir.path().join("hello.txt"));
    }

    #[test]
    fn test_find_target_missing_file_responds_404() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(dir.path(), Vec::new(), Vec::new());
        let (mut ctx, _remote) = context("/missing.txt");

        assert!(!find_target(&runtime, &mut ctx).unwrap());
        assert_eq!(ctx.response.header.status, Some(404));
    }

    #[test]
    fn test_find_target_redirects_directory_without_slash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        let runtime = runtime_with(dir.path(), Vec::new(), Vec::new());
        let (mut ctx, _remote) = context("/docs");

        assert!(!find_target(&runtime, &mut ctx).unwrap());
        assert_eq!(ctx.response.header.status, Some(302));
        assert_eq!(ctx.response.header.headers.get("Location"), Some("/docs/"));
    }

    #[test]
    fn test_find_target_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(dir.path(), Vec::new(), Vec::new());
        let (mut ctx, _remote) = context("/%2e%2e/secret.txt");

        assert!(!find_target(&runtime, &mut ctx).unwrap());
        assert_eq!(ctx.response.header.status, Some(404));
    }

    struct CountingHandler {
        calls: AtomicUsize,
        serve: bool,
    }

    impl crate::server::Handler for CountingHandler {
        fn handle(&self, ctx: &mut HttpContext) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.serve {
                ctx.response.header.status = Some(200);
                ctx.response.write_complete_html_response("handled")?;
            }
            Ok(self.serve)
        }
    }

    #[test]
    fn test_wildcard_handler_serves_request() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with(
            dir.path(),
            Vec::new(),
            vec![crate::config::HandlerBinding { ext: "*".into(), handler: "all".into() }],
        );
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), serve: true });
        runtime.register_handler("all", handler.clone());

        let (mut ctx, _remote) = context("/anything.xyz");
        assert!(!find_target(&runtime, &mut ctx).unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(ctx.response.is_finished());
    }

    #[test]
    fn test_declining_handler_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.py"), b"print").unwrap();
        let runtime = runtime_with(
            dir.path(),
            Vec::new(),
            vec![crate::config::HandlerBinding { ext: "py".into(), handler: "py".into() }],
        );
        let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0), serve: false });
        runtime.register_handler("py", handler.clone());

        let (mut ctx, _remote) = context("/page.py");
        // handler declined, so the file itself is served
        assert!(find_target(&runtime, &mut ctx).unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_target_extension() {
        assert_eq!(target_extension(Path::new("/a/b/file.TXT")), "txt");
        assert_eq!(target_extension(Path::new("/a/b/noext")), "");
    }
}
