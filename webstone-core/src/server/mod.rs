//! HTTP connection processing
//!
//! [`ServerRuntime`] owns the configuration, the directory tree and the
//! handler registry; it is shared by `Arc` between the acceptor, the
//! workers and the control channel - no process-wide mutable state.
//! [`HttpConnectionHandler`] is the worker entry point: it drives the
//! keep-alive request loop and converts errors into HTTP responses at
//! the worker boundary.

pub mod control;
pub mod file;
pub mod listing;
pub mod resolver;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Result, WebstoneError};
use crate::http::constants::{self, headers, values};
use crate::http::context::{ContextConfig, HttpContext};
use crate::http::response::ResponseHeader;
use crate::http::{messages, HttpMethod};
use crate::net::{write_to_socket, ClientConnection, ConnectionHandler};
use crate::vdir::DirectoryTree;

/// An extension handler: returns `Ok(true)` when it fully produced the
/// response (including `end()`), `Ok(false)` to let resolution
/// continue.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: &mut HttpContext) -> Result<bool>;
}

/// Shared server state: settings, directory tree, handler registry and
/// the served-request counter.
pub struct ServerRuntime {
    pub config: Config,
    context_config: ContextConfig,
    tree: RwLock<Arc<DirectoryTree>>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    pub requests_count: AtomicU64,
}

impl ServerRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let tree = DirectoryTree::build(&config.directories)?;
        let context_config = ContextConfig::from(&config);
        Ok(Self {
            config,
            context_config,
            tree: RwLock::new(Arc::new(tree)),
            handlers: RwLock::new(HashMap::new()),
            requests_count: AtomicU64::new(0),
        })
    }

    pub fn tree(&self) -> Arc<DirectoryTree> {
        self.tree.read().unwrap().clone()
    }

    /// Swap in a freshly built tree; callers drain in-flight requests
    /// first (`stop(wait=true)` / reload / `start()`).
    pub fn replace_tree(&self, tree: DirectoryTree) {
        *self.tree.write().unwrap() = Arc::new(tree);
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.write().unwrap().insert(name.into(), handler);
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().unwrap().get(name).cloned()
    }

    pub fn mime_type(&self, ext: &str) -> String {
        self.config.mime_type(ext).to_string()
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.config.http.keep_alive_timeout)
    }
}

/// Worker entry point for the HTTP port.
pub struct HttpConnectionHandler {
    runtime: Arc<ServerRuntime>,
}

impl HttpConnectionHandler {
    pub fn new(runtime: Arc<ServerRuntime>) -> Self {
        Self { runtime }
    }
}

impl ConnectionHandler for HttpConnectionHandler {
    fn handle(&self, client: ClientConnection) {
        process_connection(&self.runtime, client);
    }

    /// Canned 503 written straight to the socket when no worker could
    /// be spawned for the connection.
    fn on_worker_spawn_error(&self, client: &mut ClientConnection) {
        let content = messages::error_page(503, messages::ERROR_503_OVERLOADED);
        let mut response = ResponseHeader::status_line(503);
        response.push_str(&format!(
            "{}: {}{}",
            headers::CONTENT_TYPE,
            values::CONTENT_TYPE_TEXT_HTML,
            constants::CRLF
        ));
        response.push_str(&format!(
            "{}: {}{}",
            headers::CONTENT_LENGTH,
            content.len(),
            constants::CRLF
        ));
        response.push_str(&format!(
            "{}: {}{}",
            headers::SERVER,
            self.runtime.config.http.server_version,
            constants::CRLF
        ));
        response.push_str(constants::CRLF);
        response.push_str(&content);

        if let Err(e) = write_to_socket(&mut client.stream, response.as_bytes()) {
            log::error!("overload response failed for {}: {}", client.peer(), e);
        }
    }
}

/// Serial keep-alive request loop on one connection.
pub fn process_connection(runtime: &Arc<ServerRuntime>, client: ClientConnection) {
    let mut is_keep_alive = false;
    let mut last_path = String::new();

    loop {
        let mut ctx = match HttpContext::new(&client, &runtime.context_config) {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("context setup failed for {}: {}", client.peer(), e);
                break;
            }
        };

        match ctx.init(is_keep_alive, runtime.keep_alive_timeout()) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                log::error!(
                    "request loading failed, client: {}, path: {}: {}",
                    client.peer(),
                    if last_path.is_empty() { "<not loaded>" } else { &last_path },
                    e
                );
                break;
            }
        }
        last_path = ctx.request_header.path.clone();

        let close = match process_request(runtime, &mut ctx) {
            Ok(close) => close,
            Err(e) => {
                log::error!(
                    "request failed, client: {}, path: {}: {}",
                    client.peer(),
                    last_path,
                    e
                );
                true
            }
        };
        if close {
            break;
        }

        if !runtime.config.http.keep_alive_enabled {
            break;
        }
        let connection = if ctx.request_header.has_header(headers::PROXY_CONNECTION) {
            ctx.request_header.header(headers::PROXY_CONNECTION)
        } else {
            ctx.request_header.header(headers::CONNECTION)
        };
        if !connection.eq_ignore_ascii_case(values::CONNECTION_KEEP_ALIVE) {
            break;
        }
        is_keep_alive = true;
    }

    let _ = client.stream.shutdown(std::net::Shutdown::Both);
}

/// Serve one parsed request. Returns `Ok(true)` when the connection
/// must not be kept alive.
pub fn process_request(runtime: &Arc<ServerRuntime>, ctx: &mut HttpContext) -> Result<bool> {
    runtime.requests_count.fetch_add(1, Ordering::Relaxed);

    if !is_method_implemented(ctx)? {
        return Ok(true);
    }

    log::debug!("request: {} {}", ctx.request_header.method, ctx.request_header.path);

    ctx.response.set_http_method(ctx.method);
    ctx.virtual_path = strip_query(&ctx.request_header.path);
    ctx.mapped_virtual_path = ctx.virtual_path.clone();

    let outcome = resolver::find_target(runtime, ctx).and_then(|serve_file| {
        if serve_file {
            file::process_direct_file_request(runtime, ctx)
        } else {
            Ok(())
        }
    });

    if let Err(e) = outcome {
        match e {
            WebstoneError::RequestProcessing(message) => {
                log::error!("request processing failed: {}", message);
                process_server_error(ctx, 500, &message)?;
            }
            other => return Err(other),
        }
    }

    // the body must have been consumed by now
    if !ctx.request_stream.is_read() {
        process_server_error(ctx, 500, messages::ERROR_500_REQUEST_NOT_LOADED)?;
        return Ok(true);
    }

    if !ctx.response.is_finished() {
        if ctx.response.header.status.is_none() {
            process_error_404(ctx)?;
        } else {
            ctx.response.end()?;
        }
        log::debug!(
            "request end: {}, status: {}",
            ctx.virtual_path,
            ctx.response.header.status.unwrap_or(0)
        );
    }

    Ok(false)
}

pub(crate) fn strip_query(path: &str) -> String {
    match path.find('?') {
        Some(pos) => path[..pos].to_string(),
        None => path.to_string(),
    }
}

/// Classify the method; unknown methods get a complete 501 response.
fn is_method_implemented(ctx: &mut HttpContext) -> Result<bool> {
    let method = ctx.request_header.method.clone();
    if method.is_empty() {
        log::warn!("empty HTTP method retrieved in request");
        return Ok(false);
    }

    ctx.method = match method.to_ascii_uppercase().as_str() {
        "GET" => HttpMethod::Get,
        "POST" => HttpMethod::Post,
        "HEAD" => HttpMethod::Head,
        _ => {
            ctx.response.header.status = Some(501);
            ctx.response.header.headers.set(headers::ALLOW, "GET, POST, HEAD");
            let body = messages::error_page(501, &messages::method_not_implemented(&method));
            ctx.response
                .header
                .set_content_type(values::CONTENT_TYPE_TEXT_HTML, None);
            ctx.response.write_complete_response(&body)?;
            return Ok(false);
        }
    };
    Ok(true)
}

pub(crate) fn redirect_request(ctx: &mut HttpContext, location: &str, status: u16) -> Result<()> {
    ctx.response.header.status = Some(status);
    ctx.response.header.headers.set(headers::LOCATION, location);
    let body = messages::error_page(status, &messages::document_moved(location));
    ctx.response.write_complete_html_response(&body)
}

pub(crate) fn process_error_403(ctx: &mut HttpContext, message: &str) -> Result<()> {
    ctx.response.header.status = Some(403);
    let body = messages::error_page(403, message);
    ctx.response.write_complete_html_response(&body)
}

pub(crate) fn process_error_404(ctx: &mut HttpContext) -> Result<()> {
    ctx.response.header.status = Some(404);
    let body = messages::error_page(404, &messages::not_found(&ctx.virtual_path));
    ctx.response.write_complete_html_response(&body)
}

pub(crate) fn process_error_405(ctx: &mut HttpContext, allowed: &str) -> Result<()> {
    ctx.response.header.status = Some(405);
    ctx.response.header.headers.set(headers::ALLOW, allowed);
    ctx.response
        .header
        .headers
        .set(headers::CONNECTION, values::CONNECTION_CLOSE);
    let body = messages::error_page(
        405,
        &messages::method_not_allowed(&ctx.request_header.method, allowed),
    );
    ctx.response.write_complete_html_response(&body)
}

pub(crate) fn process_error_406(ctx: &mut HttpContext, message: &str) -> Result<()> {
    ctx.response.header.status = Some(406);
    let body = messages::error_page(406, message);
    ctx.response.write_complete_html_response(&body)
}

/// 5xx path: a full error page while the headers are still ours to
/// send, an inline fragment appended to the body otherwise.
pub(crate) fn process_server_error(
    ctx: &mut HttpContext,
    status: u16,
    message: &str,
) -> Result<()> {
    if !ctx.response.is_headers_sent() && !ctx.response.is_finished() {
        ctx.response.header.status = Some(status);
        let body = messages::error_page(status, &messages::internal_error(message));
        ctx.response.write_complete_html_response(&body)
    } else if !ctx.response.is_finished() {
        ctx.response
            .write_str(&messages::error_fragment_inline(status, message))?;
        ctx.response.end()
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_query() {
        assert_eq!(strip_query("/a/b?x=1"), "/a/b");
        assert_eq!(strip_query("/a/b"), "/a/b");
        assert_eq!(strip_query("/?"), "/");
    }
}
