//! Webstone - a standalone HTTP/1.1 origin server
//!
//! Webstone accepts TCP connections on a bounded worker pool, parses
//! HTTP/1.1 requests and resolves them against a configured hierarchy of
//! virtual directories: static files with conditional GET, browsable
//! directory listings, regex URL mappings and pluggable extension
//! handlers. Responses are framed automatically - fixed-length when the
//! body fits the response buffer, chunked otherwise.
//!
//! # Architecture
//!
//! - [`net`] - socket helpers and the generic acceptor / worker pool
//! - [`http`] - request parsing, response framing, parameter decoding
//! - [`server`] - the HTTP connection processor, URL resolver, file
//!   server, directory listings and the admin control channel
//! - [`vdir`] - the virtual directory tree
//! - [`config`] - on-disk configuration model
//! - [`logging`] - level-gated logger on the `log` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webstone_core::config::Config;
//! use webstone_core::server::{HttpConnectionHandler, ServerRuntime};
//! use webstone_core::net::Server;
//!
//! let config = Config::load("webstone.json")?;
//! let runtime = Arc::new(ServerRuntime::new(config)?);
//! let server = Server::new(
//!     runtime.config.server.clone(),
//!     runtime.config.http.port,
//!     Arc::new(HttpConnectionHandler::new(runtime.clone())),
//! );
//! server.start()?;
//! # Ok::<(), webstone_core::error::WebstoneError>(())
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod net;
pub mod server;
pub mod util;
pub mod vdir;

pub use config::Config;
pub use error::{Result, WebstoneError};
pub use http::context::HttpContext;
pub use net::{ClientConnection, ConnectionHandler, Server};
pub use server::{Handler, HttpConnectionHandler, ServerRuntime};
pub use vdir::{DirectoryEntry, DirectoryTree};
