//! Administrative control channel
//!
//! A second instance of the generic acceptor listens on the command
//! port and speaks a line-oriented text protocol: `stat`, `reload` and
//! `stop`, each terminated by CRLF. The channel shares the HTTP
//! server's runtime, so `stat` reads live counters and `reload` can
//! drain, rebuild the directory tree and restart the acceptor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Result, WebstoneError};
use crate::net::{
    read_from_socket, write_to_socket, ClientConnection, ConnectionHandler, ReadCompletion,
    Server,
};
use crate::server::ServerRuntime;
use crate::vdir::DirectoryTree;

/// Command and response terminator.
pub const COMMAND_END_MARK: &[u8] = b"\r\n";

pub const COMMAND_STOP: &str = "stop";
pub const COMMAND_STAT: &str = "stat";
pub const COMMAND_RELOAD: &str = "reload";

/// Connection handler of the control port.
pub struct ControlHandler {
    runtime: Arc<ServerRuntime>,
    http_server: Arc<Server>,
    config_path: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl ControlHandler {
    pub fn new(
        runtime: Arc<ServerRuntime>,
        http_server: Arc<Server>,
        config_path: PathBuf,
    ) -> Self {
        Self {
            runtime,
            http_server,
            config_path,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag raised by a `stop` command; the hosting process watches it
    /// to leave its run loop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn execute(&self, command: &str) -> String {
        match command {
            COMMAND_STAT => {
                format!(
                    "requests: {}, workers: {}, idle: {}",
                    self.runtime.requests_count.load(Ordering::Relaxed),
                    self.http_server.workers_count(),
                    self.http_server.idle_workers_count()
                )
            }
            COMMAND_STOP => {
                self.http_server.stop(true);
                self.shutdown.store(true, Ordering::SeqCst);
                "stopped".to_string()
            }
            COMMAND_RELOAD => match self.reload() {
                Ok(()) => "directories settings reloaded".to_string(),
                Err(e) => format!("settings reload failed: {e}"),
            },
            other => format!("unknown command: {other}"),
        }
    }

    /// Drain in-flight requests, rebuild the directory tree from disk
    /// and restart the acceptor.
    fn reload(&self) -> Result<()> {
        self.http_server.stop(true);
        let config = Config::load(&self.config_path)?;
        let tree = DirectoryTree::build(&config.directories)?;
        self.runtime.replace_tree(tree);
        self.http_server.start()
    }
}

impl ConnectionHandler for ControlHandler {
    fn handle(&self, mut client: ClientConnection) {
        let check = ReadCompletion::end_mark(COMMAND_END_MARK);
        let command = match read_from_socket(&mut client.stream, &check, false) {
            Ok(read) if !read.connection_closed => {
                let end = read.mark_end.unwrap_or(read.data.len());
                String::from_utf8_lossy(&read.data[..end]).trim().to_string()
            }
            Ok(_) => return,
            Err(e) => {
                log::error!("command reading failed: {}", e);
                return;
            }
        };

        log::info!("control command from {}: {}", client.peer(), command);
        let response = self.execute(&command);

        let mut payload = response.into_bytes();
        payload.extend_from_slice(COMMAND_END_MARK);
        if let Err(e) = write_to_socket(&mut client.stream, &payload) {
            log::error!("command response failed, command: {}, error: {}", command, e);
        }
    }
}

/// Send one command to a running server's control port and return the
/// response line.
pub fn send_command(addr: SocketAddr, command: &str, timeout: Duration) -> Result<String> {
    let mut stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut payload = command.as_bytes().to_vec();
    payload.extend_from_slice(COMMAND_END_MARK);
    write_to_socket(&mut stream, &payload)?;

    let check = ReadCompletion::end_mark(COMMAND_END_MARK);
    let read = read_from_socket(&mut stream, &check, true)?;
    if read.data.is_empty() {
        return Err(WebstoneError::Application("empty control response".into()));
    }
    let end = read.mark_end.unwrap_or(read.data.len());
    Ok(String::from_utf8_lossy(&read.data[..end]).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirectoryConfig, ListingTemplates, ServerSettings};
    use crate::server::HttpConnectionHandler;
    use std::net::{IpAddr, Ipv4Addr};

    fn control_fixture() -> (tempfile::TempDir, Arc<ServerRuntime>, Arc<Server>, Server) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("webstone.json");
        std::fs::write(
            &config_path,
            format!(
                r#"{{"directories": [{{"name": "root", "path": {:?}}}]}}"#,
                dir.path().to_string_lossy()
            ),
        )
        .unwrap();

        let mut config = Config::default();
        config.finish();
        config.directories.push(DirectoryConfig {
            name: "root".into(),
            parent: None,
            virtual_path: None,
            path: Some(dir.path().to_path_buf()),
            relative_path: None,
            browsing_enabled: Some(true),
            charset: None,
            default_documents: Vec::new(),
            handlers: Vec::new(),
            mappings: Vec::new(),
            templates: ListingTemplates::default(),
        });
        let runtime = Arc::new(ServerRuntime::new(config).unwrap());

        let settings = ServerSettings {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            worker_life_time: 1,
            socket_read_timeout: 2,
            socket_write_timeout: 2,
            ..ServerSettings::default()
        };
        let http_server = Arc::new(Server::new(
            settings.clone(),
            0,
            Arc::new(HttpConnectionHandler::new(runtime.clone())),
        ));
        http_server.start().unwrap();

        let control = Server::new(
            settings,
            0,
            Arc::new(ControlHandler::new(runtime.clone(), http_server.clone(), config_path)),
        );
        control.start().unwrap();

        (dir, runtime, http_server, control)
    }

    #[test]
    fn test_stat_command_reports_counters() {
        let (_dir, _runtime, http_server, control) = control_fixture();
        let addr = control.local_addr().unwrap();

        let response = send_command(addr, "stat", Duration::from_secs(2)).unwrap();
        assert!(response.starts_with("requests: 0"));
        assert!(response.contains("workers:"));

        control.stop(true);
        http_server.stop(true);
    }

    #[test]
    fn test_unknown_command() {
        let (_dir, _runtime, http_server, control) = control_fixture();
        let addr = control.local_addr().unwrap();

        let response = send_command(addr, "frobnicate", Duration::from_secs(2)).unwrap();
        assert_eq!(response, "unknown command: frobnicate");

        control.stop(true);
        http_server.stop(true);
    }

    #[test]
    fn test_stop_command_drains_http_server() {
        let (_dir, _runtime, http_server, control) = control_fixture();
        let addr = control.local_addr().unwrap();

        let response = send_command(addr, "stop", Duration::from_secs(5)).unwrap();
        assert_eq!(response, "stopped");
        assert!(http_server.is_stopped());
        assert_eq!(http_server.workers_count(), 0);

        control.stop(true);
    }

    #[test]
    fn test_reload_rebuilds_tree() {
        let (dir, runtime, http_server, control) = control_fixture();
        let addr = control.local_addr().unwrap();

        // the config on disk only declares the root
        assert!(runtime.tree().get("/extra/").is_none());
        std::fs::create_dir(dir.path().join("extra")).unwrap();
        std::fs::write(
            dir.path().join("webstone.json"),
            format!(
                r#"{{"directories": [
                    {{"name": "root", "path": {0:?}}},
                    {{"name": "extra", "parent": "root", "relative_path": "extra"}}
                ]}}"#,
                dir.path().to_string_lossy()
            ),
        )
        .unwrap();

        let response = send_command(addr, "reload", Duration::from_secs(5)).unwrap();
        assert_eq!(response, "directories settings reloaded");
        assert!(runtime.tree().get("/extra/").is_some());

        control.stop(true);
        http_server.stop(true);
    }
}
