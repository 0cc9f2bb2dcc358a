//! Webstone server binary.
//!
//! `webstone run` starts the HTTP server and the administrative
//! control channel in the foreground; `stop`, `stat` and `reload` talk
//! to a running instance over the control port:
//!
//! ```bash
//! webstone --config webstone.json run
//! webstone --config webstone.json stat
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use webstone_core::config::Config;
use webstone_core::logging::init_logging;
use webstone_core::net::Server;
use webstone_core::server::control::{self, ControlHandler};
use webstone_core::server::{HttpConnectionHandler, ServerRuntime};

#[derive(Parser)]
#[command(
    name = "webstone",
    about = "Webstone HTTP/1.1 origin server",
    version
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "webstone.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Run,
    /// Stop a running server
    Stop,
    /// Show request and worker statistics of a running server
    Stat,
    /// Reload the directory configuration of a running server
    Reload,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run => run(&cli.config),
        Commands::Stop => client_command(&cli.config, control::COMMAND_STOP),
        Commands::Stat => client_command(&cli.config, control::COMMAND_STAT),
        Commands::Reload => client_command(&cli.config, control::COMMAND_RELOAD),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    init_logging(&config.logging)?;

    let runtime = Arc::new(ServerRuntime::new(config)?);

    let http_server = Arc::new(Server::new(
        runtime.config.server.clone(),
        runtime.config.http.port,
        Arc::new(HttpConnectionHandler::new(runtime.clone())),
    ));

    // the command channel runs on the same acceptor type with its own
    // socket timeouts
    let mut control_settings = runtime.config.server.clone();
    control_settings.socket_read_timeout = runtime.config.http.command_socket_timeout;
    control_settings.socket_write_timeout = runtime.config.http.command_socket_timeout;

    let control_handler =
        ControlHandler::new(runtime.clone(), http_server.clone(), config_path.clone());
    let shutdown = control_handler.shutdown_flag();
    let control_server = Server::new(
        control_settings,
        runtime.config.http.command_port,
        Arc::new(control_handler),
    );

    http_server.start()?;
    control_server.start()?;
    log::info!(
        "server started, http port: {}, command port: {}",
        runtime.config.http.port,
        runtime.config.http.command_port
    );

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }

    control_server.stop(true);
    log::info!("server stopped");
    Ok(())
}

fn client_command(config_path: &PathBuf, command: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let addr = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        config.http.command_port,
    );
    let timeout = Duration::from_secs(config.http.command_socket_timeout);

    let response = control::send_command(addr, command, timeout)?;
    println!("{response}");
    Ok(())
}
