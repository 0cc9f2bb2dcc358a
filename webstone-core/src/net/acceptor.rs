//! Generic TCP acceptor with a bounded, pooled worker model
//!
//! One thread runs the accept loop. Each accepted connection is either
//! handed to an idle pooled worker over a FIFO queue (one condvar
//! notification per enqueue) or processed by a freshly spawned worker,
//! bounded by `workers_count`. Idle workers wait up to
//! `worker_life_time` for the next handoff before retiring.
//!
//! Locking protocol: the handoff queue and the idle-worker counter are
//! guarded by one mutex/condvar pair, the "worker finished" signal and
//! the worker counter by another. The acceptor and the workers never
//! hold both at once.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ServerSettings;
use crate::error::{is_retriable_accept, Result, WebstoneError};
use crate::net::apply_timeouts;

/// Accept failures tolerated back-to-back before the listener is
/// declared dead and the server stops itself.
const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 8;

/// An accepted TCP endpoint. Owns the socket for the connection's
/// lifetime; dropping it closes the connection.
#[derive(Debug)]
pub struct ClientConnection {
    pub stream: TcpStream,
    pub ip: IpAddr,
    pub port: u16,
}

impl ClientConnection {
    pub fn peer(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Per-connection entry point run on a worker thread.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Process every request arriving on `client`. The connection is
    /// closed when the implementation drops it.
    fn handle(&self, client: ClientConnection);

    /// Called on the accept path when a worker could not be spawned;
    /// gives the protocol a chance to emit a canned overload response.
    fn on_worker_spawn_error(&self, _client: &mut ClientConnection) {}
}

struct ServerState {
    stopped: AtomicBool,
    workers: AtomicI64,
    idle_workers: AtomicI64,
    pending: Mutex<VecDeque<ClientConnection>>,
    pending_cv: Condvar,
    finish: Mutex<()>,
    finish_cv: Condvar,
}

impl ServerState {
    fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            workers: AtomicI64::new(0),
            idle_workers: AtomicI64::new(0),
            pending: Mutex::new(VecDeque::new()),
            pending_cv: Condvar::new(),
            finish: Mutex::new(()),
            finish_cv: Condvar::new(),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn add_worker(&self) {
        self.workers.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_worker(&self) {
        let _guard = self.finish.lock().unwrap();
        let left = self.workers.fetch_sub(1, Ordering::SeqCst) - 1;
        debug_assert!(left >= 0, "negative workers count");
        self.finish_cv.notify_all();
    }

    /// Park as an idle worker until a handoff arrives.
    ///
    /// Returns the next connection iff the wait was ended by a handoff
    /// notification (not a timeout, not a stop broadcast) and the queue
    /// is non-empty.
    fn idle_wait(&self, life_time: Duration) -> Option<ClientConnection> {
        if self.is_stopped() {
            return None;
        }
        let guard = self.pending.lock().unwrap();
        self.idle_workers.fetch_add(1, Ordering::SeqCst);

        let (mut guard, timeout) = self.pending_cv.wait_timeout(guard, life_time).unwrap();

        let left = self.idle_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        debug_assert!(left >= 0, "negative idle workers count");

        if self.is_stopped() || timeout.timed_out() {
            return None;
        }
        guard.pop_front()
    }
}

/// Decrements the worker counter even when the handler panics.
struct WorkerGuard<'a>(&'a ServerState);

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.0.remove_worker();
    }
}

/// The generic connection server: listen, accept, dispatch.
///
/// The protocol living on top (HTTP, the admin command channel) is
/// supplied as a [`ConnectionHandler`]; the acceptor knows nothing
/// about what the workers speak.
pub struct Server {
    settings: ServerSettings,
    port: u16,
    handler: Arc<dyn ConnectionHandler>,
    state: Arc<ServerState>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stop_lock: Mutex<()>,
}

impl Server {
    pub fn new(settings: ServerSettings, port: u16, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            settings,
            port,
            handler,
            state: Arc::new(ServerState::new()),
            accept_thread: Mutex::new(None),
            local_addr: Mutex::new(None),
            stop_lock: Mutex::new(()),
        }
    }

    /// Bind, listen and start the accept loop on its own thread.
    pub fn start(&self) -> Result<()> {
        let mut thread_slot = self.accept_thread.lock().unwrap();
        if thread_slot.is_some() {
            return Err(WebstoneError::AlreadyStarted);
        }
        self.state.stopped.store(false, Ordering::SeqCst);

        let listener = self.create_listener()?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(local_addr);

        log::info!("listening on {}", local_addr);

        let state = Arc::clone(&self.state);
        let handler = Arc::clone(&self.handler);
        let settings = self.settings.clone();
        let handle = thread::Builder::new()
            .name("webstone-accept".into())
            .spawn(move || accept_loop(listener, state, handler, settings))?;

        *thread_slot = Some(handle);
        Ok(())
    }

    fn create_listener(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(self.settings.bind_addr, self.port);
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if self.settings.reuse_addr {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(self.settings.backlog)?;
        Ok(socket.into())
    }

    /// Stop the server. Idle workers are woken so they observe the
    /// stopped flag; with `wait_all` the call blocks until every worker
    /// has finished its in-flight connection.
    pub fn stop(&self, wait_all: bool) {
        let _stop_guard = self.stop_lock.lock().unwrap();
        let already = self.state.stopped.swap(true, Ordering::SeqCst);

        if !already {
            log::info!("stopping server on port {}", self.port);
        }

        // wake everything parked on the handoff queue
        while self.state.idle_workers.load(Ordering::SeqCst) > 0 {
            let _guard = self.state.pending.lock().unwrap();
            self.state.pending_cv.notify_all();
            drop(_guard);
            thread::yield_now();
        }

        // wake the acceptor if it is waiting for worker headroom
        {
            let _guard = self.state.finish.lock().unwrap();
            self.state.finish_cv.notify_all();
        }

        // unblock the accept call itself
        if let Some(addr) = *self.local_addr.lock().unwrap() {
            let wake = connectable_addr(addr);
            let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(500));
        }

        if wait_all {
            let mut guard = self.state.finish.lock().unwrap();
            while self.state.workers.load(Ordering::SeqCst) > 0 {
                let (g, _) = self
                    .state
                    .finish_cv
                    .wait_timeout(guard, Duration::from_millis(200))
                    .unwrap();
                guard = g;
            }
        }

        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.state.pending.lock().unwrap().clear();
        *self.local_addr.lock().unwrap() = None;
    }

    /// Block until the accept loop exits.
    pub fn join(&self) {
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Actual bound address; useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn workers_count(&self) -> i64 {
        self.state.workers.load(Ordering::SeqCst)
    }

    pub fn idle_workers_count(&self) -> i64 {
        self.state.idle_workers.load(Ordering::SeqCst)
    }
}

/// Loopback form of a bound address, used to self-connect on stop.
fn connectable_addr(bound: SocketAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
    } else {
        bound
    }
}

fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    handler: Arc<dyn ConnectionHandler>,
    settings: ServerSettings,
) {
    let max_workers = settings.workers_count as i64;
    let mut consecutive_errors = 0u32;

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => {
                consecutive_errors = 0;
                accepted
            }
            Err(e) => {
                if state.is_stopped() {
                    break;
                }
                if is_retriable_accept(&e) {
                    log::debug!("transient accept failure: {}", e);
                    continue;
                }
                consecutive_errors += 1;
                log::error!("accept failed: {}", e);
                if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                    log::error!("listener failure, shutting the acceptor down");
                    state.stopped.store(true, Ordering::SeqCst);
                    break;
                }
                continue;
            }
        };

        if state.is_stopped() {
            break;
        }

        if let Err(e) =
            apply_timeouts(&stream, settings.read_timeout(), settings.write_timeout())
        {
            log::warn!("socket timeout setup failed: {}", e);
            continue;
        }

        let client = ClientConnection { ip: peer.ip(), port: peer.port(), stream };
        log::debug!("accepted connection from {}", client.peer());

        // fast path: hand the connection to a pooled idle worker;
        // the counter is re-checked under the queue lock
        if settings.enable_pooling && state.idle_workers.load(Ordering::SeqCst) > 0 {
            let mut pending = state.pending.lock().unwrap();
            if state.idle_workers.load(Ordering::SeqCst) > 0 {
                pending.push_back(client);
                state.pending_cv.notify_one();
                continue;
            }
            drop(pending);
            // the idle worker retired between the checks
            spawn_worker(&state, &handler, &settings, client, max_workers);
            continue;
        }

        spawn_worker(&state, &handler, &settings, client, max_workers);
    }

    log::debug!("accept loop finished");
}

fn spawn_worker(
    state: &Arc<ServerState>,
    handler: &Arc<dyn ConnectionHandler>,
    settings: &ServerSettings,
    client: ClientConnection,
    max_workers: i64,
) {
    // no headroom: wait for a worker to finish
    while state.workers.load(Ordering::SeqCst) >= max_workers {
        if state.is_stopped() {
            return;
        }
        let guard = state.finish.lock().unwrap();
        let _ = state
            .finish_cv
            .wait_timeout(guard, Duration::from_millis(200))
            .unwrap();
    }

    if state.is_stopped() {
        return;
    }

    state.add_worker();

    // parked in a slot so the connection can be recovered for the
    // overload response if thread creation fails
    let client_slot = Arc::new(Mutex::new(Some(client)));

    let state_for_worker = Arc::clone(state);
    let handler_for_worker = Arc::clone(handler);
    let settings_for_worker = settings.clone();
    let slot_for_worker = Arc::clone(&client_slot);
    let spawned = thread::Builder::new().name("webstone-worker".into()).spawn(move || {
        let client = slot_for_worker.lock().unwrap().take();
        match client {
            Some(client) => {
                worker_loop(state_for_worker, handler_for_worker, settings_for_worker, client)
            }
            None => state_for_worker.remove_worker(),
        }
    });

    if let Err(e) = spawned {
        state.remove_worker();
        log::error!("worker thread creation failed: {}", e);
        if let Some(mut client) = client_slot.lock().unwrap().take() {
            handler.on_worker_spawn_error(&mut client);
        }
    }
}

fn worker_loop(
    state: Arc<ServerState>,
    handler: Arc<dyn ConnectionHandler>,
    settings: ServerSettings,
    mut client: ClientConnection,
) {
    let _guard = WorkerGuard(&state);

    loop {
        let peer = client.peer();
        let result = catch_unwind(AssertUnwindSafe(|| handler.handle(client)));
        if result.is_err() {
            log::error!("worker panicked while serving {}", peer);
        }
        log::debug!("connection from {} closed", peer);

        if state.is_stopped() || !settings.enable_pooling {
            break;
        }
        match state.idle_wait(Duration::from_secs(settings.worker_life_time)) {
            Some(next) => client = next,
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;

    fn test_settings() -> ServerSettings {
        ServerSettings {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            worker_life_time: 1,
            socket_read_timeout: 2,
            socket_write_timeout: 2,
            ..ServerSettings::default()
        }
    }

    /// Echoes one line back and closes.
    struct EchoHandler {
        served: AtomicUsize,
    }

    impl ConnectionHandler for EchoHandler {
        fn handle(&self, mut client: ClientConnection) {
            let mut buf = [0u8; 256];
            if let Ok(n) = client.stream.read(&mut buf) {
                let _ = client.stream.write_all(&buf[..n]);
            }
            self.served.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_start_serve_stop() {
        let handler = Arc::new(EchoHandler { served: AtomicUsize::new(0) });
        let server = Server::new(test_settings(), 0, handler.clone());
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        for _ in 0..3 {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping\n").unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            assert_eq!(response, b"ping\n");
        }

        server.stop(true);
        assert_eq!(server.workers_count(), 0);
        assert!(handler.served.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_double_start_fails() {
        let handler = Arc::new(EchoHandler { served: AtomicUsize::new(0) });
        let server = Server::new(test_settings(), 0, handler);
        server.start().unwrap();
        assert!(matches!(server.start(), Err(WebstoneError::AlreadyStarted)));
        server.stop(true);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let handler = Arc::new(EchoHandler { served: AtomicUsize::new(0) });
        let server = Server::new(test_settings(), 0, handler);
        server.start().unwrap();
        server.stop(true);
        server.stop(true);
        assert!(server.is_stopped());
    }

    #[test]
    fn test_restart_after_stop() {
        let handler = Arc::new(EchoHandler { served: AtomicUsize::new(0) });
        let server = Server::new(test_settings(), 0, handler);
        server.start().unwrap();
        server.stop(true);
        server.start().unwrap();

        let addr = server.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"again\n").unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"again\n");

        server.stop(true);
    }

    #[test]
    fn test_counters_stay_in_bounds() {
        let handler = Arc::new(EchoHandler { served: AtomicUsize::new(0) });
        let server = Server::new(test_settings(), 0, handler);
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let clients: Vec<_> = (0..8)
            .map(|_| {
                let mut s = TcpStream::connect(addr).unwrap();
                s.write_all(b"x").unwrap();
                s
            })
            .collect();
        for mut s in clients {
            let mut out = Vec::new();
            let _ = s.read_to_end(&mut out);
        }

        let idle = server.idle_workers_count();
        let total = server.workers_count();
        assert!(idle >= 0);
        assert!(total >= idle);

        server.stop(true);
        assert_eq!(server.workers_count(), 0);
    }
}
