//! Polling TCP server.
//!
//! [`PollingServer`] accepts clients from an allow list and runs three
//! independent loops, each on its own thread and each sleeping on its own
//! delay:
//!
//! - **accept** - drains pending connections, rejects addresses not in the
//!   allow list and registers the others.
//! - **disconnect** - probes every client and removes the ones whose peer has
//!   gone away.
//! - **listener** - reads whatever each client has sent and hands it to the
//!   [`ServerHandler`].
//!
//! Outgoing data goes through [`Broadcaster::broadcast`], which copies the
//! client set and writes to every client on that copy. A failing client is
//! logged and its socket shut down; removing it is the disconnect loop's job.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use plc_gateway::{ClientInfo, PollingServer, ServerConfig, ServerHandler};
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_received(&self, client: &ClientInfo, data: &[u8]) {
//!         println!("{} sent {} bytes", client.addr, data.len());
//!     }
//! }
//!
//! let config = ServerConfig::new("0.0.0.0".parse().unwrap(), 2102)
//!     .allow("192.168.0.20".parse().unwrap());
//! let mut server = PollingServer::new(config, Arc::new(Echo));
//! server.start().unwrap();
//! server.broadcast(&[0x04, 0x00, 0x00, 0x00]);
//! server.stop();
//! ```

use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::error::{GatewayError, Result};
use crate::stop::StopSignal;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 2102;

/// Default pause between two accept passes.
pub const DEFAULT_ACCEPT_DELAY: Duration = Duration::from_millis(100);

/// Default pause between two liveness passes.
pub const DEFAULT_DISCONNECT_DELAY: Duration = Duration::from_millis(500);

/// Default pause between two receive passes.
pub const DEFAULT_LISTENER_DELAY: Duration = Duration::from_millis(50);

/// Largest number of bytes read from one client in one receive pass.
pub const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// How long a receive or liveness probe waits on an idle socket.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Upper bound for writing one broadcast frame to one client.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Listening address, allow list and loop delays.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind.
    pub address: IpAddr,
    /// Local port to bind; 0 picks a free port.
    pub port: u16,
    /// Client addresses allowed to connect.
    pub allowed: HashSet<IpAddr>,
    /// Pause between accept passes.
    pub accept_delay: Duration,
    /// Pause between liveness passes.
    pub disconnect_delay: Duration,
    /// Pause between receive passes.
    pub listener_delay: Duration,
}

impl ServerConfig {
    /// Creates a configuration with an empty allow list and default delays.
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            allowed: HashSet::new(),
            accept_delay: DEFAULT_ACCEPT_DELAY,
            disconnect_delay: DEFAULT_DISCONNECT_DELAY,
            listener_delay: DEFAULT_LISTENER_DELAY,
        }
    }

    /// Adds a client address to the allow list.
    pub fn allow(mut self, ip: IpAddr) -> Self {
        self.allowed.insert(ip);
        self
    }

    /// Sets the pause between accept passes.
    pub fn with_accept_delay(mut self, delay: Duration) -> Self {
        self.accept_delay = delay;
        self
    }

    /// Sets the pause between liveness passes.
    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = delay;
        self
    }

    /// Sets the pause between receive passes.
    pub fn with_listener_delay(mut self, delay: Duration) -> Self {
        self.listener_delay = delay;
        self
    }

    /// Returns whether `ip` may connect.
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        self.allowed.contains(ip)
    }
}

/// Identity of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientInfo {
    /// Server-assigned id, unique for the server's lifetime.
    pub id: u64,
    /// Peer address.
    pub addr: SocketAddr,
}

/// Callbacks invoked from the server's loops.
///
/// Every method has an empty default. Callbacks run on the loop threads, so
/// they must not block for long.
pub trait ServerHandler: Send + Sync {
    /// Called once the loops are running.
    fn on_start(&self, _broadcaster: &Broadcaster) {}

    /// Called while stopping, before the loops are joined.
    fn on_stop(&self) {}

    /// Called after an allowed client has been registered.
    fn on_client_connected(&self, _client: &ClientInfo) {}

    /// Called after a dead client has been removed.
    fn on_client_disconnected(&self, _client: &ClientInfo) {}

    /// Called with the bytes one receive pass read from a client.
    fn on_received(&self, _client: &ClientInfo, _data: &[u8]) {}
}

#[derive(Debug)]
struct Client {
    info: ClientInfo,
    stream: TcpStream,
}

#[derive(Debug, Clone, Default)]
struct ClientSet {
    inner: Arc<Mutex<Vec<Arc<Client>>>>,
}

impl ClientSet {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Client>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add(&self, client: Arc<Client>) -> usize {
        let mut clients = self.lock();
        clients.push(client);
        clients.len()
    }

    fn remove(&self, id: u64) -> usize {
        let mut clients = self.lock();
        clients.retain(|c| c.info.id != id);
        clients.len()
    }

    /// Copies the current members so callers iterate without holding the lock.
    fn snapshot(&self) -> Vec<Arc<Client>> {
        self.lock().clone()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn close_all(&self) {
        for client in self.lock().drain(..) {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Cloneable handle for sending data to every connected client.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    clients: ClientSet,
    stop: StopSignal,
}

impl Broadcaster {
    /// Writes `data` to every client.
    ///
    /// Returns the number of clients the write succeeded for. A failing
    /// client is logged and its socket shut down; it stays registered until
    /// the disconnect loop sees the closed socket. Does nothing once the
    /// server is stopping.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        if self.stop.is_stopped() {
            return 0;
        }
        let mut delivered = 0;
        for client in self.clients.snapshot() {
            match (&client.stream).write_all(data) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Broadcast of {} bytes to {} failed: {}",
                        data.len(),
                        client.info.addr,
                        e
                    );
                    // a partial write leaves the stream out of frame sync
                    let _ = client.stream.shutdown(Shutdown::Both);
                }
            }
        }
        trace!("Broadcast {} bytes to {} client(s)", data.len(), delivered);
        delivered
    }

    /// Returns the number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Returns whether the server is still running.
    pub fn is_active(&self) -> bool {
        !self.stop.is_stopped()
    }
}

/// TCP server driven by three polling loops.
pub struct PollingServer {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    clients: ClientSet,
    running: Option<Running>,
}

struct Running {
    stop: StopSignal,
    broadcaster: Broadcaster,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl PollingServer {
    /// Creates a stopped server.
    pub fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Self {
        Self {
            config,
            handler,
            clients: ClientSet::default(),
            running: None,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listening socket and starts the loops.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if the server is already
    /// running, or `GatewayError::Io` if the socket cannot be bound or a loop
    /// thread cannot be spawned.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(GatewayError::invalid_parameter(
                "server",
                "already started",
            ));
        }
        if self.config.allowed.is_empty() {
            warn!("Allow list is empty, every client will be rejected");
        }

        let listener = TcpListener::bind(SocketAddr::new(self.config.address, self.config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let stop = StopSignal::new();
        let broadcaster = Broadcaster {
            clients: self.clients.clone(),
            stop: stop.clone(),
        };
        let mut running = Running {
            stop: stop.clone(),
            broadcaster: broadcaster.clone(),
            local_addr,
            threads: Vec::with_capacity(3),
        };

        let spawned = self.spawn_loops(listener, &stop, &mut running.threads);
        if let Err(e) = spawned {
            stop.stop();
            for handle in running.threads.drain(..) {
                let _ = handle.join();
            }
            return Err(e);
        }

        info!("Server listening on {}", local_addr);
        self.handler.on_start(&broadcaster);
        self.running = Some(running);
        Ok(())
    }

    fn spawn_loops(
        &self,
        listener: TcpListener,
        stop: &StopSignal,
        threads: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let ctx = LoopContext {
            config: self.config.clone(),
            handler: Arc::clone(&self.handler),
            clients: self.clients.clone(),
            stop: stop.clone(),
        };

        let accept = ctx.clone();
        threads.push(
            thread::Builder::new()
                .name("server-accept".into())
                .spawn(move || accept.accept_loop(listener))?,
        );
        let disconnect = ctx.clone();
        threads.push(
            thread::Builder::new()
                .name("server-disconnect".into())
                .spawn(move || disconnect.disconnect_loop())?,
        );
        threads.push(
            thread::Builder::new()
                .name("server-listener".into())
                .spawn(move || ctx.listener_loop())?,
        );
        Ok(())
    }

    /// Stops the loops, waits for them and closes every client.
    ///
    /// Does nothing if the server is not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop.stop();
        self.handler.on_stop();
        for handle in running.threads {
            let name = handle.thread().name().unwrap_or("server").to_string();
            if handle.join().is_err() {
                error!("Thread {} panicked", name);
            }
        }
        self.clients.close_all();
        info!("Server on {} stopped", running.local_addr);
    }

    /// Returns whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Returns the bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Returns a broadcast handle while running.
    pub fn broadcaster(&self) -> Option<Broadcaster> {
        self.running.as_ref().map(|r| r.broadcaster.clone())
    }

    /// Writes `data` to every client; see [`Broadcaster::broadcast`].
    ///
    /// Returns 0 when the server is not running.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        self.running
            .as_ref()
            .map_or(0, |r| r.broadcaster.broadcast(data))
    }

    /// Returns the number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Drop for PollingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PollingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingServer")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .field("clients", &self.client_count())
            .finish()
    }
}

/// State each loop thread owns a copy of.
#[derive(Clone)]
struct LoopContext {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    clients: ClientSet,
    stop: StopSignal,
}

impl LoopContext {
    fn accept_loop(self, listener: TcpListener) {
        let mut next_id = 0u64;
        loop {
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        next_id += 1;
                        self.register(stream, addr, next_id);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        break;
                    }
                }
            }
            if !self.stop.sleep(self.config.accept_delay) {
                break;
            }
        }
        debug!("Accept loop exited");
    }

    fn register(&self, stream: TcpStream, addr: SocketAddr, id: u64) {
        if !self.config.is_allowed(&addr.ip()) {
            warn!("Rejected connection from {}: not in allow list", addr);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        if let Err(e) = prepare_stream(&stream) {
            warn!("Dropping client {}: {}", addr, e);
            return;
        }

        let info = ClientInfo { id, addr };
        let total = self.clients.add(Arc::new(Client { info, stream }));
        info!("Client {} connected ({} active)", addr, total);
        self.handler.on_client_connected(&info);
    }

    fn disconnect_loop(self) {
        // first pass one delay after start, like every later one
        while self.stop.sleep(self.config.disconnect_delay) {
            for client in self.clients.snapshot() {
                if !is_alive(&client.stream) {
                    let _ = client.stream.shutdown(Shutdown::Both);
                    let total = self.clients.remove(client.info.id);
                    info!("Client {} disconnected ({} active)", client.info.addr, total);
                    self.handler.on_client_disconnected(&client.info);
                }
            }
        }
        debug!("Disconnect loop exited");
    }

    fn listener_loop(self) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            for client in self.clients.snapshot() {
                match (&client.stream).read(&mut buf) {
                    // peer closed; the disconnect loop removes it
                    Ok(0) => {}
                    Ok(n) => {
                        trace!("Received {} bytes from {}", n, client.info.addr);
                        self.handler.on_received(&client.info, &buf[..n]);
                    }
                    Err(e) if is_idle(&e) => {}
                    Err(e) => debug!("Receive from {} failed: {}", client.info.addr, e),
                }
            }
            if !self.stop.sleep(self.config.listener_delay) {
                break;
            }
        }
        debug!("Listener loop exited");
    }
}

fn prepare_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.set_nodelay(true)
}

fn is_idle(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Probes a client socket without consuming data.
fn is_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => is_idle(&e),
    }
}
