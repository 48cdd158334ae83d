//! Bus server: bind with retry, a nonblocking accept loop with admission
//! control, and a periodic probe that terminates stalled connections.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::MessageHandler;
use crate::bus::conn::{BusConnection, BusConnectionConfig};
use crate::bus::error::BusError;
use crate::bus::socket::{
    BusAddr, BusListener, BusStream, LocalSocketProvider, RemoteSocketProvider, SocketProvider,
};
use crate::metrics;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

fn default_listen() -> BusAddr {
    BusAddr::Tcp("127.0.0.1:0".to_string())
}

fn default_bind_retry_count() -> u32 {
    5
}

fn default_bind_retry_backoff_ms() -> u64 {
    1_000
}

fn default_check_period_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusServerConfig {
    #[serde(default = "default_listen")]
    pub listen: BusAddr,
    /// Admission limit; connections over it are dropped at accept.
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default = "default_bind_retry_count")]
    pub bind_retry_count: u32,
    #[serde(default = "default_bind_retry_backoff_ms")]
    pub bind_retry_backoff_ms: u64,
    /// How often the live set is probed for stalled connections.
    #[serde(default = "default_check_period_ms")]
    pub check_period_ms: u64,
    #[serde(default)]
    pub read_stall_timeout_ms: Option<u64>,
    #[serde(default)]
    pub write_stall_timeout_ms: Option<u64>,
    #[serde(default)]
    pub connection: BusConnectionConfig,
}

impl Default for BusServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: None,
            bind_retry_count: default_bind_retry_count(),
            bind_retry_backoff_ms: default_bind_retry_backoff_ms(),
            check_period_ms: default_check_period_ms(),
            read_stall_timeout_ms: None,
            write_stall_timeout_ms: None,
            connection: BusConnectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub live: usize,
}

#[derive(Debug, Default)]
struct ServerCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

struct ConnectionSlots {
    active: AtomicUsize,
    limit: Option<usize>,
}

impl ConnectionSlots {
    fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            limit,
        })
    }

    fn try_acquire(self: &Arc<Self>) -> Option<ConnectionPermit> {
        loop {
            let current = self.active.load(Ordering::Acquire);
            if let Some(limit) = self.limit
                && current >= limit
            {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConnectionPermit {
                        slots: self.clone(),
                    });
                }
                Err(_) => continue,
            }
        }
    }
}

struct ConnectionPermit {
    slots: Arc<ConnectionSlots>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let previous = self.slots.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "connection count underflow");
    }
}

pub struct BusServer {
    config: BusServerConfig,
    provider: Arc<dyn SocketProvider>,
}

impl BusServer {
    pub fn new(config: BusServerConfig) -> Self {
        let provider: Arc<dyn SocketProvider> = if config.listen.is_local() {
            Arc::new(LocalSocketProvider)
        } else {
            Arc::new(RemoteSocketProvider::new(
                config.connection.nodelay,
                config.connection.keepalive,
                config.connection.keepalive_time_ms.map(Duration::from_millis),
            ))
        };
        Self { config, provider }
    }

    pub fn with_provider(config: BusServerConfig, provider: Arc<dyn SocketProvider>) -> Self {
        Self { config, provider }
    }

    /// Binds the listen address and starts the accept thread.
    pub fn start(self, handler: Arc<dyn MessageHandler>) -> Result<BusServerHandle, BusError> {
        let listener = self.bind_with_retry()?;
        listener
            .set_nonblocking(true)
            .map_err(|err| BusError::io("set nonblocking", &err))?;
        let local_addr = listener.local_addr();
        info!(addr = %self.config.listen, "bus server listening");

        let live = Arc::new(RwLock::new(HashMap::new()));
        let slots = ConnectionSlots::new(self.config.max_connections);
        let counters = Arc::new(ServerCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let join = {
            let provider = self.provider.clone();
            let config = self.config.clone();
            let live = live.clone();
            let slots = slots.clone();
            let counters = counters.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                run_accept_loop(
                    listener, provider, handler, config, live, slots, counters, shutdown,
                )
            })
        };
        Ok(BusServerHandle {
            shutdown,
            join: Some(join),
            local_addr,
            live,
            counters,
        })
    }

    fn bind_with_retry(&self) -> Result<BusListener, BusError> {
        let attempts = self.config.bind_retry_count.max(1);
        let backoff = Duration::from_millis(self.config.bind_retry_backoff_ms);
        let mut last_err: Option<io::Error> = None;
        for attempt in 1..=attempts {
            match self.provider.create_server_socket(&self.config.listen) {
                Ok(listener) => return Ok(listener),
                Err(err) => {
                    warn!(addr = %self.config.listen, attempt, error = %err, "bus bind failed");
                    last_err = Some(err);
                    if attempt < attempts {
                        thread::sleep(backoff);
                    }
                }
            }
        }
        Err(BusError::BindFailed {
            addr: self.config.listen.to_string(),
            attempts,
            message: last_err.map(|err| err.to_string()).unwrap_or_default(),
        })
    }
}

#[derive(Debug)]
pub struct BusServerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    live: Arc<RwLock<HashMap<Uuid, BusConnection>>>,
    counters: Arc<ServerCounters>,
}

impl BusServerHandle {
    /// The bound TCP address; handy after listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.live.read().expect("live set lock poisoned").len()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            live: self.connection_count(),
        }
    }

    /// Stops accepting, terminates every live connection, and waits for
    /// their teardown to finish.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
        let connections: Vec<BusConnection> = {
            let mut live = self.live.write().expect("live set lock poisoned");
            live.drain().map(|(_, connection)| connection).collect()
        };
        for connection in &connections {
            connection.terminate(BusError::ServerStopped);
        }
        for connection in &connections {
            connection.wait_closed();
        }
        info!("bus server stopped");
    }
}

#[allow(clippy::too_many_arguments)]
fn run_accept_loop(
    listener: BusListener,
    provider: Arc<dyn SocketProvider>,
    handler: Arc<dyn MessageHandler>,
    config: BusServerConfig,
    live: Arc<RwLock<HashMap<Uuid, BusConnection>>>,
    slots: Arc<ConnectionSlots>,
    counters: Arc<ServerCounters>,
    shutdown: Arc<AtomicBool>,
) {
    let check_period = Duration::from_millis(config.check_period_ms.max(1));
    let read_stall = config.read_stall_timeout_ms.map(Duration::from_millis);
    let write_stall = config.write_stall_timeout_ms.map(Duration::from_millis);
    let mut last_check = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                handle_accept(
                    stream, peer, &provider, &handler, &config, &live, &slots, &counters,
                );
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!(error = %err, "bus accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
        if (read_stall.is_some() || write_stall.is_some())
            && last_check.elapsed() >= check_period
        {
            last_check = Instant::now();
            probe_stalls(&live, read_stall, write_stall);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_accept(
    stream: BusStream,
    peer: String,
    provider: &Arc<dyn SocketProvider>,
    handler: &Arc<dyn MessageHandler>,
    config: &BusServerConfig,
    live: &Arc<RwLock<HashMap<Uuid, BusConnection>>>,
    slots: &Arc<ConnectionSlots>,
    counters: &Arc<ServerCounters>,
) {
    let Some(permit) = slots.try_acquire() else {
        counters.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::connection_rejected();
        warn!(peer = %peer, "bus connection rejected: admission limit reached");
        return;
    };
    counters.accepted.fetch_add(1, Ordering::Relaxed);
    metrics::connection_accepted();
    if let Err(err) = provider.init_client_socket(&stream) {
        warn!(peer = %peer, error = %err, "bus socket setup failed; dropping connection");
        return;
    }
    let connection = BusConnection::new_unstarted(peer, config.connection.clone());
    let id = connection.id();
    live.write()
        .expect("live set lock poisoned")
        .insert(id, connection.clone());
    let live = live.clone();
    connection.on_terminated(move |_error| {
        live.write().expect("live set lock poisoned").remove(&id);
        drop(permit);
    });
    connection.start_io(stream, handler.clone());
}

fn probe_stalls(
    live: &Arc<RwLock<HashMap<Uuid, BusConnection>>>,
    read_stall: Option<Duration>,
    write_stall: Option<Duration>,
) {
    let snapshot: Vec<BusConnection> = live
        .read()
        .expect("live set lock poisoned")
        .values()
        .cloned()
        .collect();
    for connection in snapshot {
        if let Some(error) = connection.stall_error(read_stall, write_stall) {
            warn!(connection = %connection.id(), peer = %connection.peer(), error = %error,
                "terminating stalled bus connection");
            connection.terminate(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_slots_enforce_limit() {
        let slots = ConnectionSlots::new(Some(2));
        let first = slots.try_acquire().unwrap();
        let _second = slots.try_acquire().unwrap();
        assert!(slots.try_acquire().is_none());
        drop(first);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn unlimited_slots_never_refuse() {
        let slots = ConnectionSlots::new(None);
        let permits: Vec<_> = (0..64).map(|_| slots.try_acquire().unwrap()).collect();
        assert_eq!(permits.len(), 64);
    }

    #[test]
    fn config_defaults_from_empty_toml() {
        let config: BusServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.bind_retry_count, 5);
        assert_eq!(config.bind_retry_backoff_ms, 1_000);
        assert_eq!(config.check_period_ms, 15_000);
        assert!(config.max_connections.is_none());
        assert!(config.read_stall_timeout_ms.is_none());
        assert!(matches!(config.listen, BusAddr::Tcp(ref addr) if addr == "127.0.0.1:0"));
    }
}
