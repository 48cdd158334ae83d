//! Socket abstraction for the bus: TCP and unix-domain transports behind
//! one stream/listener pair, plus the provider hook that lets callers
//! swap in their own socket setup.

use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};

/// Bus endpoint address.
///
/// In config files this serializes as `{ tcp = "host:port" }` or
/// `{ unix = "/path/to.sock" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusAddr {
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl BusAddr {
    pub fn tcp(spec: impl Into<String>) -> Self {
        BusAddr::Tcp(spec.into())
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        BusAddr::Unix(path.into())
    }

    pub fn is_local(&self) -> bool {
        match self {
            BusAddr::Tcp(_) => false,
            #[cfg(unix)]
            BusAddr::Unix(_) => true,
        }
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddr::Tcp(spec) => write!(f, "tcp://{spec}"),
            #[cfg(unix)]
            BusAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

pub enum BusListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl BusListener {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            BusListener::Tcp(listener) => listener.set_nonblocking(nonblocking),
            #[cfg(unix)]
            BusListener::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    /// Accepts one connection, returning the stream and a peer label for logs.
    pub fn accept(&self) -> io::Result<(BusStream, String)> {
        match self {
            BusListener::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                Ok((BusStream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            BusListener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Ok((BusStream::Unix(stream), "local".to_string()))
            }
        }
    }

    /// The bound TCP address, if this is a TCP listener. Useful after
    /// binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BusListener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            BusListener::Unix(_) => None,
        }
    }
}

pub enum BusStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl BusStream {
    pub fn try_clone(&self) -> io::Result<BusStream> {
        match self {
            BusStream::Tcp(stream) => stream.try_clone().map(BusStream::Tcp),
            #[cfg(unix)]
            BusStream::Unix(stream) => stream.try_clone().map(BusStream::Unix),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            BusStream::Tcp(stream) => stream.shutdown(how),
            #[cfg(unix)]
            BusStream::Unix(stream) => stream.shutdown(how),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            BusStream::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            BusStream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            BusStream::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(unix)]
            BusStream::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }

    pub fn peer_label(&self) -> String {
        match self {
            BusStream::Tcp(stream) => match stream.peer_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "unknown".to_string(),
            },
            #[cfg(unix)]
            BusStream::Unix(_) => "local".to_string(),
        }
    }
}

impl Read for BusStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BusStream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            BusStream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for BusStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BusStream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            BusStream::Unix(stream) => stream.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            BusStream::Tcp(stream) => stream.write_vectored(bufs),
            #[cfg(unix)]
            BusStream::Unix(stream) => stream.write_vectored(bufs),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BusStream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            BusStream::Unix(stream) => stream.flush(),
        }
    }
}

/// Connects with a timeout, trying every resolved candidate for TCP specs.
pub fn connect(addr: &BusAddr, timeout: Duration) -> io::Result<BusStream> {
    match addr {
        BusAddr::Tcp(spec) => {
            let mut last_err = None;
            for candidate in spec.to_socket_addrs()? {
                match TcpStream::connect_timeout(&candidate, timeout) {
                    Ok(stream) => return Ok(BusStream::Tcp(stream)),
                    Err(err) => last_err = Some(err),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
            }))
        }
        #[cfg(unix)]
        BusAddr::Unix(path) => UnixStream::connect(path).map(BusStream::Unix),
    }
}

/// Hook for socket creation and per-connection setup. The default
/// implementations cover TCP and unix-domain sockets; tests and embedders
/// can substitute their own.
pub trait SocketProvider: Send + Sync + 'static {
    fn create_server_socket(&self, addr: &BusAddr) -> io::Result<BusListener>;
    fn init_client_socket(&self, stream: &BusStream) -> io::Result<()>;
}

fn bind_listener(addr: &BusAddr) -> io::Result<BusListener> {
    match addr {
        BusAddr::Tcp(spec) => TcpListener::bind(spec.as_str()).map(BusListener::Tcp),
        #[cfg(unix)]
        BusAddr::Unix(path) => {
            remove_stale_socket(path)?;
            UnixListener::bind(path).map(BusListener::Unix)
        }
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Provider for cross-host endpoints: disables Nagle and turns on TCP
/// keep-alive so dead peers surface as errors instead of silence.
pub struct RemoteSocketProvider {
    nodelay: bool,
    keepalive: bool,
    keepalive_time: Option<Duration>,
}

impl RemoteSocketProvider {
    pub fn new(nodelay: bool, keepalive: bool, keepalive_time: Option<Duration>) -> Self {
        Self {
            nodelay,
            keepalive,
            keepalive_time,
        }
    }
}

impl SocketProvider for RemoteSocketProvider {
    fn create_server_socket(&self, addr: &BusAddr) -> io::Result<BusListener> {
        bind_listener(addr)
    }

    fn init_client_socket(&self, stream: &BusStream) -> io::Result<()> {
        match stream {
            BusStream::Tcp(tcp) => {
                tcp.set_nodelay(self.nodelay)?;
                if self.keepalive {
                    let sock = SockRef::from(tcp);
                    sock.set_keepalive(true)?;
                    if let Some(time) = self.keepalive_time {
                        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
                    }
                }
                Ok(())
            }
            #[cfg(unix)]
            BusStream::Unix(_) => Ok(()),
        }
    }
}

/// Provider for same-host endpoints: plain sockets, no TCP tuning.
pub struct LocalSocketProvider;

impl SocketProvider for LocalSocketProvider {
    fn create_server_socket(&self, addr: &BusAddr) -> io::Result<BusListener> {
        bind_listener(addr)
    }

    fn init_client_socket(&self, _stream: &BusStream) -> io::Result<()> {
        Ok(())
    }
}
