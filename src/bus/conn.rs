//! A single bus connection: one socket, a writer thread draining a command
//! queue into vectored writes, and a reader thread decoding packets.
//!
//! Lifecycle: `Opening` until the socket is live, `Open` while the threads
//! run, `Closed` after teardown. The first terminal error wins; every later
//! failure on the same connection resolves against it. Teardown always runs
//! the same sequence: shut the socket, join the reader, fail unacked sends,
//! fail queued sends, fire termination callbacks once, release waiters.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::MessageHandler;
use crate::bus::error::BusError;
use crate::bus::frame::{
    DEFAULT_MAX_PART_BYTES, DEFAULT_MAX_PART_COUNT, FLAG_ACK_REQUESTED, CodecLimits, Message,
    Packet, PacketDecoder, PacketEncoder, PacketId, PacketType,
};
use crate::bus::socket::{
    self, BusAddr, BusStream, LocalSocketProvider, RemoteSocketProvider, SocketProvider,
};

// ===== Configuration =====

fn default_read_chunk_bytes() -> usize {
    16 * 1024
}

fn default_direct_read_threshold() -> usize {
    16 * 1024
}

fn default_fragment_count_threshold() -> usize {
    64
}

fn default_max_part_count() -> u32 {
    DEFAULT_MAX_PART_COUNT
}

fn default_max_part_bytes() -> usize {
    DEFAULT_MAX_PART_BYTES
}

fn default_write_timeout_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConnectionConfig {
    /// Size of the reader's scratch buffer for coalesced small reads.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    /// Spans at least this large are read straight into the packet buffer.
    #[serde(default = "default_direct_read_threshold")]
    pub direct_read_threshold: usize,
    /// The writer batches encoded fragments up to this count per vectored write.
    #[serde(default = "default_fragment_count_threshold")]
    pub fragment_count_threshold: usize,
    #[serde(default = "default_max_part_count")]
    pub max_part_count: u32,
    #[serde(default = "default_max_part_bytes")]
    pub max_part_bytes: usize,
    /// Socket write timeout; expiry just re-polls the terminal state.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub nodelay: bool,
    #[serde(default = "default_true")]
    pub keepalive: bool,
    #[serde(default)]
    pub keepalive_time_ms: Option<u64>,
}

impl Default for BusConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: default_read_chunk_bytes(),
            direct_read_threshold: default_direct_read_threshold(),
            fragment_count_threshold: default_fragment_count_threshold(),
            max_part_count: default_max_part_count(),
            max_part_bytes: default_max_part_bytes(),
            write_timeout_ms: default_write_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            nodelay: default_true(),
            keepalive: default_true(),
            keepalive_time_ms: None,
        }
    }
}

impl BusConnectionConfig {
    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_part_count: self.max_part_count,
            max_part_bytes: self.max_part_bytes,
        }
    }
}

// ===== Send handles =====

/// How far a send is tracked before its handle resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryTracking {
    /// Resolve as soon as the message is queued.
    None,
    /// Resolve once the bytes are handed to the socket.
    ErrorOnly,
    /// Resolve once the peer acknowledges the packet.
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub tracking: DeliveryTracking,
}

/// Resolves exactly once per send.
pub struct SendHandle {
    rx: Receiver<Result<(), BusError>>,
}

impl SendHandle {
    fn ready(result: Result<(), BusError>) -> Self {
        let (tx, rx) = channel::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    /// Blocks until the send resolves.
    pub fn wait(self) -> Result<(), BusError> {
        self.rx.recv().unwrap_or_else(|_| Err(BusError::Aborted))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), BusError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(BusError::Aborted)),
        }
    }

    pub fn try_wait(&self) -> Option<Result<(), BusError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(BusError::Aborted)),
        }
    }
}

// ===== Connection =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Opening,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pending_sends: usize,
    pub unacked: usize,
}

struct OutboundPacket {
    packet_type: PacketType,
    packet_id: PacketId,
    message: Message,
    tracking: DeliveryTracking,
    completion: Option<Sender<Result<(), BusError>>>,
}

enum WriterCommand {
    Packet(OutboundPacket),
    /// Nudges a blocked writer so it rechecks the terminal state.
    Wake,
}

struct UnackedEntry {
    packet_id: PacketId,
    completion: Option<Sender<Result<(), BusError>>>,
}

struct TerminateCallbacks {
    fired: Option<BusError>,
    subs: Vec<Box<dyn FnOnce(BusError) + Send>>,
}

/// Zero-capacity channel whose sender is dropped on release; every pending
/// and future `recv` then returns immediately.
struct ClosedLatch {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl ClosedLatch {
    fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    fn release(&self) {
        self.tx.lock().expect("closed latch lock poisoned").take();
    }

    fn wait(&self) {
        let _ = self.rx.recv();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

struct ConnInner {
    id: Uuid,
    peer: String,
    config: BusConnectionConfig,
    state: AtomicU8,
    terminal: Mutex<Option<BusError>>,
    cmd_tx: Sender<WriterCommand>,
    cmd_rx: Receiver<WriterCommand>,
    unacked: Mutex<VecDeque<UnackedEntry>>,
    stream: Mutex<Option<BusStream>>,
    closed: ClosedLatch,
    callbacks: Mutex<TerminateCallbacks>,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    epoch: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

#[derive(Clone)]
pub struct BusConnection {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConnection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl BusConnection {
    pub(crate) fn new_unstarted(peer: String, config: BusConnectionConfig) -> BusConnection {
        let (cmd_tx, cmd_rx) = channel::unbounded();
        BusConnection {
            inner: Arc::new(ConnInner {
                id: Uuid::new_v4(),
                peer,
                config,
                state: AtomicU8::new(0),
                terminal: Mutex::new(None),
                cmd_tx,
                cmd_rx,
                unacked: Mutex::new(VecDeque::new()),
                stream: Mutex::new(None),
                closed: ClosedLatch::new(),
                callbacks: Mutex::new(TerminateCallbacks {
                    fired: None,
                    subs: Vec::new(),
                }),
                packets_sent: AtomicU64::new(0),
                packets_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                epoch: Instant::now(),
                last_read_ms: AtomicU64::new(0),
                last_write_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// The first terminal error, if the connection has failed.
    pub fn terminal_error(&self) -> Option<BusError> {
        self.inner
            .terminal
            .lock()
            .expect("terminal lock poisoned")
            .clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.inner.packets_sent.load(Ordering::Relaxed),
            packets_received: self.inner.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            pending_sends: self.inner.cmd_rx.len(),
            unacked: self.inner.unacked.lock().expect("unacked lock poisoned").len(),
        }
    }

    /// Sends with full delivery tracking.
    pub fn send(&self, message: Message) -> SendHandle {
        self.send_with(message, SendOptions::default())
    }

    pub fn send_with(&self, message: Message, options: SendOptions) -> SendHandle {
        if let Some(error) = self.refuse_reason() {
            return SendHandle::ready(Err(error));
        }
        let (completion, handle) = match options.tracking {
            DeliveryTracking::None => (None, SendHandle::ready(Ok(()))),
            DeliveryTracking::ErrorOnly | DeliveryTracking::Full => {
                let (tx, rx) = channel::bounded(1);
                (Some(tx), SendHandle { rx })
            }
        };
        let command = WriterCommand::Packet(OutboundPacket {
            packet_type: PacketType::Message,
            packet_id: Uuid::new_v4(),
            message,
            tracking: options.tracking,
            completion,
        });
        if self.inner.cmd_tx.send(command).is_err() {
            return SendHandle::ready(Err(self.close_error()));
        }
        if self.state() == ConnectionState::Closed {
            // The writer is already gone; nothing else will drain the queue.
            drain_refused(&self.inner);
        }
        handle
    }

    /// Latches `error` as the terminal error if none is set yet and kicks
    /// both I/O threads loose. Safe to call any number of times.
    pub fn terminate(&self, error: BusError) {
        let first = {
            let mut terminal = self.inner.terminal.lock().expect("terminal lock poisoned");
            if terminal.is_some() {
                false
            } else {
                debug!(connection = %self.inner.id, peer = %self.inner.peer, error = %error,
                    "bus connection terminating");
                *terminal = Some(error);
                true
            }
        };
        if !first {
            return;
        }
        let _ = self.inner.cmd_tx.send(WriterCommand::Wake);
        if let Some(stream) = self
            .inner
            .stream
            .lock()
            .expect("stream lock poisoned")
            .as_ref()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Registers a callback for the terminal error. Fires immediately if the
    /// connection already went down; otherwise exactly once at teardown.
    pub fn on_terminated(&self, callback: impl FnOnce(BusError) + Send + 'static) {
        let mut callbacks = self.inner.callbacks.lock().expect("callback lock poisoned");
        if let Some(error) = callbacks.fired.clone() {
            drop(callbacks);
            callback(error);
        } else {
            callbacks.subs.push(Box::new(callback));
        }
    }

    /// Blocks until teardown has fully finished.
    pub fn wait_closed(&self) {
        self.inner.closed.wait();
    }

    /// Returns true once teardown has fully finished.
    pub fn wait_closed_timeout(&self, timeout: Duration) -> bool {
        self.inner.closed.wait_timeout(timeout)
    }

    /// Checks the connection for stalled I/O: a read stall means the peer
    /// owes acks but nothing has arrived, a write stall means commands are
    /// queued but nothing has left.
    pub fn stall_error(
        &self,
        read_stall: Option<Duration>,
        write_stall: Option<Duration>,
    ) -> Option<BusError> {
        let now_ms = self.inner.epoch.elapsed().as_millis() as u64;
        if let Some(limit) = read_stall {
            let waiting = !self
                .inner
                .unacked
                .lock()
                .expect("unacked lock poisoned")
                .is_empty();
            let idle = now_ms.saturating_sub(self.inner.last_read_ms.load(Ordering::Relaxed));
            if waiting && idle > limit.as_millis() as u64 {
                return Some(BusError::Stalled { what: "read" });
            }
        }
        if let Some(limit) = write_stall {
            let queued = !self.inner.cmd_rx.is_empty();
            let idle = now_ms.saturating_sub(self.inner.last_write_ms.load(Ordering::Relaxed));
            if queued && idle > limit.as_millis() as u64 {
                return Some(BusError::Stalled { what: "write" });
            }
        }
        None
    }

    pub(crate) fn start_io(&self, stream: BusStream, handler: Arc<dyn MessageHandler>) {
        let control = match stream.try_clone() {
            Ok(control) => control,
            Err(err) => {
                self.terminate(BusError::io("clone socket", &err));
                close_connection(&self.inner, None, VecDeque::new());
                return;
            }
        };
        *self.inner.stream.lock().expect("stream lock poisoned") = Some(control);
        self.inner.state.store(1, Ordering::Release);
        debug!(connection = %self.inner.id, peer = %self.inner.peer, "bus connection open");
        let inner = self.inner.clone();
        thread::spawn(move || run_writer(inner, stream, handler));
    }

    pub(crate) fn finish_without_io(&self) {
        close_connection(&self.inner, None, VecDeque::new());
    }

    fn refuse_reason(&self) -> Option<BusError> {
        if let Some(error) = self.terminal_error() {
            return Some(error);
        }
        if self.state() == ConnectionState::Closed {
            return Some(BusError::Closed);
        }
        None
    }

    fn close_error(&self) -> BusError {
        self.terminal_error().unwrap_or(BusError::Closed)
    }

    fn is_terminated(&self) -> bool {
        self.inner
            .terminal
            .lock()
            .expect("terminal lock poisoned")
            .is_some()
    }

    fn enqueue_ack(&self, packet_id: PacketId) {
        let command = WriterCommand::Packet(OutboundPacket {
            packet_type: PacketType::Ack,
            packet_id,
            message: Message::new(),
            tracking: DeliveryTracking::None,
            completion: None,
        });
        let _ = self.inner.cmd_tx.send(command);
    }

    /// Matches an inbound ack against the oldest unacked send. Acks arrive
    /// in send order on a well-behaved peer; anything else is a protocol
    /// violation.
    fn note_ack(&self, packet_id: PacketId) -> Result<(), BusError> {
        let entry = {
            let mut unacked = self.inner.unacked.lock().expect("unacked lock poisoned");
            match unacked.front() {
                None => {
                    return Err(BusError::Protocol {
                        reason: "unexpected ack received".to_string(),
                    });
                }
                Some(front) if front.packet_id != packet_id => {
                    return Err(BusError::Protocol {
                        reason: format!(
                            "ack for invalid packet id: expected {} got {}",
                            front.packet_id, packet_id
                        ),
                    });
                }
                Some(_) => unacked.pop_front(),
            }
        };
        if let Some(UnackedEntry {
            completion: Some(tx),
            ..
        }) = entry
        {
            let _ = tx.send(Ok(()));
        }
        Ok(())
    }
}

/// Opens a client connection. Returns immediately; the socket is connected
/// on a background thread and sends issued meanwhile are queued.
pub fn dial(
    addr: &BusAddr,
    config: BusConnectionConfig,
    handler: Arc<dyn MessageHandler>,
) -> BusConnection {
    let connection = BusConnection::new_unstarted(addr.to_string(), config);
    let conn = connection.clone();
    let addr = addr.clone();
    thread::spawn(move || {
        let config = &conn.inner.config;
        let provider: Box<dyn SocketProvider> = if addr.is_local() {
            Box::new(LocalSocketProvider)
        } else {
            Box::new(RemoteSocketProvider::new(
                config.nodelay,
                config.keepalive,
                config.keepalive_time_ms.map(Duration::from_millis),
            ))
        };
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        match socket::connect(&addr, timeout) {
            Ok(stream) => {
                if let Err(err) = provider.init_client_socket(&stream) {
                    warn!(peer = %addr, error = %err, "bus socket setup failed");
                }
                conn.start_io(stream, handler);
            }
            Err(err) => {
                debug!(peer = %addr, error = %err, "bus connect failed");
                conn.terminate(BusError::io("connect", &err));
                conn.finish_without_io();
            }
        }
    });
    connection
}

// ===== Writer =====

const WRITER_POLL: Duration = Duration::from_millis(50);

struct InFlight {
    fragments_remaining: usize,
    completion: Option<Sender<Result<(), BusError>>>,
}

fn run_writer(inner: Arc<ConnInner>, mut stream: BusStream, handler: Arc<dyn MessageHandler>) {
    let connection = BusConnection {
        inner: inner.clone(),
    };
    let write_timeout = Duration::from_millis(inner.config.write_timeout_ms.max(1));
    if let Err(err) = stream.set_write_timeout(Some(write_timeout)) {
        warn!(connection = %inner.id, error = %err, "failed to set bus write timeout");
    }
    let reader = match stream.try_clone() {
        Ok(reader_stream) => {
            let reader_inner = inner.clone();
            let reader_handler = handler.clone();
            Some(thread::spawn(move || {
                run_reader(reader_inner, reader_stream, reader_handler)
            }))
        }
        Err(err) => {
            connection.terminate(BusError::io("clone socket", &err));
            None
        }
    };

    let mut encoder = PacketEncoder::new(inner.config.codec_limits());
    let mut fragments: VecDeque<Bytes> = VecDeque::new();
    let mut in_flight: VecDeque<InFlight> = VecDeque::new();

    loop {
        if connection.is_terminated() {
            break;
        }
        // Top up the fragment window before touching the socket.
        while fragments.len() < inner.config.fragment_count_threshold {
            match inner.cmd_rx.try_recv() {
                Ok(WriterCommand::Packet(packet)) => {
                    encode_packet(&inner, &mut encoder, &mut fragments, &mut in_flight, packet);
                }
                Ok(WriterCommand::Wake) => {}
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        if fragments.is_empty() {
            match inner.cmd_rx.recv_timeout(WRITER_POLL) {
                Ok(WriterCommand::Packet(packet)) => {
                    encode_packet(&inner, &mut encoder, &mut fragments, &mut in_flight, packet);
                }
                Ok(WriterCommand::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            continue;
        }

        let slices: Vec<IoSlice<'_>> = fragments.iter().map(|chunk| IoSlice::new(chunk)).collect();
        match stream.write_vectored(&slices) {
            Ok(0) => {
                connection.terminate(BusError::Io {
                    context: "write",
                    kind: io::ErrorKind::WriteZero,
                    message: "socket accepted no bytes".to_string(),
                });
                break;
            }
            Ok(written) => {
                note_write(&inner, written);
                consume_written(&inner, &mut fragments, &mut in_flight, written);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                connection.terminate(BusError::io("write", &err));
                break;
            }
        }
    }

    close_connection(&inner, reader, in_flight);
}

fn encode_packet(
    inner: &Arc<ConnInner>,
    encoder: &mut PacketEncoder,
    fragments: &mut VecDeque<Bytes>,
    in_flight: &mut VecDeque<InFlight>,
    packet: OutboundPacket,
) {
    let flags = if packet.packet_type == PacketType::Message
        && packet.tracking == DeliveryTracking::Full
    {
        FLAG_ACK_REQUESTED
    } else {
        0
    };
    if !encoder.start(packet.packet_type, flags, packet.packet_id, &packet.message) {
        warn!(connection = %inner.id, parts = packet.message.part_count(),
            bytes = packet.message.total_bytes(), "dropping message that exceeds codec limits");
        if let Some(tx) = packet.completion {
            let _ = tx.send(Err(BusError::Framing {
                reason: "message exceeds codec limits".to_string(),
            }));
        }
        return;
    }
    let mut count = 0;
    while let Some(chunk) = encoder.chunk().cloned() {
        fragments.push_back(chunk);
        count += 1;
        encoder.next_chunk();
    }
    // Tracked sends join the unacked queue as soon as their bytes are
    // committed to the wire order; the reader may see the ack before the
    // local write accounting finishes.
    let completion = if packet.tracking == DeliveryTracking::Full
        && packet.packet_type == PacketType::Message
    {
        inner
            .unacked
            .lock()
            .expect("unacked lock poisoned")
            .push_back(UnackedEntry {
                packet_id: packet.packet_id,
                completion: packet.completion,
            });
        None
    } else {
        packet.completion
    };
    in_flight.push_back(InFlight {
        fragments_remaining: count,
        completion,
    });
}

fn consume_written(
    inner: &Arc<ConnInner>,
    fragments: &mut VecDeque<Bytes>,
    in_flight: &mut VecDeque<InFlight>,
    mut written: usize,
) {
    while written > 0 {
        let Some(front) = fragments.front_mut() else {
            break;
        };
        if written < front.len() {
            front.advance(written);
            break;
        }
        written -= front.len();
        fragments.pop_front();
        let finished = match in_flight.front_mut() {
            Some(head) => {
                head.fragments_remaining -= 1;
                head.fragments_remaining == 0
            }
            None => false,
        };
        if finished && let Some(done) = in_flight.pop_front() {
            finish_packet(inner, done);
        }
    }
}

fn finish_packet(inner: &Arc<ConnInner>, packet: InFlight) {
    inner.packets_sent.fetch_add(1, Ordering::Relaxed);
    if let Some(tx) = packet.completion {
        let _ = tx.send(Ok(()));
    }
}

fn note_write(inner: &ConnInner, n: usize) {
    inner.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    inner
        .last_write_ms
        .store(inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
}

fn note_read(inner: &ConnInner, n: usize) {
    inner.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    inner
        .last_read_ms
        .store(inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
}

// ===== Reader =====

fn run_reader(inner: Arc<ConnInner>, mut stream: BusStream, handler: Arc<dyn MessageHandler>) {
    let connection = BusConnection {
        inner: inner.clone(),
    };
    let mut decoder = PacketDecoder::new(inner.config.codec_limits());
    let mut scratch = vec![0u8; inner.config.read_chunk_bytes.max(1)];

    loop {
        if connection.is_terminated() {
            break;
        }
        let span_len = decoder.chunk().len();
        if span_len >= inner.config.direct_read_threshold {
            // Large span: read straight into the packet buffer.
            let n = match stream.read(decoder.chunk()) {
                Ok(0) => {
                    connection.terminate(BusError::PeerClosed);
                    break;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    connection.terminate(BusError::io("read", &err));
                    break;
                }
            };
            note_read(&inner, n);
            if !feed(&connection, &mut decoder, &handler, n) {
                break;
            }
        } else {
            let n = match stream.read(&mut scratch) {
                Ok(0) => {
                    connection.terminate(BusError::PeerClosed);
                    break;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    connection.terminate(BusError::io("read", &err));
                    break;
                }
            };
            note_read(&inner, n);
            let mut pos = 0;
            let mut healthy = true;
            while pos < n && healthy {
                let span = decoder.chunk();
                let take = span.len().min(n - pos);
                span[..take].copy_from_slice(&scratch[pos..pos + take]);
                pos += take;
                healthy = feed(&connection, &mut decoder, &handler, take);
            }
            if !healthy {
                break;
            }
        }
    }
}

/// Advances the decoder and dispatches any completed packet. Returns false
/// when the connection must come down.
fn feed(
    connection: &BusConnection,
    decoder: &mut PacketDecoder,
    handler: &Arc<dyn MessageHandler>,
    n: usize,
) -> bool {
    if !decoder.advance(n) {
        let reason = decoder.violation().unwrap_or("malformed packet");
        connection.terminate(BusError::Framing {
            reason: reason.to_string(),
        });
        return false;
    }
    if !decoder.is_finished() {
        return true;
    }
    let Some(packet) = decoder.take_packet() else {
        return true;
    };
    connection
        .inner
        .packets_received
        .fetch_add(1, Ordering::Relaxed);
    match packet.packet_type {
        PacketType::Ack => {
            if let Err(err) = connection.note_ack(packet.packet_id) {
                connection.terminate(err);
                return false;
            }
        }
        PacketType::Message => {
            // The ack goes out before the handler runs so a slow handler
            // cannot stall the peer's delivery tracking.
            if packet.flags & FLAG_ACK_REQUESTED != 0 {
                connection.enqueue_ack(packet.packet_id);
            }
            handler.handle_message(packet.message, connection);
        }
    }
    true
}

// ===== Teardown =====

fn close_connection(
    inner: &Arc<ConnInner>,
    reader: Option<thread::JoinHandle<()>>,
    in_flight: VecDeque<InFlight>,
) {
    let error = {
        let mut terminal = inner.terminal.lock().expect("terminal lock poisoned");
        terminal.get_or_insert(BusError::Closed).clone()
    };
    inner.state.store(2, Ordering::Release);
    if let Some(stream) = inner.stream.lock().expect("stream lock poisoned").take() {
        let _ = stream.shutdown(Shutdown::Both);
    }
    if let Some(handle) = reader {
        let _ = handle.join();
    }
    // Written but never acknowledged.
    let drained: Vec<UnackedEntry> = inner
        .unacked
        .lock()
        .expect("unacked lock poisoned")
        .drain(..)
        .collect();
    for entry in drained {
        if let Some(tx) = entry.completion {
            let _ = tx.send(Err(error.clone()));
        }
    }
    // Accepted by the writer but never fully written.
    for entry in in_flight {
        if let Some(tx) = entry.completion {
            let _ = tx.send(Err(error.clone()));
        }
    }
    // Still sitting in the command queue.
    drain_refused(inner);
    let subs = {
        let mut callbacks = inner.callbacks.lock().expect("callback lock poisoned");
        if callbacks.fired.is_some() {
            Vec::new()
        } else {
            callbacks.fired = Some(error.clone());
            std::mem::take(&mut callbacks.subs)
        }
    };
    for callback in subs {
        callback(error.clone());
    }
    crate::metrics::connection_terminated();
    debug!(connection = %inner.id, peer = %inner.peer, error = %error, "bus connection closed");
    inner.closed.release();
}

fn drain_refused(inner: &Arc<ConnInner>) {
    let error = inner
        .terminal
        .lock()
        .expect("terminal lock poisoned")
        .clone()
        .unwrap_or(BusError::Closed);
    while let Ok(command) = inner.cmd_rx.try_recv() {
        if let WriterCommand::Packet(packet) = command {
            if let Some(tx) = packet.completion {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}
