//! Message bus: framed packet transport over TCP or unix-domain sockets.
//!
//! A connection owns one socket and two threads (reader and writer). Sends
//! are enqueued from any thread and travel as `Message` packets; the peer
//! answers each tracked message with an `Ack` carrying the same packet id,
//! matched strictly in send order. The server accepts connections behind an
//! admission limit and probes the live set periodically for stalled peers.

pub mod conn;
pub mod error;
pub mod frame;
pub mod server;
pub mod socket;

pub use conn::{
    BusConnection, BusConnectionConfig, ConnectionState, ConnectionStats, DeliveryTracking,
    SendHandle, SendOptions, dial,
};
pub use error::BusError;
pub use frame::{
    CodecLimits, FLAG_ACK_REQUESTED, Message, Packet, PacketDecoder, PacketEncoder, PacketId,
    PacketType,
};
pub use server::{BusServer, BusServerConfig, BusServerHandle, ServerStats};
pub use socket::{
    BusAddr, BusListener, BusStream, LocalSocketProvider, RemoteSocketProvider, SocketProvider,
};

/// Handler invoked once per fully decoded inbound message.
///
/// The originating connection is passed alongside so handlers can reply on
/// the same socket. Handlers run on the connection's reader thread; a slow
/// handler delays further reads on that connection only.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(&self, message: Message, connection: &BusConnection);
}
