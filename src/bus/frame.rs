//! Bus packet framing: fixed header, part table, crc32c, raw part bytes.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! magic        : u32
//! packet type  : u8      (0 = ack, 1 = message)
//! flags        : u8
//! reserved     : u16     (must be zero)
//! packet id    : [u8; 16]
//! part count   : u32
//! part lengths : u32 * part count
//! header crc   : u32     (crc32c of all preceding bytes)
//! part bytes   : raw, in order, no per-part framing
//! ```
//!
//! The encoder yields the header and each non-empty part as separate
//! fragments so the writer can hand them to one vectored write without
//! copying part bytes. The decoder is fed incrementally and tolerates
//! arbitrary split points; structural violations are reported by return
//! value only and are fatal to the connection, never to the process.

use bytes::{BufMut, Bytes, BytesMut};
use crc32c::crc32c;
use uuid::Uuid;

pub const PACKET_MAGIC: u32 = u32::from_le_bytes(*b"MRB1");
pub const FIXED_HEADER_LEN: usize = 28;

/// Sender asks the peer to acknowledge this packet.
pub const FLAG_ACK_REQUESTED: u8 = 0b0000_0001;

pub const DEFAULT_MAX_PART_COUNT: u32 = 1 << 14;
pub const DEFAULT_MAX_PART_BYTES: usize = 64 << 20;

pub type PacketId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Ack,
    Message,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        match self {
            PacketType::Ack => 0,
            PacketType::Message => 1,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(PacketType::Ack),
            1 => Some(PacketType::Message),
            _ => None,
        }
    }
}

/// An ordered sequence of opaque binary parts.
///
/// Zero parts and zero-length parts are both valid and survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    parts: Vec<Bytes>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }

    pub fn single(part: impl Into<Bytes>) -> Self {
        Self {
            parts: vec![part.into()],
        }
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<Bytes> {
        self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.parts.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub flags: u8,
    pub packet_id: PacketId,
    pub message: Message,
}

#[derive(Debug, Clone, Copy)]
pub struct CodecLimits {
    pub max_part_count: u32,
    pub max_part_bytes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_part_count: DEFAULT_MAX_PART_COUNT,
            max_part_bytes: DEFAULT_MAX_PART_BYTES,
        }
    }
}

// ============================================================================
// Encoder
// ============================================================================

pub struct PacketEncoder {
    limits: CodecLimits,
    fragments: Vec<Bytes>,
    cursor: usize,
}

impl PacketEncoder {
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            limits,
            fragments: Vec::new(),
            cursor: 0,
        }
    }

    /// Prepares the encoder for one packet. Returns false when the message
    /// exceeds the codec limits; no fragments are produced in that case.
    pub fn start(
        &mut self,
        packet_type: PacketType,
        flags: u8,
        packet_id: PacketId,
        message: &Message,
    ) -> bool {
        self.fragments.clear();
        self.cursor = 0;

        if packet_type == PacketType::Ack && !message.is_empty() {
            return false;
        }
        if message.part_count() > self.limits.max_part_count as usize {
            return false;
        }
        for part in message.parts() {
            if part.len() > self.limits.max_part_bytes || part.len() > u32::MAX as usize {
                return false;
            }
        }

        let mut header =
            BytesMut::with_capacity(FIXED_HEADER_LEN + message.part_count() * 4 + 4);
        header.put_u32_le(PACKET_MAGIC);
        header.put_u8(packet_type.as_u8());
        header.put_u8(flags);
        header.put_u16_le(0);
        header.put_slice(packet_id.as_bytes());
        header.put_u32_le(message.part_count() as u32);
        for part in message.parts() {
            header.put_u32_le(part.len() as u32);
        }
        let crc = crc32c(&header);
        header.put_u32_le(crc);

        self.fragments.push(header.freeze());
        for part in message.parts() {
            if !part.is_empty() {
                self.fragments.push(part.clone());
            }
        }
        true
    }

    pub fn chunk(&self) -> Option<&Bytes> {
        self.fragments.get(self.cursor)
    }

    pub fn next_chunk(&mut self) {
        if self.cursor < self.fragments.len() {
            self.cursor += 1;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.fragments.len()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FixedHeader,
    PartTable,
    Part(usize),
    Done,
}

struct PendingHeader {
    packet_type: PacketType,
    flags: u8,
    packet_id: PacketId,
}

/// Incremental packet decoder.
///
/// `chunk()` exposes the exact span the decoder wants filled next; callers
/// read into it and report progress with `advance(n)`. A false return from
/// `advance` is a structural violation and the decoder stays poisoned until
/// `restart()`.
pub struct PacketDecoder {
    limits: CodecLimits,
    phase: Phase,
    header: Vec<u8>,
    parts: Vec<Vec<u8>>,
    filled: usize,
    pending: Option<PendingHeader>,
    violation: Option<&'static str>,
}

impl PacketDecoder {
    pub fn new(limits: CodecLimits) -> Self {
        let mut decoder = Self {
            limits,
            phase: Phase::FixedHeader,
            header: Vec::new(),
            parts: Vec::new(),
            filled: 0,
            pending: None,
            violation: None,
        };
        decoder.restart();
        decoder
    }

    pub fn restart(&mut self) {
        self.phase = Phase::FixedHeader;
        self.header.clear();
        self.header.resize(FIXED_HEADER_LEN, 0);
        self.parts.clear();
        self.filled = 0;
        self.pending = None;
        self.violation = None;
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Reason for the last structural violation, if any.
    pub fn violation(&self) -> Option<&'static str> {
        self.violation
    }

    /// The span the decoder needs filled next. Empty once a packet is ready.
    pub fn chunk(&mut self) -> &mut [u8] {
        match self.phase {
            Phase::FixedHeader | Phase::PartTable => &mut self.header[self.filled..],
            Phase::Part(i) => &mut self.parts[i][self.filled..],
            Phase::Done => &mut [],
        }
    }

    /// Folds in `n` freshly written bytes. Returns false on any structural
    /// violation; `violation()` then names the reason.
    pub fn advance(&mut self, n: usize) -> bool {
        if self.violation.is_some() {
            return false;
        }
        let needed = match self.phase {
            Phase::FixedHeader | Phase::PartTable => self.header.len() - self.filled,
            Phase::Part(i) => self.parts[i].len() - self.filled,
            Phase::Done => 0,
        };
        if n > needed {
            return self.fail("advance past the requested span");
        }
        self.filled += n;

        match self.phase {
            Phase::FixedHeader if self.filled == self.header.len() => self.finish_fixed_header(),
            Phase::PartTable if self.filled == self.header.len() => self.finish_part_table(),
            Phase::Part(i) if self.filled == self.parts[i].len() => {
                self.filled = 0;
                self.phase = self.next_part_phase(i + 1);
                true
            }
            _ => true,
        }
    }

    fn fail(&mut self, reason: &'static str) -> bool {
        self.violation = Some(reason);
        false
    }

    fn finish_fixed_header(&mut self) -> bool {
        let magic = u32::from_le_bytes([
            self.header[0],
            self.header[1],
            self.header[2],
            self.header[3],
        ]);
        if magic != PACKET_MAGIC {
            return self.fail("bad packet magic");
        }
        let Some(packet_type) = PacketType::from_u8(self.header[4]) else {
            return self.fail("unknown packet type");
        };
        let flags = self.header[5];
        let reserved = u16::from_le_bytes([self.header[6], self.header[7]]);
        if reserved != 0 {
            return self.fail("nonzero reserved field");
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&self.header[8..24]);
        let packet_id = Uuid::from_bytes(id);
        let part_count = u32::from_le_bytes([
            self.header[24],
            self.header[25],
            self.header[26],
            self.header[27],
        ]);
        if part_count > self.limits.max_part_count {
            return self.fail("part count exceeds limit");
        }
        if packet_type == PacketType::Ack && part_count != 0 {
            return self.fail("ack packet carries parts");
        }

        self.pending = Some(PendingHeader {
            packet_type,
            flags,
            packet_id,
        });
        self.header
            .resize(FIXED_HEADER_LEN + part_count as usize * 4 + 4, 0);
        self.phase = Phase::PartTable;
        true
    }

    fn finish_part_table(&mut self) -> bool {
        let crc_offset = self.header.len() - 4;
        let expected = u32::from_le_bytes([
            self.header[crc_offset],
            self.header[crc_offset + 1],
            self.header[crc_offset + 2],
            self.header[crc_offset + 3],
        ]);
        let actual = crc32c(&self.header[..crc_offset]);
        if actual != expected {
            return self.fail("header crc mismatch");
        }

        let part_count = (crc_offset - FIXED_HEADER_LEN) / 4;
        self.parts.clear();
        for i in 0..part_count {
            let at = FIXED_HEADER_LEN + i * 4;
            let len = u32::from_le_bytes([
                self.header[at],
                self.header[at + 1],
                self.header[at + 2],
                self.header[at + 3],
            ]) as usize;
            if len > self.limits.max_part_bytes {
                return self.fail("part length exceeds limit");
            }
            self.parts.push(vec![0u8; len]);
        }

        self.filled = 0;
        self.phase = self.next_part_phase(0);
        true
    }

    fn next_part_phase(&self, from: usize) -> Phase {
        for i in from..self.parts.len() {
            if !self.parts[i].is_empty() {
                return Phase::Part(i);
            }
        }
        Phase::Done
    }

    /// Takes the completed packet and restarts for the next one.
    pub fn take_packet(&mut self) -> Option<Packet> {
        if !self.is_finished() {
            return None;
        }
        let header = self.pending.take()?;
        let parts = std::mem::take(&mut self.parts)
            .into_iter()
            .map(Bytes::from)
            .collect();
        let packet = Packet {
            packet_type: header.packet_type,
            flags: header.flags,
            packet_id: header.packet_id,
            message: Message::from_parts(parts),
        };
        self.restart();
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_bytes(packet_type: PacketType, flags: u8, id: PacketId, message: &Message) -> Vec<u8> {
        let mut encoder = PacketEncoder::new(CodecLimits::default());
        assert!(encoder.start(packet_type, flags, id, message));
        let mut out = Vec::new();
        while let Some(chunk) = encoder.chunk() {
            out.extend_from_slice(chunk);
            encoder.next_chunk();
        }
        assert!(encoder.is_finished());
        out
    }

    fn decode_in_steps(wire: &[u8], step: usize) -> Packet {
        let mut decoder = PacketDecoder::new(CodecLimits::default());
        let mut offset = 0;
        while offset < wire.len() {
            let chunk = decoder.chunk();
            assert!(!chunk.is_empty(), "decoder wants no bytes before the end");
            let take = chunk.len().min(step).min(wire.len() - offset);
            chunk[..take].copy_from_slice(&wire[offset..offset + take]);
            assert!(decoder.advance(take), "unexpected violation: {:?}", decoder.violation());
            offset += take;
        }
        assert!(decoder.is_finished());
        decoder.take_packet().expect("finished packet")
    }

    #[test]
    fn message_roundtrip() {
        let id = Uuid::new_v4();
        let message = Message::from_parts(vec![
            Bytes::from_static(b"header"),
            Bytes::from_static(b"attachment-1"),
            Bytes::from_static(b"attachment-two"),
        ]);
        let wire = encode_bytes(PacketType::Message, FLAG_ACK_REQUESTED, id, &message);

        let packet = decode_in_steps(&wire, wire.len());
        assert_eq!(packet.packet_type, PacketType::Message);
        assert_eq!(packet.flags, FLAG_ACK_REQUESTED);
        assert_eq!(packet.packet_id, id);
        assert_eq!(packet.message, message);
    }

    #[test]
    fn ack_roundtrip_has_no_parts() {
        let id = Uuid::new_v4();
        let wire = encode_bytes(PacketType::Ack, 0, id, &Message::new());
        assert_eq!(wire.len(), FIXED_HEADER_LEN + 4);

        let packet = decode_in_steps(&wire, 3);
        assert_eq!(packet.packet_type, PacketType::Ack);
        assert_eq!(packet.packet_id, id);
        assert!(packet.message.is_empty());
    }

    #[test]
    fn zero_length_parts_survive() {
        let id = Uuid::new_v4();
        let message = Message::from_parts(vec![
            Bytes::new(),
            Bytes::from_static(b"x"),
            Bytes::new(),
        ]);
        let wire = encode_bytes(PacketType::Message, 0, id, &message);

        let packet = decode_in_steps(&wire, 1);
        assert_eq!(packet.message.part_count(), 3);
        assert_eq!(packet.message, message);
    }

    #[test]
    fn byte_at_a_time_decode() {
        let id = Uuid::new_v4();
        let message = Message::single(Bytes::from(vec![7u8; 300]));
        let wire = encode_bytes(PacketType::Message, 0, id, &message);

        let packet = decode_in_steps(&wire, 1);
        assert_eq!(packet.message, message);
    }

    #[test]
    fn two_packets_back_to_back() {
        let first = encode_bytes(PacketType::Message, 0, Uuid::new_v4(), &Message::single("a"));
        let ack = encode_bytes(PacketType::Ack, 0, Uuid::new_v4(), &Message::new());
        let mut wire = first;
        wire.extend_from_slice(&ack);

        let mut decoder = PacketDecoder::new(CodecLimits::default());
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < wire.len() {
            let chunk = decoder.chunk();
            let take = chunk.len().min(wire.len() - offset);
            chunk[..take].copy_from_slice(&wire[offset..offset + take]);
            assert!(decoder.advance(take));
            offset += take;
            if decoder.is_finished() {
                packets.push(decoder.take_packet().expect("packet"));
            }
        }
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet_type, PacketType::Message);
        assert_eq!(packets[1].packet_type, PacketType::Ack);
    }

    #[test]
    fn bad_magic_is_a_violation() {
        let mut wire = encode_bytes(PacketType::Message, 0, Uuid::new_v4(), &Message::single("a"));
        wire[0] ^= 0xff;

        let mut decoder = PacketDecoder::new(CodecLimits::default());
        let chunk = decoder.chunk();
        let take = chunk.len();
        chunk[..take].copy_from_slice(&wire[..take]);
        assert!(!decoder.advance(take));
        assert_eq!(decoder.violation(), Some("bad packet magic"));
    }

    #[test]
    fn corrupt_header_crc_is_a_violation() {
        let id = Uuid::new_v4();
        let mut wire = encode_bytes(PacketType::Message, 0, id, &Message::single("abc"));
        // Flip a bit in the part table.
        wire[FIXED_HEADER_LEN] ^= 0x01;

        let mut decoder = PacketDecoder::new(CodecLimits::default());
        let mut offset = 0;
        let mut ok = true;
        while offset < wire.len() && ok {
            let chunk = decoder.chunk();
            let take = chunk.len().min(wire.len() - offset);
            chunk[..take].copy_from_slice(&wire[offset..offset + take]);
            ok = decoder.advance(take);
            offset += take;
        }
        assert!(!ok);
        assert_eq!(decoder.violation(), Some("header crc mismatch"));
    }

    #[test]
    fn part_count_limit_enforced() {
        let limits = CodecLimits {
            max_part_count: 2,
            max_part_bytes: 1024,
        };
        let message = Message::from_parts(vec![Bytes::new(), Bytes::new(), Bytes::new()]);
        let mut encoder = PacketEncoder::new(limits);
        assert!(!encoder.start(PacketType::Message, 0, Uuid::new_v4(), &message));

        // A forged header with an oversized count is rejected by the decoder.
        let wire = encode_bytes(PacketType::Message, 0, Uuid::new_v4(), &message);
        let mut decoder = PacketDecoder::new(limits);
        let chunk = decoder.chunk();
        let take = chunk.len();
        chunk[..take].copy_from_slice(&wire[..take]);
        assert!(!decoder.advance(take));
        assert_eq!(decoder.violation(), Some("part count exceeds limit"));
    }

    #[test]
    fn encoder_rejects_oversized_part() {
        let limits = CodecLimits {
            max_part_count: 8,
            max_part_bytes: 4,
        };
        let mut encoder = PacketEncoder::new(limits);
        let message = Message::single(Bytes::from_static(b"too long"));
        assert!(!encoder.start(PacketType::Message, 0, Uuid::new_v4(), &message));
        assert_eq!(encoder.fragment_count(), 0);
    }

    #[test]
    fn encoder_rejects_ack_with_payload() {
        let mut encoder = PacketEncoder::new(CodecLimits::default());
        assert!(!encoder.start(PacketType::Ack, 0, Uuid::new_v4(), &Message::single("x")));
    }

    #[test]
    fn max_fragment_count_roundtrip() {
        let limits = CodecLimits::default();
        let parts: Vec<Bytes> = (0..100)
            .map(|i| Bytes::from(vec![i as u8; (i % 7) + 1]))
            .collect();
        let message = Message::from_parts(parts);
        let id = Uuid::new_v4();

        let mut encoder = PacketEncoder::new(limits);
        assert!(encoder.start(PacketType::Message, 0, id, &message));
        // Header plus one fragment per non-empty part.
        assert_eq!(encoder.fragment_count(), 101);

        let wire = encode_bytes(PacketType::Message, 0, id, &message);
        let packet = decode_in_steps(&wire, 17);
        assert_eq!(packet.message, message);
    }
}
