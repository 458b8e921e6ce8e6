//! Uplink wire format: every packet exchanged between two peers.
//!
//! ```text
//! [0]      packet type
//! [1..3]   CRC-16/CCITT-FALSE, little-endian
//! [3..]    type-specific payload
//! ```
//!
//! All integers and floats are little-endian. Names are a one-byte length
//! followed by UTF-8 bytes. The checksum covers the type byte and every
//! payload byte, so a corrupted type tag can never turn one valid packet
//! into another (Complete and Cancel differ by a single bit).
//!
//! `node_id` in every packet names the node that sent it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_IBM_3740};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::names::{AgentName, BoundedName, FileName, NodeName};

/// Small integer identifying a node on the link.
pub type NodeId = u8;

/// Transaction identifier, unique per (sending node, direction).
pub type TxId = u16;

// ── Header ────────────────────────────────────────────────────────────────────

/// Common header preceding every payload.
///
/// Wire size: 3 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// One of the `PacketKind` tags.
    pub kind: u8,
    /// Little-endian CRC over `kind` followed by the payload.
    pub checksum: [u8; 2],
}

assert_eq_size!(PacketHeader, [u8; 3]);

/// Header size in bytes.
pub const HEADER_SIZE: usize = 3;

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no xorout.
const CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum carried in the header for a packet of `kind` with `payload`.
pub fn checksum(kind: u8, payload: &[u8]) -> u16 {
    let mut digest = CCITT.digest();
    digest.update(&[kind]);
    digest.update(payload);
    digest.finalize()
}

// ── Packet kinds ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Command = 71,
    Message = 76,
    Heartbeat = 77,
    ReqQueue = 78,
    Queue = 79,
    Cancel = 80,
    Complete = 81,
    ReqMeta = 82,
    ReqData = 83,
    MetaLong = 84,
    Data = 85,
    MetaShort = 86,
    ReqComplete = 87,
    Raw = 88,
}

impl PacketKind {
    /// Smallest valid packet of this kind, header included.
    pub const fn min_len(self) -> usize {
        HEADER_SIZE
            + match self {
                // node_id, length
                PacketKind::Command | PacketKind::Message => 2,
                // node_id, name_len, beat_period, throughput, unix_time
                PacketKind::Heartbeat => 1 + 1 + 4 + 4 + 4,
                // node_id, name_len
                PacketKind::ReqQueue => 2,
                // node_id, name_len, tx_id
                PacketKind::Queue | PacketKind::ReqMeta => 1 + 1 + 2,
                // node_id, tx_id
                PacketKind::Cancel
                | PacketKind::Complete
                | PacketKind::ReqComplete
                | PacketKind::Raw => 1 + 2,
                // node_id, tx_id, hole_start, hole_end
                PacketKind::ReqData => 1 + 2 + 4 + 4,
                // name_len, tx_id, agent_len, file_len, file_size
                PacketKind::MetaLong => 1 + 2 + 1 + 1 + 8,
                // node_id, tx_id, byte_count, chunk_start
                PacketKind::Data => 1 + 2 + 4 + 4,
                // node_id, tx_id, agent_len, file_len, file_size
                PacketKind::MetaShort => 1 + 2 + 1 + 1 + 4,
            }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            71 => PacketKind::Command,
            76 => PacketKind::Message,
            77 => PacketKind::Heartbeat,
            78 => PacketKind::ReqQueue,
            79 => PacketKind::Queue,
            80 => PacketKind::Cancel,
            81 => PacketKind::Complete,
            82 => PacketKind::ReqMeta,
            83 => PacketKind::ReqData,
            84 => PacketKind::MetaLong,
            85 => PacketKind::Data,
            86 => PacketKind::MetaShort,
            87 => PacketKind::ReqComplete,
            88 => PacketKind::Raw,
            other => return Err(DecodeError::UnknownType(other)),
        })
    }
}

impl From<PacketKind> for u8 {
    fn from(kind: PacketKind) -> u8 {
        kind as u8
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Liveness and telemetry advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub node_name: NodeName,
    /// Seconds between heartbeats.
    pub beat_period: f32,
    /// Bytes per second the node can sustain.
    pub throughput: f32,
    pub unix_time: u32,
}

/// Free-form bytes for a Message or Command packet. At most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub node_id: NodeId,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqQueue {
    pub node_id: NodeId,
    pub node_name: NodeName,
}

/// Announces one active outgoing transaction. Also used for ReqMeta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAnnounce {
    pub node_id: NodeId,
    pub node_name: NodeName,
    pub tx_id: TxId,
}

/// Metadata identifying the origin node by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaLong {
    pub node_name: NodeName,
    pub tx_id: TxId,
    pub agent_name: AgentName,
    pub file_name: FileName,
    pub file_size: u64,
}

/// Metadata identifying the origin node by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaShort {
    pub node_id: NodeId,
    pub tx_id: TxId,
    pub agent_name: AgentName,
    pub file_name: FileName,
    pub file_size: u32,
}

/// Request for the bytes in `[hole_start, hole_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqData {
    pub node_id: NodeId,
    pub tx_id: TxId,
    pub hole_start: u32,
    pub hole_end: u32,
}

/// A contiguous run of file bytes starting at `chunk_start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub node_id: NodeId,
    pub tx_id: TxId,
    pub chunk_start: u32,
    pub chunk: Bytes,
}

impl Data {
    pub fn byte_count(&self) -> u32 {
        self.chunk.len() as u32
    }

    /// Exclusive end offset of the chunk.
    pub fn chunk_end(&self) -> u64 {
        self.chunk_start as u64 + self.chunk.len() as u64
    }
}

/// Payload shared by Complete, Cancel and ReqComplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRef {
    pub node_id: NodeId,
    pub tx_id: TxId,
}

/// Non-file payload sharing the transfer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raw {
    pub node_id: NodeId,
    pub tx_id: TxId,
    pub payload: Bytes,
}

/// Every packet the protocol knows.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Heartbeat(Heartbeat),
    Message(Note),
    Command(Note),
    ReqQueue(ReqQueue),
    Queue(TxAnnounce),
    ReqMeta(TxAnnounce),
    MetaLong(MetaLong),
    MetaShort(MetaShort),
    ReqData(ReqData),
    Data(Data),
    Complete(TxRef),
    Cancel(TxRef),
    ReqComplete(TxRef),
    Raw(Raw),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Heartbeat(_) => PacketKind::Heartbeat,
            Packet::Message(_) => PacketKind::Message,
            Packet::Command(_) => PacketKind::Command,
            Packet::ReqQueue(_) => PacketKind::ReqQueue,
            Packet::Queue(_) => PacketKind::Queue,
            Packet::ReqMeta(_) => PacketKind::ReqMeta,
            Packet::MetaLong(_) => PacketKind::MetaLong,
            Packet::MetaShort(_) => PacketKind::MetaShort,
            Packet::ReqData(_) => PacketKind::ReqData,
            Packet::Data(_) => PacketKind::Data,
            Packet::Complete(_) => PacketKind::Complete,
            Packet::Cancel(_) => PacketKind::Cancel,
            Packet::ReqComplete(_) => PacketKind::ReqComplete,
            Packet::Raw(_) => PacketKind::Raw,
        }
    }

    /// Origin node id. MetaLong names its origin instead.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Packet::Heartbeat(p) => Some(p.node_id),
            Packet::Message(p) | Packet::Command(p) => Some(p.node_id),
            Packet::ReqQueue(p) => Some(p.node_id),
            Packet::Queue(p) | Packet::ReqMeta(p) => Some(p.node_id),
            Packet::MetaLong(_) => None,
            Packet::MetaShort(p) => Some(p.node_id),
            Packet::ReqData(p) => Some(p.node_id),
            Packet::Data(p) => Some(p.node_id),
            Packet::Complete(p) | Packet::Cancel(p) | Packet::ReqComplete(p) => Some(p.node_id),
            Packet::Raw(p) => Some(p.node_id),
        }
    }

    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            Packet::Heartbeat(_) | Packet::Message(_) | Packet::Command(_) | Packet::ReqQueue(_) => {
                None
            }
            Packet::Queue(p) | Packet::ReqMeta(p) => Some(p.tx_id),
            Packet::MetaLong(p) => Some(p.tx_id),
            Packet::MetaShort(p) => Some(p.tx_id),
            Packet::ReqData(p) => Some(p.tx_id),
            Packet::Data(p) => Some(p.tx_id),
            Packet::Complete(p) | Packet::Cancel(p) | Packet::ReqComplete(p) => Some(p.tx_id),
            Packet::Raw(p) => Some(p.tx_id),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Reasons an inbound buffer is not a packet. The caller must treat the
/// buffer as never received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet too short: {len} bytes, {kind:?} needs at least {min}")]
    TooShort {
        kind: Option<PacketKind>,
        len: usize,
        min: usize,
    },

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("checksum mismatch: packet carries 0x{expected:04x}, computed 0x{computed:04x}")]
    ChecksumMismatch { expected: u16, computed: u16 },

    #[error("malformed {kind:?} packet: {reason}")]
    Malformed {
        kind: PacketKind,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{kind:?} payload is {len} bytes, limit is {max}")]
    PayloadTooLarge {
        kind: PacketKind,
        len: usize,
        max: usize,
    },
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Largest Message/Command body; its length travels in one byte.
pub const MAX_NOTE_BYTES: usize = u8::MAX as usize;

/// Serialize a packet, checksum included.
pub fn encode(packet: &Packet) -> Result<Bytes, EncodeError> {
    let kind = packet.kind();
    let mut buf = BytesMut::with_capacity(kind.min_len() + 64);
    buf.put_u8(kind.into());
    buf.put_u16_le(0);

    match packet {
        Packet::Heartbeat(p) => {
            buf.put_u8(p.node_id);
            put_name(&mut buf, &p.node_name);
            buf.put_f32_le(p.beat_period);
            buf.put_f32_le(p.throughput);
            buf.put_u32_le(p.unix_time);
        }
        Packet::Message(p) | Packet::Command(p) => {
            if p.bytes.len() > MAX_NOTE_BYTES {
                return Err(EncodeError::PayloadTooLarge {
                    kind,
                    len: p.bytes.len(),
                    max: MAX_NOTE_BYTES,
                });
            }
            buf.put_u8(p.node_id);
            buf.put_u8(p.bytes.len() as u8);
            buf.put_slice(&p.bytes);
        }
        Packet::ReqQueue(p) => {
            buf.put_u8(p.node_id);
            put_name(&mut buf, &p.node_name);
        }
        Packet::Queue(p) | Packet::ReqMeta(p) => {
            buf.put_u8(p.node_id);
            put_name(&mut buf, &p.node_name);
            buf.put_u16_le(p.tx_id);
        }
        Packet::MetaLong(p) => {
            put_name(&mut buf, &p.node_name);
            buf.put_u16_le(p.tx_id);
            put_name(&mut buf, &p.agent_name);
            put_name(&mut buf, &p.file_name);
            buf.put_u64_le(p.file_size);
        }
        Packet::MetaShort(p) => {
            buf.put_u8(p.node_id);
            buf.put_u16_le(p.tx_id);
            put_name(&mut buf, &p.agent_name);
            put_name(&mut buf, &p.file_name);
            buf.put_u32_le(p.file_size);
        }
        Packet::ReqData(p) => {
            buf.put_u8(p.node_id);
            buf.put_u16_le(p.tx_id);
            buf.put_u32_le(p.hole_start);
            buf.put_u32_le(p.hole_end);
        }
        Packet::Data(p) => {
            if p.chunk.len() > u32::MAX as usize {
                return Err(EncodeError::PayloadTooLarge {
                    kind,
                    len: p.chunk.len(),
                    max: u32::MAX as usize,
                });
            }
            buf.put_u8(p.node_id);
            buf.put_u16_le(p.tx_id);
            buf.put_u32_le(p.byte_count());
            buf.put_u32_le(p.chunk_start);
            buf.put_slice(&p.chunk);
        }
        Packet::Complete(p) | Packet::Cancel(p) | Packet::ReqComplete(p) => {
            buf.put_u8(p.node_id);
            buf.put_u16_le(p.tx_id);
        }
        Packet::Raw(p) => {
            buf.put_u8(p.node_id);
            buf.put_u16_le(p.tx_id);
            buf.put_slice(&p.payload);
        }
    }

    let crc = checksum(kind.into(), &buf[HEADER_SIZE..]);
    buf[1..HEADER_SIZE].copy_from_slice(&crc.to_le_bytes());
    Ok(buf.freeze())
}

fn put_name<const N: usize>(buf: &mut BytesMut, name: &BoundedName<N>) {
    // BoundedName limits are all below 256
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_str().as_bytes());
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Parse and verify one packet.
///
/// The header and checksum are validated before any payload field is read,
/// so corrupted length or offset fields are never acted upon.
pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
    let Some(&tag) = data.first() else {
        return Err(DecodeError::TooShort {
            kind: None,
            len: 0,
            min: HEADER_SIZE,
        });
    };
    let kind = PacketKind::try_from(tag)?;
    if data.len() < kind.min_len() {
        return Err(DecodeError::TooShort {
            kind: Some(kind),
            len: data.len(),
            min: kind.min_len(),
        });
    }

    let header = PacketHeader::read_from_prefix(data).ok_or(DecodeError::TooShort {
        kind: Some(kind),
        len: data.len(),
        min: HEADER_SIZE,
    })?;
    let expected = u16::from_le_bytes(header.checksum);
    let payload = &data[HEADER_SIZE..];
    let computed = checksum(tag, payload);
    if expected != computed {
        return Err(DecodeError::ChecksumMismatch { expected, computed });
    }

    let mut r = Reader { kind, buf: payload };
    let packet = match kind {
        PacketKind::Heartbeat => Packet::Heartbeat(Heartbeat {
            node_id: r.u8()?,
            node_name: r.name()?,
            beat_period: r.f32()?,
            throughput: r.f32()?,
            unix_time: r.u32()?,
        }),
        PacketKind::Message | PacketKind::Command => {
            let node_id = r.u8()?;
            let len = r.u8()? as usize;
            let bytes = Bytes::copy_from_slice(r.take(len)?);
            let note = Note { node_id, bytes };
            if kind == PacketKind::Message {
                Packet::Message(note)
            } else {
                Packet::Command(note)
            }
        }
        PacketKind::ReqQueue => Packet::ReqQueue(ReqQueue {
            node_id: r.u8()?,
            node_name: r.name()?,
        }),
        PacketKind::Queue | PacketKind::ReqMeta => {
            let announce = TxAnnounce {
                node_id: r.u8()?,
                node_name: r.name()?,
                tx_id: r.u16()?,
            };
            if kind == PacketKind::Queue {
                Packet::Queue(announce)
            } else {
                Packet::ReqMeta(announce)
            }
        }
        PacketKind::MetaLong => Packet::MetaLong(MetaLong {
            node_name: r.name()?,
            tx_id: r.u16()?,
            agent_name: r.name()?,
            file_name: r.name()?,
            file_size: r.u64()?,
        }),
        PacketKind::MetaShort => Packet::MetaShort(MetaShort {
            node_id: r.u8()?,
            tx_id: r.u16()?,
            agent_name: r.name()?,
            file_name: r.name()?,
            file_size: r.u32()?,
        }),
        PacketKind::ReqData => {
            let req = ReqData {
                node_id: r.u8()?,
                tx_id: r.u16()?,
                hole_start: r.u32()?,
                hole_end: r.u32()?,
            };
            if req.hole_end < req.hole_start {
                return Err(r.malformed("hole_end precedes hole_start"));
            }
            Packet::ReqData(req)
        }
        PacketKind::Data => {
            let node_id = r.u8()?;
            let tx_id = r.u16()?;
            let byte_count = r.u32()? as usize;
            let chunk_start = r.u32()?;
            if byte_count != r.buf.remaining() {
                return Err(r.malformed("byte_count disagrees with chunk length"));
            }
            Packet::Data(Data {
                node_id,
                tx_id,
                chunk_start,
                chunk: Bytes::copy_from_slice(r.take(byte_count)?),
            })
        }
        PacketKind::Complete | PacketKind::Cancel | PacketKind::ReqComplete => {
            let tx = TxRef {
                node_id: r.u8()?,
                tx_id: r.u16()?,
            };
            match kind {
                PacketKind::Complete => Packet::Complete(tx),
                PacketKind::Cancel => Packet::Cancel(tx),
                _ => Packet::ReqComplete(tx),
            }
        }
        PacketKind::Raw => {
            let node_id = r.u8()?;
            let tx_id = r.u16()?;
            let rest = r.buf.remaining();
            Packet::Raw(Raw {
                node_id,
                tx_id,
                payload: Bytes::copy_from_slice(r.take(rest)?),
            })
        }
    };

    if r.buf.has_remaining() {
        return Err(r.malformed("trailing bytes after payload"));
    }
    Ok(packet)
}

/// Bounds-checked little-endian reader over a verified payload.
struct Reader<'a> {
    kind: PacketKind,
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn malformed(&self, reason: &'static str) -> DecodeError {
        DecodeError::Malformed {
            kind: self.kind,
            reason,
        }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(self.malformed("payload ends inside a field"));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn name<const N: usize>(&mut self) -> Result<BoundedName<N>, DecodeError> {
        let len = self.u8()? as usize;
        if len > N {
            return Err(self.malformed("name exceeds its limit"));
        }
        let raw = self.take(len)?;
        let text = std::str::from_utf8(raw).map_err(|_| self.malformed("name is not UTF-8"))?;
        BoundedName::new(text).map_err(|_| self.malformed("name exceeds its limit"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
