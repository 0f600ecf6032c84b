//! # Riptide Wire Format
//!
//! Bit-exact pack/unpack for every protocol PDU and header extension. All
//! multi-byte integers are big-endian; the FEC payload id scheme is
//! `fec_id = 129` (32-bit block id, 16-bit block length, 16-bit symbol id).
//!
//! ## Common header (8 bytes, every PDU)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |version| type  |    hdr_len    |           sequence            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           source_id                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `hdr_len` counts the full header (base fields plus extensions) in 4-byte
//! words. Header extensions sit between the type-specific fixed fields and
//! `hdr_len`; payload content follows the header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::seq::{BlockId, NodeId, ObjectId, ObjectSize, SegmentId};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Protocol version carried in the top nibble of every PDU.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram the engine will build or accept.
pub const MAX_PDU_SIZE: usize = 8192;

/// FEC payload id scheme used throughout.
pub const FEC_ID: u8 = 129;

/// Default robustness factor for flush/ack collection.
pub const ROBUST_FACTOR: u32 = 20;

// ─── Quantisation ───────────────────────────────────────────────────────────

pub const RTT_MIN: f64 = 1.0e-6;
pub const RTT_MAX: f64 = 1000.0;
pub const GRTT_MIN: f64 = 0.001;
pub const GRTT_MAX: f64 = 15.0;

/// Quantise an RTT (seconds) to the 8-bit wire form: values below ~33 µs
/// are linear in microseconds, the remainder is logarithmic.
pub fn quantize_rtt(rtt: f64) -> u8 {
    let rtt = rtt.clamp(RTT_MIN, RTT_MAX);
    if rtt < 3.3e-05 {
        ((rtt / RTT_MIN).ceil() as u8).saturating_sub(1)
    } else {
        (255.0 - 13.0 * (RTT_MAX / rtt).ln()).ceil().clamp(0.0, 255.0) as u8
    }
}

pub fn unquantize_rtt(q: u8) -> f64 {
    if q < 31 {
        (q as f64 + 1.0) * RTT_MIN
    } else {
        RTT_MAX / ((255.0 - q as f64) / 13.0).exp()
    }
}

/// Loss fraction to 16-bit linear form on [0, 1].
pub fn quantize_loss(loss: f64) -> u16 {
    (loss.max(0.0) * 65535.0 + 0.5).min(65535.0) as u16
}

pub fn unquantize_loss(q: u16) -> f64 {
    q as f64 / 65535.0
}

/// Rate (bytes/sec) to 8-bit mantissa (high byte) + base-10 exponent (low).
pub fn quantize_rate(rate: f64) -> u16 {
    let rate = rate.max(1.0);
    let exponent = rate.log10().floor() as u32;
    let mantissa = ((256.0 / 10.0) * rate / 10f64.powi(exponent as i32)) as u16;
    (mantissa.min(255) << 8) | (exponent as u16 & 0xFF)
}

pub fn unquantize_rate(q: u16) -> f64 {
    let mantissa = (q >> 8) as f64 * (10.0 / 256.0);
    mantissa * 10f64.powi((q & 0xFF) as i32)
}

/// Group size to the 4-bit form: 1-bit mantissa (1 or 5) + 3-bit decade
/// exponent (stored minus one). Rounds up to the nearest representable
/// bound so the advertised size never understates the group.
pub fn quantize_group_size(gsize: f64) -> u8 {
    let gsize = gsize.clamp(10.0, 5.0e8);
    let e = gsize.log10().floor() as i32;
    let m = gsize / 10f64.powi(e);
    let (mbit, e) = if m <= 1.0 {
        (0x00u8, e)
    } else if m <= 5.0 {
        (0x08u8, e)
    } else {
        (0x00u8, e + 1)
    };
    mbit | ((e - 1).clamp(0, 7) as u8)
}

pub fn unquantize_group_size(q: u8) -> f64 {
    let exponent = ((q & 0x07) + 1) as i32;
    let mantissa = if q & 0x08 != 0 { 5.0 } else { 1.0 };
    mantissa * 10f64.powi(exponent)
}

// ─── PDU Type ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    Info = 1,
    Data = 2,
    Cmd = 3,
    Nack = 4,
    Ack = 5,
    Report = 6,
}

impl PduType {
    fn from_nibble(b: u8) -> Option<Self> {
        match b {
            1 => Some(PduType::Info),
            2 => Some(PduType::Data),
            3 => Some(PduType::Cmd),
            4 => Some(PduType::Nack),
            5 => Some(PduType::Ack),
            6 => Some(PduType::Report),
            _ => None,
        }
    }
}

// ─── Object PDU Flags ───────────────────────────────────────────────────────

/// Flag bits carried by INFO and DATA PDUs.
pub mod object_flags {
    /// Transmission is a repair (never establishes receiver sync).
    pub const REPAIR: u8 = 0x01;
    /// Segment was explicitly requested.
    pub const EXPLICIT: u8 = 0x02;
    /// Object carries out-of-band info.
    pub const INFO: u8 = 0x04;
    /// Best-effort object; no repair will be offered.
    pub const UNRELIABLE: u8 = 0x08;
    /// File-backed object.
    pub const FILE: u8 = 0x10;
    /// Byte-stream object.
    pub const STREAM: u8 = 0x20;
    /// Segment payload begins an application message.
    pub const MSG_START: u8 = 0x40;
}

/// Flag bits in CC feedback and CMD(CC) node list entries.
pub mod cc_flags {
    pub const CLR: u8 = 0x01;
    pub const PLR: u8 = 0x02;
    pub const RTT: u8 = 0x04;
    pub const START: u8 = 0x08;
    pub const LEAVE: u8 = 0x10;
}

// ─── Header Extensions ──────────────────────────────────────────────────────

pub const EXT_FTI: u8 = 1;
pub const EXT_CC_FEEDBACK: u8 = 2;
pub const EXT_CC_RATE: u8 = 128;

/// FEC Object Transmission Information (FTI), 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtiExtension {
    pub object_size: ObjectSize,
    pub fec_instance: u16,
    pub segment_size: u16,
    pub ndata: u16,
    pub nparity: u16,
}

impl FtiExtension {
    pub const LEN: usize = 16;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(EXT_FTI);
        buf.put_u8((Self::LEN / 4) as u8);
        buf.put_u16(self.object_size.msb());
        buf.put_u32(self.object_size.lsb());
        buf.put_u16(self.fec_instance);
        buf.put_u16(self.segment_size);
        buf.put_u16(self.ndata);
        buf.put_u16(self.nparity);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::LEN - 2 {
            return None;
        }
        let msb = buf.get_u16();
        let lsb = buf.get_u32();
        Some(FtiExtension {
            object_size: ObjectSize::new(msb, lsb),
            fec_instance: buf.get_u16(),
            segment_size: buf.get_u16(),
            ndata: buf.get_u16(),
            nparity: buf.get_u16(),
        })
    }
}

/// Congestion control feedback, attached to NACK and ACK PDUs. 12 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CcFeedbackExtension {
    pub cc_sequence: u16,
    pub cc_flags: u8,
    pub cc_rtt: u8,
    pub cc_loss: u16,
    pub cc_rate: u16,
}

impl CcFeedbackExtension {
    pub const LEN: usize = 12;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(EXT_CC_FEEDBACK);
        buf.put_u8((Self::LEN / 4) as u8);
        buf.put_u16(self.cc_sequence);
        buf.put_u8(self.cc_flags);
        buf.put_u8(self.cc_rtt);
        buf.put_u16(self.cc_loss);
        buf.put_u16(self.cc_rate);
        buf.put_u16(0); // reserved
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::LEN - 2 {
            return None;
        }
        let ext = CcFeedbackExtension {
            cc_sequence: buf.get_u16(),
            cc_flags: buf.get_u8(),
            cc_rtt: buf.get_u8(),
            cc_loss: buf.get_u16(),
            cc_rate: buf.get_u16(),
        };
        buf.advance(2); // reserved
        Some(ext)
    }

    pub fn flag_is_set(&self, flag: u8) -> bool {
        self.cc_flags & flag != 0
    }
}

/// Advertised send rate (proactive mode). Fixed 4-byte form (type >= 128).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcRateExtension {
    pub send_rate: u16,
}

impl CcRateExtension {
    pub const LEN: usize = 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(EXT_CC_RATE);
        buf.put_u8(0); // reserved
        buf.put_u16(self.send_rate);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::LEN - 1 {
            return None;
        }
        buf.advance(1); // reserved
        Some(CcRateExtension {
            send_rate: buf.get_u16(),
        })
    }
}

/// A parsed header extension. Unknown types are preserved opaquely so
/// `hdr_len` accounting round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderExtension {
    Fti(FtiExtension),
    CcFeedback(CcFeedbackExtension),
    CcRate(CcRateExtension),
    Unknown { ext_type: u8, body: Bytes },
}

impl HeaderExtension {
    pub fn encoded_len(&self) -> usize {
        match self {
            HeaderExtension::Fti(_) => FtiExtension::LEN,
            HeaderExtension::CcFeedback(_) => CcFeedbackExtension::LEN,
            HeaderExtension::CcRate(_) => CcRateExtension::LEN,
            // Fixed 4-byte form for types >= 128, type + length octet otherwise.
            HeaderExtension::Unknown { ext_type, body } if *ext_type >= 128 => body.len() + 1,
            HeaderExtension::Unknown { body, .. } => body.len() + 2,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            HeaderExtension::Fti(ext) => ext.encode(buf),
            HeaderExtension::CcFeedback(ext) => ext.encode(buf),
            HeaderExtension::CcRate(ext) => ext.encode(buf),
            HeaderExtension::Unknown { ext_type, body } => {
                buf.put_u8(*ext_type);
                if *ext_type < 128 {
                    buf.put_u8(((body.len() + 2) / 4) as u8);
                }
                buf.put_slice(body);
            }
        }
    }

    /// Decode extensions occupying exactly `len` bytes.
    fn decode_list(buf: &mut Bytes, mut len: usize) -> Option<Vec<HeaderExtension>> {
        let mut extensions = Vec::new();
        while len > 0 {
            if len < 2 || buf.remaining() < 2 {
                return None;
            }
            let ext_type = buf.get_u8();
            let ext_len = if ext_type >= 128 {
                4
            } else {
                let words = {
                    let w = buf.chunk()[0] as usize;
                    w * 4
                };
                words
            };
            if ext_len < 2 || ext_len > len {
                return None;
            }
            let ext = match ext_type {
                EXT_FTI => {
                    buf.advance(1); // length byte
                    HeaderExtension::Fti(FtiExtension::decode(buf)?)
                }
                EXT_CC_FEEDBACK => {
                    buf.advance(1);
                    CcFeedbackExtension::decode(buf).map(HeaderExtension::CcFeedback)?
                }
                EXT_CC_RATE => CcRateExtension::decode(buf).map(HeaderExtension::CcRate)?,
                _ => {
                    // Skip by declared length, keeping the raw body.
                    if ext_type < 128 {
                        buf.advance(1);
                        if buf.remaining() < ext_len - 2 {
                            return None;
                        }
                        HeaderExtension::Unknown {
                            ext_type,
                            body: buf.copy_to_bytes(ext_len - 2),
                        }
                    } else {
                        if buf.remaining() < 3 {
                            return None;
                        }
                        HeaderExtension::Unknown {
                            ext_type,
                            body: buf.copy_to_bytes(3),
                        }
                    }
                }
            };
            len -= ext_len;
            extensions.push(ext);
        }
        Some(extensions)
    }
}

fn extensions_len(extensions: &[HeaderExtension]) -> usize {
    extensions.iter().map(|e| e.encoded_len()).sum()
}

// ─── Repair Requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RepairForm {
    Items = 1,
    Ranges = 2,
    Erasures = 3,
}

impl RepairForm {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RepairForm::Items),
            2 => Some(RepairForm::Ranges),
            3 => Some(RepairForm::Erasures),
            _ => None,
        }
    }
}

/// Flag bits qualifying the level of a repair request.
pub mod repair_flags {
    pub const SEGMENT: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const INFO: u8 = 0x04;
    pub const OBJECT: u8 = 0x08;
}

/// One `fec_id = 129` repair item: 12 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairItem {
    pub object_id: ObjectId,
    pub block_id: BlockId,
    pub block_len: u16,
    pub symbol_id: SegmentId,
}

impl RepairItem {
    pub const LEN: usize = 12;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(FEC_ID);
        buf.put_u8(0); // reserved
        buf.put_u16(self.object_id.value());
        buf.put_u32(self.block_id.value());
        buf.put_u16(self.block_len);
        buf.put_u16(self.symbol_id);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::LEN {
            return None;
        }
        let fec_id = buf.get_u8();
        buf.advance(1); // reserved
        if fec_id != FEC_ID {
            return None;
        }
        Some(RepairItem {
            object_id: ObjectId(buf.get_u16()),
            block_id: BlockId(buf.get_u32()),
            block_len: buf.get_u16(),
            symbol_id: buf.get_u16(),
        })
    }
}

/// A repair request TLV: form, level flags, and a run of items. Under
/// `RepairForm::Ranges` the items pair up as (start, end) bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub form: RepairForm,
    pub flags: u8,
    pub items: Vec<RepairItem>,
}

/// An entry yielded when iterating a repair request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairEntry {
    Item(RepairItem),
    Range(RepairItem, RepairItem),
}

impl RepairRequest {
    pub fn new(form: RepairForm, flags: u8) -> Self {
        RepairRequest {
            form,
            flags,
            items: Vec::new(),
        }
    }

    pub fn flag_is_set(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.items.len() * RepairItem::LEN
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.form as u8);
        buf.put_u8(self.flags);
        buf.put_u16((self.items.len() * RepairItem::LEN) as u16);
        for item in &self.items {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let form = RepairForm::from_byte(buf.get_u8())?;
        let flags = buf.get_u8();
        let length = buf.get_u16() as usize;
        if length % RepairItem::LEN != 0 || buf.remaining() < length {
            return None;
        }
        let count = length / RepairItem::LEN;
        if RepairForm::Ranges == form && count % 2 != 0 {
            return None;
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(RepairItem::decode(buf)?);
        }
        Some(RepairRequest { form, flags, items })
    }

    /// Iterate items, consuming two at a time for range form.
    pub fn entries(&self) -> impl Iterator<Item = RepairEntry> + '_ {
        let ranged = self.form == RepairForm::Ranges;
        let mut idx = 0usize;
        std::iter::from_fn(move || {
            if idx >= self.items.len() {
                return None;
            }
            if ranged {
                let start = self.items[idx];
                let end = self.items[idx + 1];
                idx += 2;
                Some(RepairEntry::Range(start, end))
            } else {
                let item = self.items[idx];
                idx += 1;
                Some(RepairEntry::Item(item))
            }
        })
    }
}

fn encode_repair_requests(requests: &[RepairRequest], buf: &mut BytesMut) {
    for req in requests {
        req.encode(buf);
    }
}

fn decode_repair_requests(buf: &mut Bytes) -> Option<Vec<RepairRequest>> {
    let mut requests = Vec::new();
    while buf.has_remaining() {
        requests.push(RepairRequest::decode(buf)?);
    }
    Some(requests)
}

// ─── Object PDUs (INFO / DATA) ──────────────────────────────────────────────

/// Fields shared by INFO and DATA PDUs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectPduHeader {
    pub sequence: u16,
    pub source_id: NodeId,
    pub session_id: u16,
    pub grtt: u8,
    pub backoff: u8,
    pub gsize: u8,
    pub flags: u8,
    pub object_id: ObjectId,
}

impl ObjectPduHeader {
    fn encode(&self, buf: &mut BytesMut, pdu_type: PduType, hdr_len: usize) {
        buf.put_u8((PROTOCOL_VERSION << 4) | pdu_type as u8);
        buf.put_u8((hdr_len / 4) as u8);
        buf.put_u16(self.sequence);
        buf.put_u32(self.source_id.value());
        buf.put_u16(self.session_id);
        buf.put_u8(self.grtt);
        buf.put_u8((self.backoff << 4) | (self.gsize & 0x0F));
        buf.put_u8(self.flags);
        buf.put_u8(FEC_ID);
        buf.put_u16(self.object_id.value());
    }

    fn decode(buf: &mut Bytes, sequence: u16, source_id: NodeId) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }
        let session_id = buf.get_u16();
        let grtt = buf.get_u8();
        let bg = buf.get_u8();
        let flags = buf.get_u8();
        let fec_id = buf.get_u8();
        if fec_id != FEC_ID {
            return None;
        }
        let object_id = ObjectId(buf.get_u16());
        Some(ObjectPduHeader {
            sequence,
            source_id,
            session_id,
            grtt,
            backoff: bg >> 4,
            gsize: bg & 0x0F,
            flags,
            object_id,
        })
    }

    pub fn flag_is_set(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// INFO PDU: out-of-band object metadata (16-byte base header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPdu {
    pub header: ObjectPduHeader,
    pub extensions: Vec<HeaderExtension>,
    pub info: Bytes,
}

impl InfoPdu {
    const BASE_LEN: usize = 16;

    fn encode(&self, buf: &mut BytesMut) {
        let hdr_len = Self::BASE_LEN + extensions_len(&self.extensions);
        self.header.encode(buf, PduType::Info, hdr_len);
        for ext in &self.extensions {
            ext.encode(buf);
        }
        buf.put_slice(&self.info);
    }
}

/// DATA PDU: one FEC symbol (24-byte base header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPdu {
    pub header: ObjectPduHeader,
    pub block_id: BlockId,
    pub block_len: u16,
    pub symbol_id: SegmentId,
    pub extensions: Vec<HeaderExtension>,
    pub payload: Bytes,
}

impl DataPdu {
    const BASE_LEN: usize = 24;

    /// Whether this symbol is a source (data) symbol rather than parity.
    pub fn is_data(&self) -> bool {
        self.symbol_id < self.block_len
    }

    fn encode(&self, buf: &mut BytesMut) {
        let hdr_len = Self::BASE_LEN + extensions_len(&self.extensions);
        self.header.encode(buf, PduType::Data, hdr_len);
        buf.put_u32(self.block_id.value());
        buf.put_u16(self.block_len);
        buf.put_u16(self.symbol_id);
        for ext in &self.extensions {
            ext.encode(buf);
        }
        buf.put_slice(&self.payload);
    }
}

// ─── Stream Payload Header ──────────────────────────────────────────────────

/// Helpers for the 8-byte header prefixed to stream segment payloads:
/// `reserved(16) payload_len(16) payload_offset(32)`.
pub mod stream_payload {
    pub const HEADER_LEN: usize = 8;

    pub fn write(payload: &mut [u8], len: u16, offset: u32) {
        payload[0..2].copy_from_slice(&[0, 0]);
        payload[2..4].copy_from_slice(&len.to_be_bytes());
        payload[4..8].copy_from_slice(&offset.to_be_bytes());
    }

    pub fn read_length(payload: &[u8]) -> u16 {
        u16::from_be_bytes([payload[2], payload[3]])
    }

    pub fn read_offset(payload: &[u8]) -> u32 {
        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]])
    }
}

// ─── Command PDUs ───────────────────────────────────────────────────────────

/// The watermark / flush / squelch position triple (`fec_id = 129`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FecPosition {
    pub object_id: ObjectId,
    pub block_id: BlockId,
    pub block_len: u16,
    pub symbol_id: SegmentId,
}

impl FecPosition {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(FEC_ID);
        buf.put_u16(self.object_id.value());
        buf.put_u32(self.block_id.value());
        buf.put_u16(self.block_len);
        buf.put_u16(self.symbol_id);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 11 {
            return None;
        }
        if buf.get_u8() != FEC_ID {
            return None;
        }
        Some(FecPosition {
            object_id: ObjectId(buf.get_u16()),
            block_id: BlockId(buf.get_u32()),
            block_len: buf.get_u16(),
            symbol_id: buf.get_u16(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckType {
    Cc = 1,
    Flush = 2,
}

impl AckType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(AckType::Cc),
            2 => Some(AckType::Flush),
            _ => None,
        }
    }
}

/// Entry in a CMD(CC) node list: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcNodeEntry {
    pub node_id: NodeId,
    pub flags: u8,
    pub rtt: u8,
    pub rate: u16,
}

impl CcNodeEntry {
    pub const LEN: usize = 8;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.node_id.value());
        buf.put_u8(self.flags);
        buf.put_u8(self.rtt);
        buf.put_u16(self.rate);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::LEN {
            return None;
        }
        Some(CcNodeEntry {
            node_id: NodeId(buf.get_u32()),
            flags: buf.get_u8(),
            rtt: buf.get_u8(),
            rate: buf.get_u16(),
        })
    }
}

/// Command flavors and their bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdBody {
    /// End-of-transmission flush naming the last position, plus the acking
    /// nodes still owing a watermark ACK.
    Flush {
        position: FecPosition,
        acking_nodes: Vec<NodeId>,
    },
    /// End of transmission.
    Eot,
    /// Repair boundary advertisement after an invalid request: the current
    /// low water mark plus the invalid object ids.
    Squelch {
        position: FecPosition,
        invalid_objects: Vec<ObjectId>,
    },
    /// GRTT/congestion probe.
    Cc {
        cc_sequence: u16,
        send_time_sec: u32,
        send_time_usec: u32,
        extensions: Vec<HeaderExtension>,
        nodes: Vec<CcNodeEntry>,
    },
    /// Aggregate repair state advertisement (unicast feedback suppression).
    RepairAdv {
        flags: u8,
        extensions: Vec<HeaderExtension>,
        requests: Vec<RepairRequest>,
    },
    /// Application-defined positive-ACK solicitation.
    AckReq {
        ack_type: u8,
        ack_id: u8,
        acking_nodes: Vec<NodeId>,
    },
    /// Application-defined command content.
    Application { content: Bytes },
}

/// REPAIR_ADV flag: advertised limit reflects congestion-control state.
pub const REPAIR_ADV_FLAG_LIMIT: u8 = 0x01;

const CMD_FLAVOR_FLUSH: u8 = 1;
const CMD_FLAVOR_EOT: u8 = 2;
const CMD_FLAVOR_SQUELCH: u8 = 3;
const CMD_FLAVOR_CC: u8 = 4;
const CMD_FLAVOR_REPAIR_ADV: u8 = 5;
const CMD_FLAVOR_ACK_REQ: u8 = 6;
const CMD_FLAVOR_APPLICATION: u8 = 7;

/// CMD PDU with sender-advertised GRTT/backoff/group-size state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdPdu {
    pub sequence: u16,
    pub source_id: NodeId,
    pub session_id: u16,
    pub grtt: u8,
    pub backoff: u8,
    pub gsize: u8,
    pub body: CmdBody,
}

impl CmdPdu {
    fn flavor(&self) -> u8 {
        match self.body {
            CmdBody::Flush { .. } => CMD_FLAVOR_FLUSH,
            CmdBody::Eot => CMD_FLAVOR_EOT,
            CmdBody::Squelch { .. } => CMD_FLAVOR_SQUELCH,
            CmdBody::Cc { .. } => CMD_FLAVOR_CC,
            CmdBody::RepairAdv { .. } => CMD_FLAVOR_REPAIR_ADV,
            CmdBody::AckReq { .. } => CMD_FLAVOR_ACK_REQ,
            CmdBody::Application { .. } => CMD_FLAVOR_APPLICATION,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let (base_len, ext_len) = match &self.body {
            CmdBody::Flush { .. } | CmdBody::Squelch { .. } => (24, 0),
            CmdBody::Eot | CmdBody::Application { .. } => (16, 0),
            CmdBody::Cc { extensions, .. } => (24, extensions_len(extensions)),
            CmdBody::RepairAdv { extensions, .. } => (16, extensions_len(extensions)),
            CmdBody::AckReq { .. } => (16, 0),
        };
        let hdr_len = base_len + ext_len;
        buf.put_u8((PROTOCOL_VERSION << 4) | PduType::Cmd as u8);
        buf.put_u8((hdr_len / 4) as u8);
        buf.put_u16(self.sequence);
        buf.put_u32(self.source_id.value());
        buf.put_u16(self.session_id);
        buf.put_u8(self.grtt);
        buf.put_u8((self.backoff << 4) | (self.gsize & 0x0F));
        buf.put_u8(self.flavor());
        match &self.body {
            CmdBody::Flush {
                position,
                acking_nodes,
            } => {
                position.encode(buf);
                for node in acking_nodes {
                    buf.put_u32(node.value());
                }
            }
            CmdBody::Eot => {
                buf.put_slice(&[0u8; 3]);
            }
            CmdBody::Squelch {
                position,
                invalid_objects,
            } => {
                position.encode(buf);
                for obj in invalid_objects {
                    buf.put_u16(obj.value());
                }
            }
            CmdBody::Cc {
                cc_sequence,
                send_time_sec,
                send_time_usec,
                extensions,
                nodes,
            } => {
                buf.put_u8(0); // reserved
                buf.put_u16(*cc_sequence);
                buf.put_u32(*send_time_sec);
                buf.put_u32(*send_time_usec);
                for ext in extensions {
                    ext.encode(buf);
                }
                for node in nodes {
                    node.encode(buf);
                }
            }
            CmdBody::RepairAdv {
                flags,
                extensions,
                requests,
            } => {
                buf.put_u8(*flags);
                buf.put_u16(0); // reserved
                for ext in extensions {
                    ext.encode(buf);
                }
                encode_repair_requests(requests, buf);
            }
            CmdBody::AckReq {
                ack_type,
                ack_id,
                acking_nodes,
            } => {
                buf.put_u8(0); // reserved
                buf.put_u8(*ack_type);
                buf.put_u8(*ack_id);
                for node in acking_nodes {
                    buf.put_u32(node.value());
                }
            }
            CmdBody::Application { content } => {
                buf.put_slice(&[0u8; 3]);
                buf.put_slice(content);
            }
        }
    }

    fn decode(
        buf: &mut Bytes,
        sequence: u16,
        source_id: NodeId,
        hdr_len: usize,
    ) -> Option<Self> {
        if buf.remaining() < 5 {
            return None;
        }
        let session_id = buf.get_u16();
        let grtt = buf.get_u8();
        let bg = buf.get_u8();
        let flavor = buf.get_u8();
        // 13 bytes of the header consumed so far.
        let body = match flavor {
            CMD_FLAVOR_FLUSH => {
                if hdr_len < 24 {
                    return None;
                }
                let position = FecPosition::decode(buf)?;
                let mut acking_nodes = Vec::new();
                while buf.remaining() >= 4 {
                    acking_nodes.push(NodeId(buf.get_u32()));
                }
                CmdBody::Flush {
                    position,
                    acking_nodes,
                }
            }
            CMD_FLAVOR_EOT => {
                if buf.remaining() < 3 {
                    return None;
                }
                buf.advance(3);
                CmdBody::Eot
            }
            CMD_FLAVOR_SQUELCH => {
                if hdr_len < 24 {
                    return None;
                }
                let position = FecPosition::decode(buf)?;
                let mut invalid_objects = Vec::new();
                while buf.remaining() >= 2 {
                    invalid_objects.push(ObjectId(buf.get_u16()));
                }
                CmdBody::Squelch {
                    position,
                    invalid_objects,
                }
            }
            CMD_FLAVOR_CC => {
                if hdr_len < 24 || buf.remaining() < 11 {
                    return None;
                }
                buf.advance(1); // reserved
                let cc_sequence = buf.get_u16();
                let send_time_sec = buf.get_u32();
                let send_time_usec = buf.get_u32();
                let extensions = HeaderExtension::decode_list(buf, hdr_len - 24)?;
                let mut nodes = Vec::new();
                while buf.remaining() >= CcNodeEntry::LEN {
                    nodes.push(CcNodeEntry::decode(buf)?);
                }
                CmdBody::Cc {
                    cc_sequence,
                    send_time_sec,
                    send_time_usec,
                    extensions,
                    nodes,
                }
            }
            CMD_FLAVOR_REPAIR_ADV => {
                if hdr_len < 16 || buf.remaining() < 3 {
                    return None;
                }
                let flags = buf.get_u8();
                buf.advance(2); // reserved
                let extensions = HeaderExtension::decode_list(buf, hdr_len - 16)?;
                let requests = decode_repair_requests(buf)?;
                CmdBody::RepairAdv {
                    flags,
                    extensions,
                    requests,
                }
            }
            CMD_FLAVOR_ACK_REQ => {
                if buf.remaining() < 3 {
                    return None;
                }
                buf.advance(1); // reserved
                let ack_type = buf.get_u8();
                let ack_id = buf.get_u8();
                let mut acking_nodes = Vec::new();
                while buf.remaining() >= 4 {
                    acking_nodes.push(NodeId(buf.get_u32()));
                }
                CmdBody::AckReq {
                    ack_type,
                    ack_id,
                    acking_nodes,
                }
            }
            CMD_FLAVOR_APPLICATION => {
                if buf.remaining() < 3 {
                    return None;
                }
                buf.advance(3);
                CmdBody::Application {
                    content: buf.copy_to_bytes(buf.remaining()),
                }
            }
            _ => return None,
        };
        Some(CmdPdu {
            sequence,
            source_id,
            session_id,
            grtt,
            backoff: bg >> 4,
            gsize: bg & 0x0F,
            body,
        })
    }
}

// ─── Receiver PDUs (NACK / ACK) ─────────────────────────────────────────────

/// NACK: repair request list with GRTT response echo (24-byte base header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackPdu {
    pub sequence: u16,
    pub source_id: NodeId,
    pub server_id: NodeId,
    pub session_id: u16,
    pub grtt_response_sec: u32,
    pub grtt_response_usec: u32,
    pub extensions: Vec<HeaderExtension>,
    pub requests: Vec<RepairRequest>,
}

impl NackPdu {
    const BASE_LEN: usize = 24;

    fn encode(&self, buf: &mut BytesMut) {
        let hdr_len = Self::BASE_LEN + extensions_len(&self.extensions);
        buf.put_u8((PROTOCOL_VERSION << 4) | PduType::Nack as u8);
        buf.put_u8((hdr_len / 4) as u8);
        buf.put_u16(self.sequence);
        buf.put_u32(self.source_id.value());
        buf.put_u32(self.server_id.value());
        buf.put_u16(self.session_id);
        buf.put_u16(0); // reserved
        buf.put_u32(self.grtt_response_sec);
        buf.put_u32(self.grtt_response_usec);
        for ext in &self.extensions {
            ext.encode(buf);
        }
        encode_repair_requests(&self.requests, buf);
    }

    fn decode(buf: &mut Bytes, sequence: u16, source_id: NodeId, hdr_len: usize) -> Option<Self> {
        if hdr_len < Self::BASE_LEN || buf.remaining() < 16 {
            return None;
        }
        let server_id = NodeId(buf.get_u32());
        let session_id = buf.get_u16();
        buf.advance(2); // reserved
        let grtt_response_sec = buf.get_u32();
        let grtt_response_usec = buf.get_u32();
        let extensions = HeaderExtension::decode_list(buf, hdr_len - Self::BASE_LEN)?;
        let requests = decode_repair_requests(buf)?;
        Some(NackPdu {
            sequence,
            source_id,
            server_id,
            session_id,
            grtt_response_sec,
            grtt_response_usec,
            extensions,
            requests,
        })
    }

    /// The CC feedback extension, if attached.
    pub fn cc_feedback(&self) -> Option<&CcFeedbackExtension> {
        self.extensions.iter().find_map(|e| match e {
            HeaderExtension::CcFeedback(ext) => Some(ext),
            _ => None,
        })
    }
}

/// ACK: positive acknowledgement with GRTT response echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPdu {
    pub sequence: u16,
    pub source_id: NodeId,
    pub server_id: NodeId,
    pub session_id: u16,
    pub ack_type: AckType,
    pub ack_id: u8,
    pub grtt_response_sec: u32,
    pub grtt_response_usec: u32,
    pub extensions: Vec<HeaderExtension>,
    /// Watermark position for `AckType::Flush`, absent for `AckType::Cc`.
    pub position: Option<FecPosition>,
}

impl AckPdu {
    const BASE_LEN: usize = 24;

    fn encode(&self, buf: &mut BytesMut) {
        let hdr_len = Self::BASE_LEN + extensions_len(&self.extensions);
        buf.put_u8((PROTOCOL_VERSION << 4) | PduType::Ack as u8);
        buf.put_u8((hdr_len / 4) as u8);
        buf.put_u16(self.sequence);
        buf.put_u32(self.source_id.value());
        buf.put_u32(self.server_id.value());
        buf.put_u16(self.session_id);
        buf.put_u8(self.ack_type as u8);
        buf.put_u8(self.ack_id);
        buf.put_u32(self.grtt_response_sec);
        buf.put_u32(self.grtt_response_usec);
        for ext in &self.extensions {
            ext.encode(buf);
        }
        if let Some(position) = &self.position {
            position.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes, sequence: u16, source_id: NodeId, hdr_len: usize) -> Option<Self> {
        if hdr_len < Self::BASE_LEN || buf.remaining() < 16 {
            return None;
        }
        let server_id = NodeId(buf.get_u32());
        let session_id = buf.get_u16();
        let ack_type = AckType::from_byte(buf.get_u8())?;
        let ack_id = buf.get_u8();
        let grtt_response_sec = buf.get_u32();
        let grtt_response_usec = buf.get_u32();
        let extensions = HeaderExtension::decode_list(buf, hdr_len - Self::BASE_LEN)?;
        let position = if ack_type == AckType::Flush && buf.remaining() >= 11 {
            Some(FecPosition::decode(buf)?)
        } else {
            None
        };
        Some(AckPdu {
            sequence,
            source_id,
            server_id,
            session_id,
            ack_type,
            ack_id,
            grtt_response_sec,
            grtt_response_usec,
            extensions,
            position,
        })
    }

    pub fn cc_feedback(&self) -> Option<&CcFeedbackExtension> {
        self.extensions.iter().find_map(|e| match e {
            HeaderExtension::CcFeedback(ext) => Some(ext),
            _ => None,
        })
    }
}

// ─── Top-Level PDU ──────────────────────────────────────────────────────────

/// A decoded protocol datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Info(InfoPdu),
    Data(DataPdu),
    Cmd(CmdPdu),
    Nack(NackPdu),
    Ack(AckPdu),
}

impl Pdu {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        match self {
            Pdu::Info(pdu) => pdu.encode(&mut buf),
            Pdu::Data(pdu) => pdu.encode(&mut buf),
            Pdu::Cmd(pdu) => pdu.encode(&mut buf),
            Pdu::Nack(pdu) => pdu.encode(&mut buf),
            Pdu::Ack(pdu) => pdu.encode(&mut buf),
        }
        debug_assert!(buf.len() <= MAX_PDU_SIZE);
        buf
    }

    /// Decode one datagram. Returns `None` on any malformation: bad
    /// version, unknown type, or a header length inconsistent with the
    /// datagram.
    pub fn decode(datagram: Bytes) -> Option<Pdu> {
        let total_len = datagram.len();
        if total_len < 8 || total_len > MAX_PDU_SIZE {
            return None;
        }
        let mut buf = datagram;
        let vt = buf.get_u8();
        if vt >> 4 != PROTOCOL_VERSION {
            return None;
        }
        let pdu_type = PduType::from_nibble(vt & 0x0F)?;
        let hdr_len = buf.get_u8() as usize * 4;
        if hdr_len < 8 || hdr_len > total_len {
            return None;
        }
        let sequence = buf.get_u16();
        let source_id = NodeId(buf.get_u32());
        match pdu_type {
            PduType::Info => {
                if hdr_len < 16 {
                    return None;
                }
                let header = ObjectPduHeader::decode(&mut buf, sequence, source_id)?;
                let extensions = HeaderExtension::decode_list(&mut buf, hdr_len - 16)?;
                let info = buf.copy_to_bytes(buf.remaining());
                Some(Pdu::Info(InfoPdu {
                    header,
                    extensions,
                    info,
                }))
            }
            PduType::Data => {
                if hdr_len < 24 {
                    return None;
                }
                let header = ObjectPduHeader::decode(&mut buf, sequence, source_id)?;
                if buf.remaining() < 8 {
                    return None;
                }
                let block_id = BlockId(buf.get_u32());
                let block_len = buf.get_u16();
                let symbol_id = buf.get_u16();
                let extensions = HeaderExtension::decode_list(&mut buf, hdr_len - 24)?;
                let payload = buf.copy_to_bytes(buf.remaining());
                Some(Pdu::Data(DataPdu {
                    header,
                    block_id,
                    block_len,
                    symbol_id,
                    extensions,
                    payload,
                }))
            }
            PduType::Cmd => {
                CmdPdu::decode(&mut buf, sequence, source_id, hdr_len).map(Pdu::Cmd)
            }
            PduType::Nack => {
                NackPdu::decode(&mut buf, sequence, source_id, hdr_len).map(Pdu::Nack)
            }
            PduType::Ack => AckPdu::decode(&mut buf, sequence, source_id, hdr_len).map(Pdu::Ack),
            PduType::Report => None, // diagnostic reports are not consumed by the engine
        }
    }

    pub fn sequence(&self) -> u16 {
        match self {
            Pdu::Info(p) => p.header.sequence,
            Pdu::Data(p) => p.header.sequence,
            Pdu::Cmd(p) => p.sequence,
            Pdu::Nack(p) => p.sequence,
            Pdu::Ack(p) => p.sequence,
        }
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        match self {
            Pdu::Info(p) => p.header.sequence = sequence,
            Pdu::Data(p) => p.header.sequence = sequence,
            Pdu::Cmd(p) => p.sequence = sequence,
            Pdu::Nack(p) => p.sequence = sequence,
            Pdu::Ack(p) => p.sequence = sequence,
        }
    }

    pub fn source_id(&self) -> NodeId {
        match self {
            Pdu::Info(p) => p.header.source_id,
            Pdu::Data(p) => p.header.source_id,
            Pdu::Cmd(p) => p.source_id,
            Pdu::Nack(p) => p.source_id,
            Pdu::Ack(p) => p.source_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_header(flags: u8) -> ObjectPduHeader {
        ObjectPduHeader {
            sequence: 7,
            source_id: NodeId(0xAABBCCDD),
            session_id: 0x1234,
            grtt: quantize_rtt(0.5),
            backoff: 4,
            gsize: quantize_group_size(1000.0),
            flags,
            object_id: ObjectId(42),
        }
    }

    fn round_trip(pdu: Pdu) -> Pdu {
        let bytes = pdu.encode().freeze();
        Pdu::decode(bytes).expect("round trip decode")
    }

    // ─── Quantisation ───────────────────────────────────────────────────

    #[test]
    fn rtt_quantisation_round_trip_bounds() {
        for rtt in [1.0e-6, 5.0e-6, 1.0e-3, 0.05, 0.5, 2.0, 100.0, 999.0] {
            let q = quantize_rtt(rtt);
            let back = unquantize_rtt(q);
            assert!(back >= rtt * 0.9, "rtt {rtt} -> {q} -> {back}");
            assert!(back <= rtt * 1.25 + 2.0e-6, "rtt {rtt} -> {q} -> {back}");
        }
        assert!(unquantize_rtt(quantize_rtt(0.0)) >= RTT_MIN);
        assert!(unquantize_rtt(quantize_rtt(1.0e9)) <= RTT_MAX + 1.0);
    }

    #[test]
    fn rtt_quantisation_is_monotonic() {
        let mut last = 0u8;
        for i in 1..1000 {
            let q = quantize_rtt(i as f64 * 0.001);
            assert!(q >= last);
            last = q;
        }
    }

    #[test]
    fn loss_quantisation() {
        assert_eq!(quantize_loss(0.0), 0);
        assert_eq!(quantize_loss(1.0), 65535);
        assert_eq!(quantize_loss(2.0), 65535);
        let q = quantize_loss(0.25);
        assert!((unquantize_loss(q) - 0.25).abs() < 1.0e-4);
    }

    #[test]
    fn rate_quantisation() {
        for rate in [100.0, 1500.0, 64_000.0, 1.0e6, 5.0e8] {
            let q = quantize_rate(rate);
            let back = unquantize_rate(q);
            assert!(
                (back - rate).abs() / rate < 0.05,
                "rate {rate} -> {q:#06x} -> {back}"
            );
        }
    }

    #[test]
    fn group_size_quantisation_rounds_up() {
        assert_eq!(unquantize_group_size(quantize_group_size(1000.0)), 1000.0);
        assert_eq!(unquantize_group_size(quantize_group_size(500.0)), 500.0);
        assert_eq!(unquantize_group_size(quantize_group_size(501.0)), 1000.0);
        assert_eq!(unquantize_group_size(quantize_group_size(7.0)), 10.0);
        for g in [10.0, 99.0, 4000.0, 123456.0] {
            assert!(unquantize_group_size(quantize_group_size(g)) >= g);
        }
    }

    // ─── Object PDUs ────────────────────────────────────────────────────

    #[test]
    fn info_round_trip() {
        let pdu = Pdu::Info(InfoPdu {
            header: object_header(object_flags::INFO),
            extensions: vec![HeaderExtension::Fti(FtiExtension {
                object_size: ObjectSize::new(0, 100_000),
                fec_instance: 0,
                segment_size: 1024,
                ndata: 32,
                nparity: 8,
            })],
            info: Bytes::from_static(b"object-name"),
        });
        let decoded = round_trip(pdu.clone());
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn data_round_trip_with_fti() {
        let pdu = Pdu::Data(DataPdu {
            header: object_header(object_flags::STREAM | object_flags::MSG_START),
            block_id: BlockId(0xDEADBEEF),
            block_len: 64,
            symbol_id: 63,
            extensions: vec![HeaderExtension::Fti(FtiExtension {
                object_size: ObjectSize::new(0x0001, 0x8000_0000),
                fec_instance: 7,
                segment_size: 1400,
                ndata: 64,
                nparity: 16,
            })],
            payload: Bytes::from(vec![0x55u8; 256]),
        });
        let decoded = round_trip(pdu.clone());
        assert_eq!(decoded, pdu);
        match decoded {
            Pdu::Data(d) => {
                assert!(d.is_data());
                assert!(d.header.flag_is_set(object_flags::STREAM));
            }
            _ => panic!("expected DATA"),
        }
    }

    #[test]
    fn parity_symbol_is_not_data() {
        let pdu = DataPdu {
            header: object_header(0),
            block_id: BlockId(1),
            block_len: 32,
            symbol_id: 32,
            extensions: vec![],
            payload: Bytes::new(),
        };
        assert!(!pdu.is_data());
    }

    // ─── Commands ───────────────────────────────────────────────────────

    fn cmd(body: CmdBody) -> Pdu {
        Pdu::Cmd(CmdPdu {
            sequence: 99,
            source_id: NodeId(1),
            session_id: 0x4242,
            grtt: quantize_rtt(0.25),
            backoff: 4,
            gsize: 2,
            body,
        })
    }

    #[test]
    fn flush_round_trip() {
        let pdu = cmd(CmdBody::Flush {
            position: FecPosition {
                object_id: ObjectId(5),
                block_id: BlockId(7),
                block_len: 16,
                symbol_id: 15,
            },
            acking_nodes: vec![NodeId(10), NodeId(20)],
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    #[test]
    fn eot_round_trip() {
        let pdu = cmd(CmdBody::Eot);
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    #[test]
    fn squelch_round_trip() {
        let pdu = cmd(CmdBody::Squelch {
            position: FecPosition {
                object_id: ObjectId(100),
                block_id: BlockId(0),
                block_len: 32,
                symbol_id: 0,
            },
            invalid_objects: vec![ObjectId(90), ObjectId(91), ObjectId(95)],
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    #[test]
    fn cc_probe_round_trip() {
        let pdu = cmd(CmdBody::Cc {
            cc_sequence: 77,
            send_time_sec: 1234,
            send_time_usec: 567_890,
            extensions: vec![HeaderExtension::CcRate(CcRateExtension {
                send_rate: quantize_rate(250_000.0),
            })],
            nodes: vec![
                CcNodeEntry {
                    node_id: NodeId(3),
                    flags: cc_flags::CLR | cc_flags::RTT,
                    rtt: quantize_rtt(0.1),
                    rate: quantize_rate(100_000.0),
                },
                CcNodeEntry {
                    node_id: NodeId(4),
                    flags: cc_flags::PLR,
                    rtt: quantize_rtt(0.2),
                    rate: quantize_rate(200_000.0),
                },
            ],
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    #[test]
    fn repair_adv_round_trip() {
        let mut req = RepairRequest::new(RepairForm::Ranges, repair_flags::BLOCK);
        req.items.push(RepairItem {
            object_id: ObjectId(1),
            block_id: BlockId(2),
            block_len: 16,
            symbol_id: 0,
        });
        req.items.push(RepairItem {
            object_id: ObjectId(1),
            block_id: BlockId(9),
            block_len: 16,
            symbol_id: 0,
        });
        let pdu = cmd(CmdBody::RepairAdv {
            flags: REPAIR_ADV_FLAG_LIMIT,
            extensions: vec![],
            requests: vec![req],
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    #[test]
    fn ack_req_round_trip() {
        let pdu = cmd(CmdBody::AckReq {
            ack_type: 16,
            ack_id: 3,
            acking_nodes: vec![NodeId(1), NodeId(2), NodeId(3)],
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    #[test]
    fn application_cmd_round_trip() {
        let pdu = cmd(CmdBody::Application {
            content: Bytes::from_static(b"app-defined"),
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    // ─── NACK / ACK ─────────────────────────────────────────────────────

    #[test]
    fn nack_round_trip_with_cc_feedback() {
        let mut items = RepairRequest::new(
            RepairForm::Items,
            repair_flags::SEGMENT | repair_flags::BLOCK,
        );
        items.items.push(RepairItem {
            object_id: ObjectId(12),
            block_id: BlockId(3),
            block_len: 32,
            symbol_id: 17,
        });
        let pdu = Pdu::Nack(NackPdu {
            sequence: 1,
            source_id: NodeId(500),
            server_id: NodeId(1),
            session_id: 0x4242,
            grtt_response_sec: 100,
            grtt_response_usec: 250_000,
            extensions: vec![HeaderExtension::CcFeedback(CcFeedbackExtension {
                cc_sequence: 9,
                cc_flags: cc_flags::RTT | cc_flags::START,
                cc_rtt: quantize_rtt(0.05),
                cc_loss: quantize_loss(0.0),
                cc_rate: quantize_rate(50_000.0),
            })],
            requests: vec![items],
        });
        let decoded = round_trip(pdu.clone());
        assert_eq!(decoded, pdu);
        match decoded {
            Pdu::Nack(nack) => {
                let fb = nack.cc_feedback().expect("cc feedback present");
                assert!(fb.flag_is_set(cc_flags::START));
            }
            _ => panic!("expected NACK"),
        }
    }

    #[test]
    fn flush_ack_round_trip() {
        let pdu = Pdu::Ack(AckPdu {
            sequence: 5,
            source_id: NodeId(500),
            server_id: NodeId(1),
            session_id: 0x4242,
            ack_type: AckType::Flush,
            ack_id: 0,
            grtt_response_sec: 10,
            grtt_response_usec: 20,
            extensions: vec![HeaderExtension::CcFeedback(CcFeedbackExtension::default())],
            position: Some(FecPosition {
                object_id: ObjectId(5),
                block_id: BlockId(7),
                block_len: 16,
                symbol_id: 15,
            }),
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    #[test]
    fn cc_ack_round_trip() {
        let pdu = Pdu::Ack(AckPdu {
            sequence: 5,
            source_id: NodeId(500),
            server_id: NodeId(1),
            session_id: 0x4242,
            ack_type: AckType::Cc,
            ack_id: 0,
            grtt_response_sec: 10,
            grtt_response_usec: 20,
            extensions: vec![],
            position: None,
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    // ─── Repair Request Iteration ───────────────────────────────────────

    #[test]
    fn repair_request_entries_pair_ranges() {
        let mut req = RepairRequest::new(RepairForm::Ranges, repair_flags::OBJECT);
        for id in [10u16, 14, 20, 22] {
            req.items.push(RepairItem {
                object_id: ObjectId(id),
                block_id: BlockId(0),
                block_len: 16,
                symbol_id: 0,
            });
        }
        let entries: Vec<RepairEntry> = req.entries().collect();
        assert_eq!(entries.len(), 2);
        match entries[0] {
            RepairEntry::Range(start, end) => {
                assert_eq!(start.object_id, ObjectId(10));
                assert_eq!(end.object_id, ObjectId(14));
            }
            _ => panic!("expected range"),
        }
    }

    // ─── Malformed Input ────────────────────────────────────────────────

    #[test]
    fn decode_rejects_garbage() {
        assert!(Pdu::decode(Bytes::from_static(b"")).is_none());
        assert!(Pdu::decode(Bytes::from_static(b"\x00\x00\x00")).is_none());
        // Wrong version nibble.
        assert!(Pdu::decode(Bytes::from(vec![0x21, 4, 0, 0, 0, 0, 0, 1])).is_none());
        // Unknown type nibble.
        assert!(Pdu::decode(Bytes::from(vec![0x1F, 4, 0, 0, 0, 0, 0, 1])).is_none());
    }

    #[test]
    fn decode_rejects_header_length_beyond_datagram() {
        let pdu = cmd(CmdBody::Eot);
        let mut bytes = pdu.encode();
        bytes[1] = 64; // claim a 256-byte header in a 16-byte datagram
        assert!(Pdu::decode(bytes.freeze()).is_none());
    }

    #[test]
    fn decode_rejects_truncated_repair_items() {
        let mut req = RepairRequest::new(RepairForm::Items, repair_flags::BLOCK);
        req.items.push(RepairItem {
            object_id: ObjectId(1),
            block_id: BlockId(1),
            block_len: 8,
            symbol_id: 0,
        });
        let pdu = Pdu::Nack(NackPdu {
            sequence: 0,
            source_id: NodeId(2),
            server_id: NodeId(1),
            session_id: 0,
            grtt_response_sec: 0,
            grtt_response_usec: 0,
            extensions: vec![],
            requests: vec![req],
        });
        let bytes = pdu.encode();
        let truncated = bytes.freeze().slice(0..bytes_len_minus(&pdu, 5));
        assert!(Pdu::decode(truncated).is_none());
    }

    fn bytes_len_minus(pdu: &Pdu, n: usize) -> usize {
        pdu.encode().len() - n
    }

    #[test]
    fn unknown_extension_skipped_and_preserved() {
        let pdu = Pdu::Nack(NackPdu {
            sequence: 0,
            source_id: NodeId(2),
            server_id: NodeId(1),
            session_id: 0,
            grtt_response_sec: 0,
            grtt_response_usec: 0,
            extensions: vec![HeaderExtension::Unknown {
                ext_type: 60,
                body: Bytes::from_static(&[0xAA; 6]),
            }],
            requests: vec![],
        });
        assert_eq!(round_trip(pdu.clone()), pdu);
    }

    #[test]
    fn sequence_accessors() {
        let mut pdu = cmd(CmdBody::Eot);
        assert_eq!(pdu.sequence(), 99);
        pdu.set_sequence(123);
        assert_eq!(pdu.sequence(), 123);
        assert_eq!(pdu.source_id(), NodeId(1));
    }
}
