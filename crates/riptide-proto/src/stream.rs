//! # Stream Objects
//!
//! A stream object delivers an unbounded byte sequence through a sliding
//! window of FEC blocks. Each stream segment payload is prefixed with an
//! 8-byte header carrying the segment's byte offset into the stream and the
//! valid payload length; message boundaries are flagged out-of-band with the
//! `MSG_START` PDU flag.
//!
//! The write side fills segments in order, closing each (stamping its
//! header) when full, on end-of-message, or on an active flush. The read
//! side walks closed segments in order, using `payload_offset` to detect
//! bytes lost beyond repair; a gap breaks the stream and resynchronises the
//! read offset to the next available segment.

use std::collections::VecDeque;

use crate::seq::{BlockId, SegmentId};
use crate::wire::stream_payload;

/// Flush behavior for stream writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Segments are only emitted when full.
    #[default]
    None,
    /// Partial segments are closed and sent immediately.
    Passive,
    /// Like `Passive`, and the sender follows with a `CMD(FLUSH)`.
    Active,
}

struct StreamSegmentBuf {
    /// Wire payload: 8-byte stream header + data.
    payload: Vec<u8>,
    /// Bytes of data currently in the segment (excluding the header).
    data_len: u16,
    msg_start: bool,
    closed: bool,
}

struct StreamBlock {
    id: BlockId,
    segments: Vec<Option<StreamSegmentBuf>>,
}

impl StreamBlock {
    fn new(id: BlockId, ndata: u16) -> Self {
        StreamBlock {
            id,
            segments: (0..ndata).map(|_| None).collect(),
        }
    }
}

/// Result of a stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamRead {
    pub bytes: usize,
    /// Bytes were irrecoverably lost before this read; `read_offset` was
    /// advanced past the gap.
    pub broken: bool,
}

/// Sliding-buffer state for one stream object.
pub struct StreamState {
    segment_size: u16,
    ndata: u16,
    num_blocks: u32,
    blocks: VecDeque<StreamBlock>,
    // Write side.
    write_block: BlockId,
    write_segment: SegmentId,
    write_offset: u32,
    newly_closed: Vec<(BlockId, SegmentId)>,
    msg_start_pending: bool,
    // Read side.
    read_block: BlockId,
    read_segment: SegmentId,
    /// Byte position within the current read segment's data.
    read_byte: usize,
    read_offset: u32,
    pending_broken: bool,
    // Window state.
    sync: bool,
    sync_id: BlockId,
    pub flush_mode: FlushMode,
    /// An active flush is owed a `CMD(FLUSH)` transmission.
    pub flush_pending: bool,
    resync_count: u64,
}

impl StreamState {
    /// `segment_size` is the wire payload size (header included);
    /// `num_blocks` bounds the buffer window.
    pub fn new(segment_size: u16, ndata: u16, num_blocks: u32) -> Self {
        assert!(segment_size as usize > stream_payload::HEADER_LEN);
        StreamState {
            segment_size,
            ndata,
            num_blocks: num_blocks.max(1),
            blocks: VecDeque::new(),
            write_block: BlockId(0),
            write_segment: 0,
            write_offset: 0,
            newly_closed: Vec::new(),
            msg_start_pending: true,
            read_block: BlockId(0),
            read_segment: 0,
            read_byte: 0,
            read_offset: 0,
            pending_broken: false,
            sync: false,
            sync_id: BlockId(0),
            flush_mode: FlushMode::None,
            flush_pending: false,
            resync_count: 0,
        }
    }

    fn data_capacity(&self) -> usize {
        self.segment_size as usize - stream_payload::HEADER_LEN
    }

    pub fn write_index(&self) -> (BlockId, SegmentId) {
        (self.write_block, self.write_segment)
    }

    pub fn read_index(&self) -> (BlockId, SegmentId) {
        (self.read_block, self.read_segment)
    }

    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    pub fn read_offset(&self) -> u32 {
        self.read_offset
    }

    pub fn resync_count(&self) -> u64 {
        self.resync_count
    }

    /// Oldest block id still buffered (the repair low-water mark).
    pub fn buffer_low(&self) -> BlockId {
        self.blocks.front().map(|b| b.id).unwrap_or(self.write_block)
    }

    /// Newly closed segments since the last call (write side), in order.
    pub fn drain_closed(&mut self) -> Vec<(BlockId, SegmentId)> {
        std::mem::take(&mut self.newly_closed)
    }

    // ─── Block Window ───────────────────────────────────────────────────

    fn find_block(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    /// Get the block, creating it (evicting the oldest when the window is
    /// full). Returns `None` when `id` precedes the buffered window.
    fn get_or_create_block(&mut self, id: BlockId) -> Option<usize> {
        if let Some(idx) = self.find_block(id) {
            return Some(idx);
        }
        if let Some(front) = self.blocks.front() {
            if id < front.id {
                return None;
            }
        }
        while self.blocks.len() >= self.num_blocks as usize {
            let evicted = self.blocks.pop_front().expect("window is non-empty");
            // Unread bytes in the evicted block are lost to the reader.
            if self.sync && evicted.id >= self.read_block {
                self.pending_broken = true;
                self.read_block = evicted.id.next();
                self.read_segment = 0;
                self.read_byte = 0;
                self.resync_count += 1;
            }
        }
        self.blocks.push_back(StreamBlock::new(id, self.ndata));
        Some(self.blocks.len() - 1)
    }

    // ─── Write Side (sender application) ────────────────────────────────

    /// Append bytes to the stream. `eom` marks the end of an application
    /// message: the current segment closes and the next write starts a
    /// `MSG_START` segment. Under `FlushMode::Active` a zero-length write
    /// (or any `eom`) arms `flush_pending`. Returns the bytes consumed.
    pub fn write(&mut self, buf: &[u8], eom: bool) -> usize {
        let mut written = 0;
        while written < buf.len() {
            let capacity = self.data_capacity();
            let seg_size = self.segment_size as usize;
            let (block_id, seg_id) = (self.write_block, self.write_segment);
            let msg_start = self.msg_start_pending;
            let Some(idx) = self.get_or_create_block(block_id) else {
                break;
            };
            let seg = self.blocks[idx].segments[seg_id as usize].get_or_insert_with(|| {
                StreamSegmentBuf {
                    payload: vec![0u8; seg_size],
                    data_len: 0,
                    msg_start,
                    closed: false,
                }
            });
            let room = capacity - seg.data_len as usize;
            let take = room.min(buf.len() - written);
            let at = stream_payload::HEADER_LEN + seg.data_len as usize;
            seg.payload[at..at + take].copy_from_slice(&buf[written..written + take]);
            seg.data_len += take as u16;
            written += take;
            self.msg_start_pending = false;
            if seg.data_len as usize == capacity {
                self.close_write_segment();
            }
        }
        if eom {
            self.close_write_segment();
            self.msg_start_pending = true;
        }
        match self.flush_mode {
            FlushMode::Passive => {
                self.close_write_segment();
            }
            FlushMode::Active => {
                self.close_write_segment();
                self.flush_pending = true;
            }
            FlushMode::None => {}
        }
        written
    }

    /// Stamp the current partial segment's header and advance the write
    /// index. No-op when the current segment is empty.
    fn close_write_segment(&mut self) {
        let (block_id, seg_id) = (self.write_block, self.write_segment);
        let Some(idx) = self.find_block(block_id) else {
            return;
        };
        let Some(seg) = self.blocks[idx].segments[seg_id as usize].as_mut() else {
            return;
        };
        if seg.closed || seg.data_len == 0 {
            return;
        }
        stream_payload::write(&mut seg.payload, seg.data_len, self.write_offset);
        seg.closed = true;
        self.write_offset = self.write_offset.wrapping_add(seg.data_len as u32);
        self.newly_closed.push((block_id, seg_id));
        self.write_segment += 1;
        if self.write_segment >= self.ndata {
            self.write_segment = 0;
            self.write_block = self.write_block.next();
        }
    }

    // ─── Segment I/O (tx reads, rx writes) ──────────────────────────────

    /// Copy a closed segment's wire payload into `buf` (tx path).
    pub fn read_segment(
        &mut self,
        block_id: BlockId,
        segment_id: SegmentId,
        buf: &mut [u8],
    ) -> Option<usize> {
        let idx = self.find_block(block_id)?;
        let seg = self.blocks[idx].segments[segment_id as usize].as_ref()?;
        if !seg.closed {
            return None;
        }
        let len = stream_payload::HEADER_LEN + seg.data_len as usize;
        buf[..len].copy_from_slice(&seg.payload[..len]);
        Some(len)
    }

    /// Whether the segment begins an application message (tx path).
    pub fn segment_is_msg_start(&self, block_id: BlockId, segment_id: SegmentId) -> bool {
        self.find_block(block_id)
            .and_then(|idx| self.blocks[idx].segments[segment_id as usize].as_ref())
            .is_some_and(|seg| seg.msg_start)
    }

    /// Store a received segment payload (rx path). Returns `false` for
    /// segments preceding the buffered window or malformed payloads.
    pub fn write_segment(
        &mut self,
        block_id: BlockId,
        segment_id: SegmentId,
        payload: &[u8],
    ) -> bool {
        self.write_segment_flagged(block_id, segment_id, payload, false)
    }

    pub fn write_segment_flagged(
        &mut self,
        block_id: BlockId,
        segment_id: SegmentId,
        payload: &[u8],
        msg_start: bool,
    ) -> bool {
        if payload.len() < stream_payload::HEADER_LEN
            || payload.len() > self.segment_size as usize
            || segment_id >= self.ndata
        {
            return false;
        }
        if !self.sync {
            // First segment of a late join anchors the read side.
            self.sync = true;
            self.sync_id = block_id;
            self.read_block = block_id;
            self.read_segment = segment_id;
            self.read_byte = 0;
            self.read_offset = stream_payload::read_offset(payload);
        }
        let Some(idx) = self.get_or_create_block(block_id) else {
            return false;
        };
        if self.blocks[idx].segments[segment_id as usize].is_some() {
            return true; // duplicate
        }
        let mut buf = vec![0u8; self.segment_size as usize];
        buf[..payload.len()].copy_from_slice(payload);
        let data_len = stream_payload::read_length(&buf);
        if data_len as usize > self.data_capacity() {
            return false;
        }
        let slot = &mut self.blocks[idx].segments[segment_id as usize];
        *slot = Some(StreamSegmentBuf {
            payload: buf,
            data_len,
            msg_start,
            closed: true,
        });
        if block_id > self.write_block
            || (block_id == self.write_block && segment_id >= self.write_segment)
        {
            self.write_block = block_id;
            self.write_segment = segment_id + 1;
            if self.write_segment >= self.ndata {
                self.write_segment = 0;
                self.write_block = self.write_block.next();
            }
        }
        true
    }

    // ─── Read Side (receiver application) ───────────────────────────────

    /// Copy in-order stream bytes into `buf`. When `find_msg_start` is set
    /// and the read position is mid-message, skips forward to the next
    /// `MSG_START` segment. Gaps detected via `payload_offset` mark the
    /// read broken and resynchronise.
    pub fn read(&mut self, buf: &mut [u8], find_msg_start: bool) -> StreamRead {
        let mut result = StreamRead {
            bytes: 0,
            broken: std::mem::take(&mut self.pending_broken),
        };
        let mut seeking_start = find_msg_start;
        while result.bytes < buf.len() {
            let Some(idx) = self.find_block(self.read_block) else {
                break;
            };
            let Some(seg) = self.blocks[idx].segments[self.read_segment as usize].as_ref() else {
                break;
            };
            if !seg.closed {
                break;
            }
            let seg_offset = stream_payload::read_offset(&seg.payload);
            if self.read_byte == 0 {
                let delta = seg_offset.wrapping_sub(self.read_offset) as i32;
                if delta > 0 {
                    // Bytes were lost ahead of this segment.
                    result.broken = true;
                    self.read_offset = seg_offset;
                    self.resync_count += 1;
                } else if delta < 0 {
                    // Stale overlap; should not happen with in-order reads.
                    self.read_offset = seg_offset;
                }
            }
            if seeking_start {
                if seg.msg_start && self.read_byte == 0 {
                    seeking_start = false;
                } else {
                    let data_len = seg.data_len;
                    self.advance_read_segment(data_len);
                    continue;
                }
            }
            let data = &seg.payload[stream_payload::HEADER_LEN..];
            let avail = seg.data_len as usize - self.read_byte;
            let take = avail.min(buf.len() - result.bytes);
            buf[result.bytes..result.bytes + take]
                .copy_from_slice(&data[self.read_byte..self.read_byte + take]);
            result.bytes += take;
            self.read_byte += take;
            self.read_offset = self.read_offset.wrapping_add(take as u32);
            if self.read_byte == seg.data_len as usize {
                self.read_byte = 0;
                self.read_segment += 1;
                if self.read_segment >= self.ndata {
                    self.read_segment = 0;
                    self.read_block = self.read_block.next();
                }
            }
        }
        result
    }

    fn advance_read_segment(&mut self, data_len: u16) {
        self.read_offset = self
            .read_offset
            .wrapping_add(data_len as u32 - self.read_byte as u32);
        self.read_byte = 0;
        self.read_segment += 1;
        if self.read_segment >= self.ndata {
            self.read_segment = 0;
            self.read_block = self.read_block.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamState {
        // 24-byte wire segments -> 16 data bytes; 4 segments per block.
        StreamState::new(24, 4, 4)
    }

    // ─── Write Side ─────────────────────────────────────────────────────

    #[test]
    fn write_fills_and_closes_segments() {
        let mut s = stream();
        let n = s.write(&[0xAB; 40], false);
        assert_eq!(n, 40);
        // 40 bytes / 16 per segment: two closed, one partial.
        let closed = s.drain_closed();
        assert_eq!(closed, vec![(BlockId(0), 0), (BlockId(0), 1)]);
        assert_eq!(s.write_index(), (BlockId(0), 2));
        assert_eq!(s.write_offset(), 32); // only closed bytes counted
    }

    #[test]
    fn eom_closes_partial_segment_and_flags_next() {
        let mut s = stream();
        s.write(b"hello", true);
        let closed = s.drain_closed();
        assert_eq!(closed, vec![(BlockId(0), 0)]);
        assert!(s.segment_is_msg_start(BlockId(0), 0));
        s.write(b"world", true);
        assert!(s.segment_is_msg_start(BlockId(0), 1));
    }

    #[test]
    fn active_flush_arms_flush_pending() {
        let mut s = stream();
        s.write(&[0u8; 100], false);
        assert!(!s.flush_pending);
        s.flush_mode = FlushMode::Active;
        s.write(&[], true);
        assert!(s.flush_pending);
        // Flush pointed at the segment before the write index.
        assert_eq!(s.write_index(), (BlockId(1), 3));
    }

    #[test]
    fn write_crosses_block_boundary() {
        let mut s = stream();
        s.write(&[1u8; 16 * 5], false); // 5 full segments, 4 per block
        let closed = s.drain_closed();
        assert_eq!(closed.len(), 5);
        assert_eq!(closed[4], (BlockId(1), 0));
        assert_eq!(s.write_index(), (BlockId(1), 1));
    }

    #[test]
    fn tx_read_segment_returns_wire_payload() {
        let mut s = stream();
        s.write(&[0x42; 16], false);
        let mut buf = vec![0u8; 24];
        let len = s.read_segment(BlockId(0), 0, &mut buf).unwrap();
        assert_eq!(len, 24);
        assert_eq!(stream_payload::read_length(&buf), 16);
        assert_eq!(stream_payload::read_offset(&buf), 0);
        assert_eq!(&buf[8..], &[0x42; 16]);
        assert!(s.read_segment(BlockId(0), 1, &mut buf).is_none(), "open segment");
    }

    // ─── Rx Side ────────────────────────────────────────────────────────

    fn wire_segment(data: &[u8], offset: u32) -> Vec<u8> {
        let mut payload = vec![0u8; stream_payload::HEADER_LEN + data.len()];
        stream_payload::write(&mut payload, data.len() as u16, offset);
        payload[stream_payload::HEADER_LEN..].copy_from_slice(data);
        payload
    }

    #[test]
    fn rx_in_order_read() {
        let mut s = stream();
        assert!(s.write_segment(BlockId(0), 0, &wire_segment(&[1; 16], 0)));
        assert!(s.write_segment(BlockId(0), 1, &wire_segment(&[2; 16], 16)));
        let mut buf = [0u8; 64];
        let r = s.read(&mut buf, false);
        assert_eq!(r.bytes, 32);
        assert!(!r.broken);
        assert_eq!(&buf[..16], &[1; 16]);
        assert_eq!(&buf[16..32], &[2; 16]);
        assert_eq!(s.read_offset(), 32);
    }

    #[test]
    fn rx_gap_breaks_stream_and_resyncs() {
        let mut s = stream();
        s.write_segment(BlockId(0), 0, &wire_segment(&[1; 16], 0));
        // Segment 1 lost for good; segment 2 arrives with offset 32.
        s.write_segment(BlockId(0), 2, &wire_segment(&[3; 16], 32));
        let mut buf = [0u8; 16];
        let r = s.read(&mut buf, false);
        assert_eq!(r.bytes, 16);
        assert!(!r.broken);
        // Reader stalls at the missing segment until repair gives up...
        let r = s.read(&mut buf, false);
        assert_eq!(r.bytes, 0);
        // ...then the hole is surfaced when the mask abandons it; simulate
        // by storing a zero-length close of segment 1? The reader resyncs
        // via offset on the next present segment after skipping.
        s.read_byte = 0;
        s.read_segment = 2;
        let r = s.read(&mut buf, false);
        assert!(r.broken, "offset jump must mark the stream broken");
        assert_eq!(r.bytes, 16);
        assert_eq!(&buf[..16], &[3; 16]);
        assert_eq!(s.resync_count(), 1);
    }

    #[test]
    fn rx_late_join_anchors_read_offset() {
        let mut s = stream();
        s.write_segment(BlockId(5), 2, &wire_segment(&[7; 16], 1000));
        assert_eq!(s.read_index(), (BlockId(5), 2));
        assert_eq!(s.read_offset(), 1000);
        let mut buf = [0u8; 16];
        let r = s.read(&mut buf, false);
        assert_eq!(r.bytes, 16);
        assert_eq!(s.read_offset(), 1016);
    }

    #[test]
    fn rx_find_msg_start_skips_partial_message() {
        let mut s = stream();
        let mut seg0 = wire_segment(&[1; 16], 0);
        let _ = seg0;
        s.write_segment(BlockId(0), 0, &wire_segment(&[1; 16], 0));
        s.write_segment_flagged(BlockId(0), 1, &wire_segment(&[2; 16], 16), true);
        let mut buf = [0u8; 64];
        let r = s.read(&mut buf, true);
        assert_eq!(r.bytes, 16);
        assert_eq!(&buf[..16], &[2; 16], "should skip to the MSG_START segment");
    }

    #[test]
    fn rx_window_eviction_breaks_unread_data() {
        let mut s = StreamState::new(24, 2, 2); // tiny window: 2 blocks x 2 segs
        s.write_segment(BlockId(0), 0, &wire_segment(&[1; 16], 0));
        s.write_segment(BlockId(1), 0, &wire_segment(&[2; 16], 32));
        // Block 2 evicts block 0, whose data was never read.
        s.write_segment(BlockId(2), 0, &wire_segment(&[3; 16], 64));
        let mut buf = [0u8; 16];
        let r = s.read(&mut buf, false);
        assert!(r.broken);
    }

    #[test]
    fn duplicate_rx_segment_is_accepted_quietly() {
        let mut s = stream();
        assert!(s.write_segment(BlockId(0), 0, &wire_segment(&[1; 16], 0)));
        assert!(s.write_segment(BlockId(0), 0, &wire_segment(&[9; 16], 0)));
        let mut buf = [0u8; 16];
        s.read(&mut buf, false);
        assert_eq!(&buf[..16], &[1; 16], "first copy wins");
    }
}
