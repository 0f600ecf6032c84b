//! # Transport Object Model
//!
//! A transport object is a bounded unit of delivery: an in-memory buffer, a
//! file (backed by storage the embedding provides), or an unbounded byte
//! stream. All three share the FEC block structure, the out-of-band info
//! slot, and the pending/repair block masks; they differ only in how
//! segments are read and written.

use crate::bitmask::SlidingMask;
use crate::pool::{Block, BlockBuffer, BlockPool, SegmentPool};
use crate::seq::{BlockId, ObjectId, ObjectSize, SegmentId};
use crate::stream::StreamState;

// ─── FEC Block Geometry ─────────────────────────────────────────────────────

/// Block structure for an object: segment counts are divided into `B` FEC
/// blocks of at most `ndata` source symbols, the first `large_block_count`
/// of them one segment longer when the division is not exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecGeometry {
    pub segment_size: u16,
    pub ndata: u16,
    pub nparity: u16,
    pub large_block_count: u32,
    pub large_block_size: u16,
    pub small_block_count: u32,
    pub small_block_size: u16,
    pub final_block_id: BlockId,
    pub final_segment_size: u16,
}

impl FecGeometry {
    /// Compute the block structure for `object_size` bytes.
    pub fn compute(object_size: ObjectSize, segment_size: u16, ndata: u16, nparity: u16) -> Self {
        let seg = ObjectSize::from(segment_size as u32);
        let num_segments = object_size / seg;
        let num_blocks = num_segments / ObjectSize::from(ndata as u32);
        let num_blocks = num_blocks.value().max(1);
        let num_segments_v = num_segments.value().max(1);

        let large_block_size = num_segments_v.div_ceil(num_blocks) as u16;
        let (large_block_count, small_block_size, small_block_count);
        if num_segments_v == num_blocks * large_block_size as u64 {
            small_block_size = large_block_size;
            small_block_count = num_blocks as u32;
            large_block_count = 0;
        } else {
            small_block_size = large_block_size - 1;
            large_block_count =
                (num_segments_v - num_blocks * small_block_size as u64) as u32;
            small_block_count = num_blocks as u32 - large_block_count;
        }
        let final_segment_size = {
            let full = (num_segments_v - 1) * segment_size as u64;
            (object_size.value() - full) as u16
        };
        FecGeometry {
            segment_size,
            ndata,
            nparity,
            large_block_count,
            large_block_size,
            small_block_count,
            small_block_size,
            final_block_id: BlockId(large_block_count + small_block_count - 1),
            final_segment_size,
        }
    }

    /// Geometry for a stream object: every block is full-size over the
    /// stream buffer window.
    pub fn for_stream(buffer_size: ObjectSize, segment_size: u16, ndata: u16, nparity: u16) -> Self {
        let num_segments = buffer_size / ObjectSize::from(segment_size as u32);
        let num_blocks =
            (num_segments / ObjectSize::from(ndata as u32)).value().max(1) as u32;
        FecGeometry {
            segment_size,
            ndata,
            nparity,
            large_block_count: 0,
            large_block_size: ndata,
            small_block_count: num_blocks,
            small_block_size: ndata,
            final_block_id: BlockId(num_blocks - 1),
            final_segment_size: segment_size,
        }
    }

    pub fn total_blocks(&self) -> u32 {
        self.large_block_count + self.small_block_count
    }

    /// Source symbol count of `block_id`.
    pub fn block_len(&self, block_id: BlockId) -> u16 {
        if block_id.value() < self.large_block_count {
            self.large_block_size
        } else {
            self.small_block_size
        }
    }

    /// Segment index within the object of `(block_id, segment_id)`.
    fn segment_index(&self, block_id: BlockId, segment_id: SegmentId) -> u64 {
        let b = block_id.value() as u64;
        let large = self.large_block_count as u64;
        let base = if b <= large {
            b * self.large_block_size as u64
        } else {
            large * self.large_block_size as u64 + (b - large) * self.small_block_size as u64
        };
        base + segment_id as u64
    }

    /// Byte offset of a source segment within the object.
    pub fn segment_offset(&self, block_id: BlockId, segment_id: SegmentId) -> u64 {
        self.segment_index(block_id, segment_id) * self.segment_size as u64
    }

    /// On-the-wire length of a source segment (the final segment of the
    /// final block may be short).
    pub fn segment_len(&self, block_id: BlockId, segment_id: SegmentId) -> u16 {
        if block_id == self.final_block_id && segment_id + 1 == self.block_len(block_id) {
            self.final_segment_size
        } else {
            self.segment_size
        }
    }
}

// ─── Storage ────────────────────────────────────────────────────────────────

/// Segment-granular storage backing a bulk or file object. File-backed
/// storage is implemented by the embedding (the engine does no file I/O).
pub trait SegmentStorage: Send {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read, or
    /// `None` on storage failure.
    fn read_segment(&mut self, offset: u64, buf: &mut [u8]) -> Option<usize>;

    /// Write `data` at `offset`.
    fn write_segment(&mut self, offset: u64, data: &[u8]) -> bool;

    fn size(&self) -> u64;
}

/// In-memory storage for bulk data objects.
pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn with_size(size: usize) -> Self {
        MemoryStorage {
            data: vec![0u8; size],
        }
    }

    pub fn from_data(data: Vec<u8>) -> Self {
        MemoryStorage { data }
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl SegmentStorage for MemoryStorage {
    fn read_segment(&mut self, offset: u64, buf: &mut [u8]) -> Option<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return None;
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Some(n)
    }

    fn write_segment(&mut self, offset: u64, data: &[u8]) -> bool {
        let offset = offset as usize;
        if offset + data.len() > self.data.len() {
            return false;
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

// ─── Object ─────────────────────────────────────────────────────────────────

/// How a receiver requests repair for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackingMode {
    /// Never request repair.
    None,
    /// Request only the out-of-band info.
    InfoOnly,
    /// Request full reliable delivery.
    #[default]
    Normal,
}

/// Object payload variant.
pub enum ObjectData {
    /// In-memory bulk data.
    Bulk(MemoryStorage),
    /// External storage (typically a file) provided by the embedding.
    File(Box<dyn SegmentStorage>),
    /// Byte stream with a sliding buffer window.
    Stream(StreamState),
}

impl ObjectData {
    pub fn is_stream(&self) -> bool {
        matches!(self, ObjectData::Stream(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ObjectData::File(_))
    }
}

/// A transport object with its block-level pending/repair state and
/// in-flight block buffer.
pub struct Object {
    id: ObjectId,
    size: ObjectSize,
    geometry: FecGeometry,
    data: ObjectData,
    info: Option<Vec<u8>>,
    pub pending_info: bool,
    pub repair_info: bool,
    /// The info has been transmitted at least once (later sends are
    /// flagged as repair so they never establish receiver sync).
    pub info_sent: bool,
    pub nacking_mode: NackingMode,
    /// Blocks still owed (tx: to any receiver; rx: to the application).
    pending: SlidingMask,
    /// Blocks with repair state accumulated during a NACK aggregation
    /// window, awaiting activation.
    repair: SlidingMask,
    blocks: BlockBuffer,
    /// Highest block the receiver has seen transmission for.
    pub max_pending_block: BlockId,
    pub max_pending_segment: SegmentId,
}

impl Object {
    /// Open an object. For streams, `size` is the buffer window size.
    pub fn open(
        id: ObjectId,
        size: ObjectSize,
        data: ObjectData,
        info: Option<Vec<u8>>,
        segment_size: u16,
        ndata: u16,
        nparity: u16,
    ) -> Object {
        let geometry = if data.is_stream() {
            FecGeometry::for_stream(size, segment_size, ndata, nparity)
        } else {
            FecGeometry::compute(size, segment_size, ndata, nparity)
        };
        let num_blocks = geometry.total_blocks() as usize;
        let pending_info = info.is_some();
        Object {
            id,
            size,
            geometry,
            data,
            info,
            pending_info,
            repair_info: false,
            info_sent: false,
            nacking_mode: NackingMode::Normal,
            pending: SlidingMask::new(num_blocks, 0xFFFF_FFFF),
            repair: SlidingMask::new(num_blocks, 0xFFFF_FFFF),
            blocks: BlockBuffer::new(num_blocks as u32),
            max_pending_block: BlockId(0),
            max_pending_segment: 0,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn size(&self) -> ObjectSize {
        self.size
    }

    pub fn geometry(&self) -> &FecGeometry {
        &self.geometry
    }

    pub fn info(&self) -> Option<&[u8]> {
        self.info.as_deref()
    }

    pub fn set_info(&mut self, info: Vec<u8>) {
        self.pending_info = true;
        self.info = Some(info);
    }

    pub fn data(&self) -> &ObjectData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ObjectData {
        &mut self.data
    }

    pub fn is_stream(&self) -> bool {
        self.data.is_stream()
    }

    pub fn stream(&self) -> Option<&StreamState> {
        match &self.data {
            ObjectData::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn stream_mut(&mut self) -> Option<&mut StreamState> {
        match &mut self.data {
            ObjectData::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn blocks(&self) -> &BlockBuffer {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BlockBuffer {
        &mut self.blocks
    }

    // ─── Pending / Repair Masks ─────────────────────────────────────────

    /// Anything still owed, info included.
    pub fn is_pending(&self) -> bool {
        self.pending_info || self.pending.is_set()
    }

    pub fn is_block_pending(&self, block_id: BlockId) -> bool {
        self.pending.test(block_id.value())
    }

    pub fn first_pending_block(&self) -> Option<BlockId> {
        self.pending.first_set().map(BlockId)
    }

    pub fn last_pending_block(&self) -> Option<BlockId> {
        self.pending.last_set().map(BlockId)
    }

    pub fn next_pending_block(&self, from: BlockId) -> Option<BlockId> {
        self.pending.next_set(from.value()).map(BlockId)
    }

    pub fn set_block_pending(&mut self, block_id: BlockId) -> bool {
        self.pending.set(block_id.value())
    }

    pub fn set_blocks_pending(&mut self, from: BlockId, count: usize) -> bool {
        self.pending.set_bits(from.value(), count)
    }

    pub fn unset_block_pending(&mut self, block_id: BlockId) {
        self.pending.unset(block_id.value())
    }

    pub fn clear_block_pending(&mut self) {
        self.pending.clear()
    }

    pub fn pending_block_count(&self) -> usize {
        self.pending.count()
    }

    pub fn set_block_repair(&mut self, block_id: BlockId) -> bool {
        self.repair.set(block_id.value())
    }

    pub fn set_blocks_repair(&mut self, from: BlockId, count: usize) -> bool {
        self.repair.set_bits(from.value(), count)
    }

    pub fn is_block_repair(&self, block_id: BlockId) -> bool {
        self.repair.test(block_id.value())
    }

    pub fn is_repair_pending(&self) -> bool {
        self.repair_info || self.repair.is_set()
    }

    /// Mark the whole object pending for (re)transmission.
    pub fn tx_reset(&mut self) {
        self.pending_info = self.info.is_some();
        self.repair_info = false;
        self.pending.clear();
        self.pending.set_bits(0, self.geometry.total_blocks() as usize);
        self.repair.clear();
    }

    /// Mark blocks `from..` pending for retransmission.
    pub fn tx_reset_from(&mut self, from: BlockId) -> bool {
        let total = self.geometry.total_blocks();
        let count = (total as u64 - from.value() as u64).min(total as u64) as usize;
        self.pending.set_bits(from.value(), count)
    }

    /// Record an INFO repair request.
    pub fn handle_info_request(&mut self, holdoff: bool) {
        if self.info.is_some() {
            if holdoff {
                self.pending_info = true;
            } else {
                self.repair_info = true;
            }
        }
    }

    /// Activate accumulated repair state into the pending masks (the end
    /// of a sender NACK aggregation window). Per-block repair state
    /// activates too. Returns whether anything became pending.
    pub fn activate_repairs(&mut self) -> bool {
        let mut activated = false;
        if self.repair_info {
            self.pending_info = true;
            self.repair_info = false;
            activated = true;
        }
        if self.repair.is_set() {
            self.pending.add(&self.repair);
            self.repair.clear();
            activated = true;
        }
        for id in self.blocks.ids_in_order() {
            if let Some(block) = self.blocks.find_mut(id) {
                if block.activate_repairs() {
                    activated |= self.pending.set(id.value());
                }
            }
        }
        activated
    }

    /// Clear all accumulated repair state (object, block, and symbol
    /// level) at the start of a receiver NACK cycle.
    pub fn clear_repairs(&mut self) {
        self.repair_info = false;
        self.repair.clear();
        for id in self.blocks.ids_in_order() {
            if let Some(block) = self.blocks.find_mut(id) {
                block.clear_repairs();
            }
        }
    }

    /// Whether repair is pending at or below the given position (used to
    /// decide whether a receiver NACK cycle is warranted).
    pub fn repair_needed_through(&self, block_id: BlockId, segment_id: SegmentId) -> bool {
        if self.pending_info {
            return true;
        }
        match self.pending.first_set().map(BlockId) {
            Some(first) => {
                if first < block_id {
                    true
                } else if first == block_id {
                    match self.blocks.find(first) {
                        Some(block) => block
                            .first_pending()
                            .is_some_and(|sid| sid <= segment_id),
                        None => true,
                    }
                } else {
                    false
                }
            }
            None => false,
        }
    }

    // ─── Segment I/O ────────────────────────────────────────────────────

    /// Read source segment bytes from storage (tx path, and the block
    /// recovery path after a buffer eviction).
    pub fn read_segment(
        &mut self,
        block_id: BlockId,
        segment_id: SegmentId,
        buf: &mut [u8],
    ) -> Option<usize> {
        let len = self.geometry.segment_len(block_id, segment_id) as usize;
        let offset = self.geometry.segment_offset(block_id, segment_id);
        match &mut self.data {
            ObjectData::Bulk(storage) => storage.read_segment(offset, &mut buf[..len]),
            ObjectData::File(storage) => storage.read_segment(offset, &mut buf[..len]),
            ObjectData::Stream(stream) => stream.read_segment(block_id, segment_id, buf),
        }
    }

    /// Write a received source segment to storage (rx path).
    pub fn write_segment(&mut self, block_id: BlockId, segment_id: SegmentId, data: &[u8]) -> bool {
        let len = (self.geometry.segment_len(block_id, segment_id) as usize).min(data.len());
        let offset = self.geometry.segment_offset(block_id, segment_id);
        match &mut self.data {
            ObjectData::Bulk(storage) => storage.write_segment(offset, &data[..len]),
            ObjectData::File(storage) => storage.write_segment(offset, &data[..len]),
            ObjectData::Stream(stream) => stream.write_segment(block_id, segment_id, data),
        }
    }

    /// Release all block state to the pools (close/abort path).
    pub fn close(&mut self, segments: &mut SegmentPool, blocks: &mut BlockPool) {
        self.blocks.drain_to_pools(segments, blocks);
        self.pending.clear();
        self.repair.clear();
        self.pending_info = false;
        self.repair_info = false;
    }

    /// Steal the buffered block with the given ordinal position for
    /// reclamation; segments go back to the pool, the block to its pool.
    pub fn reclaim_block(
        &mut self,
        id: BlockId,
        segments: &mut SegmentPool,
        blocks: &mut BlockPool,
    ) -> bool {
        match self.blocks.remove(id) {
            Some(mut block) => {
                block.empty_to_pool(segments);
                blocks.put(block);
                true
            }
            None => false,
        }
    }

    /// Find or create the rx-side block for `block_id`.
    pub fn get_or_create_rx_block(
        &mut self,
        block_id: BlockId,
        pool: &mut BlockPool,
    ) -> Option<&mut Block> {
        if !self.blocks.contains(block_id) {
            let mut block = pool.get()?;
            block.rx_init(block_id, self.geometry.block_len(block_id));
            if self.blocks.insert(block).is_err() {
                return None;
            }
        }
        self.blocks.find_mut(block_id)
    }
}
