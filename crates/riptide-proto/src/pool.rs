//! # Segment and Block Buffering
//!
//! Preallocated free-lists for segment vectors and FEC block state, plus the
//! windowed block table each object keeps for its in-flight blocks. Buffer
//! memory is bounded at session setup; when a pool runs dry the caller
//! steals from another object or drops the transmission opportunity.

use std::collections::HashMap;

use crate::bitmask::SlidingMask;
use crate::seq::{BlockId, SegmentId};

// ─── Segment Pool ───────────────────────────────────────────────────────────

/// A segment buffer. Sized for the session `segment_size` plus any payload
/// header the object type prepends.
pub type Segment = Vec<u8>;

/// Fixed-size free-list of segment buffers.
pub struct SegmentPool {
    segment_size: usize,
    free: Vec<Segment>,
    total: usize,
    peak_usage: usize,
    overruns: u64,
}

impl SegmentPool {
    pub fn new(count: usize, segment_size: usize) -> Self {
        SegmentPool {
            segment_size,
            free: (0..count).map(|_| vec![0u8; segment_size]).collect(),
            total: count,
            peak_usage: 0,
            overruns: 0,
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Take a zeroed segment, or `None` when the pool is exhausted.
    pub fn get(&mut self) -> Option<Segment> {
        match self.free.pop() {
            Some(mut seg) => {
                seg.fill(0);
                self.peak_usage = self.peak_usage.max(self.in_use());
                Some(seg)
            }
            None => {
                self.overruns += 1;
                None
            }
        }
    }

    /// Return a segment to the pool.
    pub fn put(&mut self, seg: Segment) {
        debug_assert_eq!(seg.len(), self.segment_size);
        self.free.push(seg);
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn in_use(&self) -> usize {
        self.total - self.free.len()
    }

    pub fn peak_usage(&self) -> usize {
        self.peak_usage
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

// ─── Block ──────────────────────────────────────────────────────────────────

/// Incremental parity for this block is complete.
pub const BLOCK_FLAG_PARITY_READY: u8 = 0x01;
/// Block has accumulated repair state awaiting activation.
pub const BLOCK_FLAG_IN_REPAIR: u8 = 0x02;

/// Per-block transmission/reception state: a segment table over the
/// `ndata + nparity` symbol positions with pending/repair masks.
#[derive(Debug)]
pub struct Block {
    id: BlockId,
    segments: Vec<Option<Segment>>,
    pending: SlidingMask,
    repair: SlidingMask,
    erasure_count: u16,
    parity_count: u16,
    /// Next source segment the incremental encoder expects; parity vectors
    /// are valid for segments below this index.
    parity_offset: u16,
    flags: u8,
}

impl Block {
    /// Allocate a block with `size` symbol slots (`ndata + nparity`).
    pub fn new(size: u16) -> Self {
        Block {
            id: BlockId(0),
            segments: (0..size).map(|_| None).collect(),
            pending: SlidingMask::new(size as usize, 0xFFFF),
            repair: SlidingMask::new(size as usize, 0xFFFF),
            erasure_count: 0,
            parity_count: 0,
            parity_offset: 0,
            flags: 0,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> u16 {
        self.segments.len() as u16
    }

    /// Prepare for transmission: all source symbols (plus `auto_parity`
    /// proactive parity symbols) pending.
    pub fn tx_init(&mut self, id: BlockId, ndata: u16, auto_parity: u16) {
        self.id = id;
        self.pending.clear();
        self.pending.set_bits(0, (ndata + auto_parity) as usize);
        self.repair.clear();
        self.erasure_count = 0;
        self.parity_count = 0;
        self.parity_offset = 0;
        self.flags = 0;
    }

    /// Prepare for reception: all `ndata` source symbols owed.
    pub fn rx_init(&mut self, id: BlockId, ndata: u16) {
        self.id = id;
        self.pending.clear();
        self.pending.set_bits(0, ndata as usize);
        self.repair.clear();
        self.erasure_count = ndata;
        self.parity_count = 0;
        self.parity_offset = 0;
        self.flags = 0;
    }

    pub fn flag_is_set(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    pub fn erasure_count(&self) -> u16 {
        self.erasure_count
    }

    pub fn decrement_erasure_count(&mut self) {
        self.erasure_count -= 1;
    }

    pub fn parity_count(&self) -> u16 {
        self.parity_count
    }

    pub fn increment_parity_count(&mut self) {
        self.parity_count += 1;
    }

    pub fn parity_offset(&self) -> u16 {
        self.parity_offset
    }

    pub fn set_parity_offset(&mut self, offset: u16) {
        self.parity_offset = offset;
    }

    // ─── Segment Table ──────────────────────────────────────────────────

    pub fn segment(&self, sid: SegmentId) -> Option<&[u8]> {
        self.segments[sid as usize].as_deref()
    }

    pub fn segment_mut(&mut self, sid: SegmentId) -> Option<&mut Segment> {
        self.segments[sid as usize].as_mut()
    }

    pub fn attach_segment(&mut self, sid: SegmentId, seg: Segment) {
        debug_assert!(self.segments[sid as usize].is_none());
        self.segments[sid as usize] = Some(seg);
    }

    pub fn detach_segment(&mut self, sid: SegmentId) -> Option<Segment> {
        self.segments[sid as usize].take()
    }

    pub fn has_segment(&self, sid: SegmentId) -> bool {
        self.segments[sid as usize].is_some()
    }

    /// Move the whole segment table out for an FEC decode, leaving the
    /// table empty.
    pub fn take_segments(&mut self) -> Vec<Option<Segment>> {
        std::mem::take(&mut self.segments)
    }

    pub fn restore_segments(&mut self, segments: Vec<Option<Segment>>) {
        self.segments = segments;
    }

    /// Move the parity vectors out for an incremental encode pass.
    /// All `nparity` parity slots must be attached.
    pub fn take_parity(&mut self, ndata: u16, nparity: u16) -> Vec<Segment> {
        (0..nparity)
            .map(|p| {
                self.segments[(ndata + p) as usize]
                    .take()
                    .expect("parity slot attached")
            })
            .collect()
    }

    pub fn restore_parity(&mut self, ndata: u16, parity: Vec<Segment>) {
        for (p, seg) in parity.into_iter().enumerate() {
            self.segments[ndata as usize + p] = Some(seg);
        }
    }

    // ─── Pending / Repair State ─────────────────────────────────────────

    pub fn is_pending(&self) -> bool {
        self.pending.is_set()
    }

    pub fn is_symbol_pending(&self, sid: SegmentId) -> bool {
        self.pending.test(sid as u32)
    }

    pub fn set_pending(&mut self, sid: SegmentId) -> bool {
        self.pending.set(sid as u32)
    }

    pub fn unset_pending(&mut self, sid: SegmentId) {
        self.pending.unset(sid as u32)
    }

    pub fn set_pending_range(&mut self, sid: SegmentId, count: usize) -> bool {
        self.pending.set_bits(sid as u32, count)
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear()
    }

    pub fn first_pending(&self) -> Option<SegmentId> {
        self.pending.first_set().map(|i| i as SegmentId)
    }

    pub fn last_pending(&self) -> Option<SegmentId> {
        self.pending.last_set().map(|i| i as SegmentId)
    }

    pub fn next_pending(&self, sid: SegmentId) -> Option<SegmentId> {
        self.pending.next_set(sid as u32).map(|i| i as SegmentId)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }

    pub fn set_repair(&mut self, sid: SegmentId) -> bool {
        self.repair.set(sid as u32)
    }

    pub fn set_repair_range(&mut self, sid: SegmentId, count: usize) -> bool {
        self.repair.set_bits(sid as u32, count)
    }

    pub fn clear_repairs(&mut self) {
        self.repair.clear()
    }

    pub fn is_repair_set(&self, sid: SegmentId) -> bool {
        self.repair.test(sid as u32)
    }

    /// Whether any repair state below `end` is marked.
    pub fn repair_pending_through(&self, end: SegmentId) -> bool {
        self.repair.first_set().is_some_and(|i| i < end as u32)
    }

    /// Activate accumulated repair state: repair bits transfer into the
    /// pending mask. Returns whether anything moved.
    pub fn activate_repairs(&mut self) -> bool {
        if !self.repair.is_set() {
            return false;
        }
        self.pending.add(&self.repair);
        self.repair.clear();
        true
    }

    /// Missing source positions among the first `ndata` symbols, ascending.
    pub fn erasure_locs(&self, ndata: u16) -> Vec<u16> {
        (0..ndata).filter(|&s| !self.has_segment(s)).collect()
    }

    /// Drain every resident segment back to the pool.
    pub fn empty_to_pool(&mut self, pool: &mut SegmentPool) {
        for slot in self.segments.iter_mut() {
            if let Some(seg) = slot.take() {
                pool.put(seg);
            }
        }
    }
}

// ─── Block Pool ─────────────────────────────────────────────────────────────

/// Free-list of preallocated blocks, all sized identically.
pub struct BlockPool {
    free: Vec<Block>,
    total: usize,
    overruns: u64,
}

impl BlockPool {
    pub fn new(count: usize, block_size: u16) -> Self {
        BlockPool {
            free: (0..count).map(|_| Block::new(block_size)).collect(),
            total: count,
            overruns: 0,
        }
    }

    pub fn get(&mut self) -> Option<Block> {
        let block = self.free.pop();
        if block.is_none() {
            self.overruns += 1;
        }
        block
    }

    pub fn put(&mut self, block: Block) {
        debug_assert!(
            block.segments.iter().all(|s| s.is_none()),
            "blocks must be emptied to the segment pool before release"
        );
        self.free.push(block);
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn in_use(&self) -> usize {
        self.total - self.free.len()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

// ─── Block Buffer ───────────────────────────────────────────────────────────

/// Windowed table of in-flight blocks keyed by [`BlockId`]. Insertion is
/// bounded by `range_max`: the wrap-aware span between the oldest and
/// newest resident block may not reach it.
pub struct BlockBuffer {
    blocks: HashMap<u32, Block>,
    range_max: u32,
}

impl BlockBuffer {
    pub fn new(range_max: u32) -> Self {
        BlockBuffer {
            blocks: HashMap::new(),
            range_max: range_max.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id.value())
    }

    pub fn find(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id.value())
    }

    pub fn find_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id.value())
    }

    pub fn can_insert(&self, id: BlockId) -> bool {
        match (self.low_id(), self.high_id()) {
            (Some(low), Some(high)) => {
                let low = if id < low { id } else { low };
                let high = if id > high { id } else { high };
                (high.delta(low) as u32) < self.range_max
            }
            _ => true,
        }
    }

    /// Insert a block. Fails (returning the block) when out of window or
    /// already present.
    pub fn insert(&mut self, block: Block) -> Result<(), Block> {
        if !self.can_insert(block.id()) || self.contains(block.id()) {
            return Err(block);
        }
        self.blocks.insert(block.id().value(), block);
        Ok(())
    }

    pub fn remove(&mut self, id: BlockId) -> Option<Block> {
        self.blocks.remove(&id.value())
    }

    /// Oldest resident block id.
    pub fn low_id(&self) -> Option<BlockId> {
        self.blocks
            .keys()
            .map(|&k| BlockId(k))
            .reduce(|a, b| if b < a { b } else { a })
    }

    /// Newest resident block id.
    pub fn high_id(&self) -> Option<BlockId> {
        self.blocks
            .keys()
            .map(|&k| BlockId(k))
            .reduce(|a, b| if b > a { b } else { a })
    }

    /// Resident ids in ascending (wrap-aware) order.
    pub fn ids_in_order(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.blocks.keys().map(|&k| BlockId(k)).collect();
        if let Some(low) = self.low_id() {
            ids.sort_by_key(|id| id.delta(low));
        }
        ids
    }

    /// Drain every resident block, returning its segments to the segment
    /// pool and the block itself to the block pool.
    pub fn drain_to_pools(&mut self, segments: &mut SegmentPool, blocks: &mut BlockPool) {
        for (_, mut block) in self.blocks.drain() {
            block.empty_to_pool(segments);
            blocks.put(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Segment Pool ───────────────────────────────────────────────────

    #[test]
    fn segment_pool_get_put() {
        let mut pool = SegmentPool::new(2, 64);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(a.len(), 64);
        assert!(pool.is_empty());
        assert!(pool.get().is_none());
        assert_eq!(pool.overruns(), 1);
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.peak_usage(), 2);
    }

    #[test]
    fn segment_pool_returns_zeroed_buffers() {
        let mut pool = SegmentPool::new(1, 8);
        let mut seg = pool.get().unwrap();
        seg.fill(0xAB);
        pool.put(seg);
        let seg = pool.get().unwrap();
        assert!(seg.iter().all(|&b| b == 0));
    }

    // ─── Block ──────────────────────────────────────────────────────────

    #[test]
    fn block_tx_init_marks_sources_pending() {
        let mut block = Block::new(10);
        block.tx_init(BlockId(3), 8, 1);
        assert_eq!(block.id(), BlockId(3));
        assert_eq!(block.pending_count(), 9); // ndata + auto_parity
        assert_eq!(block.first_pending(), Some(0));
        assert_eq!(block.last_pending(), Some(8));
    }

    #[test]
    fn block_rx_init_owes_all_sources() {
        let mut block = Block::new(10);
        block.rx_init(BlockId(7), 8);
        assert_eq!(block.erasure_count(), 8);
        assert_eq!(block.pending_count(), 8);
    }

    #[test]
    fn block_repair_activation_transfers_to_pending() {
        let mut block = Block::new(8);
        block.tx_init(BlockId(0), 6, 0);
        block.clear_pending();
        block.set_repair(2);
        block.set_repair(4);
        assert!(block.activate_repairs());
        assert!(block.is_symbol_pending(2));
        assert!(block.is_symbol_pending(4));
        assert!(!block.is_repair_set(2));
        assert!(!block.activate_repairs(), "second activation is a no-op");
    }

    #[test]
    fn block_erasure_locs() {
        let mut block = Block::new(6);
        block.rx_init(BlockId(0), 4);
        block.attach_segment(1, vec![0u8; 4]);
        block.attach_segment(3, vec![0u8; 4]);
        assert_eq!(block.erasure_locs(4), vec![0, 2]);
    }

    #[test]
    fn block_empty_to_pool_returns_segments() {
        let mut pool = SegmentPool::new(4, 16);
        let mut block = Block::new(4);
        block.rx_init(BlockId(0), 3);
        block.attach_segment(0, pool.get().unwrap());
        block.attach_segment(2, pool.get().unwrap());
        assert_eq!(pool.in_use(), 2);
        block.empty_to_pool(&mut pool);
        assert_eq!(pool.in_use(), 0);
    }

    // ─── Block Pool ─────────────────────────────────────────────────────

    #[test]
    fn block_pool_exhaustion() {
        let mut pool = BlockPool::new(1, 4);
        let block = pool.get().unwrap();
        assert!(pool.get().is_none());
        assert_eq!(pool.overruns(), 1);
        pool.put(block);
        assert!(pool.get().is_some());
    }

    // ─── Block Buffer ───────────────────────────────────────────────────

    fn block_with_id(id: u32) -> Block {
        let mut b = Block::new(4);
        b.tx_init(BlockId(id), 4, 0);
        b
    }

    #[test]
    fn buffer_insert_find_remove() {
        let mut buf = BlockBuffer::new(16);
        assert!(buf.insert(block_with_id(5)).is_ok());
        assert!(buf.insert(block_with_id(9)).is_ok());
        assert!(buf.contains(BlockId(5)));
        assert_eq!(buf.find(BlockId(9)).unwrap().id(), BlockId(9));
        assert_eq!(buf.low_id(), Some(BlockId(5)));
        assert_eq!(buf.high_id(), Some(BlockId(9)));
        let removed = buf.remove(BlockId(5)).unwrap();
        assert_eq!(removed.id(), BlockId(5));
        assert!(!buf.contains(BlockId(5)));
    }

    #[test]
    fn buffer_rejects_out_of_range_and_duplicates() {
        let mut buf = BlockBuffer::new(8);
        assert!(buf.insert(block_with_id(0)).is_ok());
        assert!(buf.insert(block_with_id(7)).is_ok());
        assert!(buf.insert(block_with_id(8)).is_err(), "span would reach range_max");
        assert!(buf.insert(block_with_id(7)).is_err(), "duplicate id");
    }

    #[test]
    fn buffer_orders_across_wrap() {
        let mut buf = BlockBuffer::new(16);
        buf.insert(block_with_id(0xFFFF_FFFE)).unwrap();
        buf.insert(block_with_id(1)).unwrap();
        buf.insert(block_with_id(0xFFFF_FFFF)).unwrap();
        let ids: Vec<u32> = buf.ids_in_order().iter().map(|b| b.value()).collect();
        assert_eq!(ids, vec![0xFFFF_FFFE, 0xFFFF_FFFF, 1]);
        assert_eq!(buf.low_id(), Some(BlockId(0xFFFF_FFFE)));
        assert_eq!(buf.high_id(), Some(BlockId(1)));
    }

    #[test]
    fn buffer_drains_to_pools() {
        let mut segs = SegmentPool::new(8, 16);
        let mut blocks = BlockPool::new(4, 4);
        let mut buf = BlockBuffer::new(16);
        let mut b = blocks.get().unwrap();
        b.rx_init(BlockId(1), 3);
        b.attach_segment(0, segs.get().unwrap());
        buf.insert(b).unwrap();
        assert_eq!(segs.in_use(), 1);
        assert_eq!(blocks.in_use(), 1);
        buf.drain_to_pools(&mut segs, &mut blocks);
        assert!(buf.is_empty());
        assert_eq!(segs.in_use(), 0);
        assert_eq!(blocks.in_use(), 0);
    }
}
