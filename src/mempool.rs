//! Packet memory pool
//!
//! The pool hands out byte regions of a RAM window that the host cannot
//! address directly (the Ethernet controller's buffer memory). Regions are
//! named by small [`MemHandle`]s and tracked in a fixed block table. The
//! blocks in use form a chain sorted by address, anchored at a zero-sized
//! sentinel block at the start of the pool.
//!
//! Allocation is best fit over the gaps between chained blocks. When no gap
//! is large enough the pool compacts: every block slides down against its
//! predecessor, the bytes being relocated through a [`BlockMover`], and the
//! allocation is retried against the single trailing gap.

use log::{debug, trace};

use crate::error::{Error, Result};

/// Address inside the RAM window.
pub type MemAddress = u16;

/// The sentinel block at the start of the pool.
const POOL_START: usize = 0;

/// Handles are one byte wide; slot 0 is the sentinel.
pub const MAX_BLOCKS: usize = u8::MAX as usize;

/// Reference to a block of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemHandle(u8);

impl MemHandle {
    /// "No block": the result of a failed allocation.
    pub const NOBLOCK: MemHandle = MemHandle(0);

    pub fn is_none(self) -> bool {
        self == Self::NOBLOCK
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Physically relocates bytes inside the RAM window during compaction.
///
/// Source and destination may overlap; `dest` is always below `src`.
pub trait BlockMover {
    fn move_block(&mut self, dest: MemAddress, src: MemAddress, len: MemAddress);
}

/// Byte access to the RAM window backing the pool.
pub trait PacketMemory: BlockMover {
    fn read(&self, addr: MemAddress, buf: &mut [u8]);

    fn write(&mut self, addr: MemAddress, data: &[u8]);
}

#[derive(Debug, Clone, Copy, Default)]
struct MemBlock {
    begin: MemAddress,
    size: MemAddress,
    next: MemHandle,
    used: bool,
}

impl MemBlock {
    fn end(&self) -> usize {
        self.begin as usize + self.size as usize
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPool {
    blocks: Vec<MemBlock>,
    /// First address past the pool.
    end: usize,
}

impl MemoryPool {
    /// A pool of `size` bytes starting at `start`, with room for
    /// `num_blocks` blocks.
    pub fn new(start: MemAddress, size: MemAddress, num_blocks: usize) -> Result<Self> {
        if num_blocks == 0 || num_blocks > MAX_BLOCKS {
            return Err(Error::InvalidConfig("num_blocks"));
        }
        let end = start as usize + size as usize;
        if end > MemAddress::MAX as usize + 1 {
            return Err(Error::InvalidConfig("pool exceeds the address space"));
        }
        let mut blocks = vec![MemBlock::default(); num_blocks + 1];
        blocks[POOL_START] = MemBlock {
            begin: start,
            size: 0,
            next: MemHandle::NOBLOCK,
            used: true,
        };
        Ok(MemoryPool { blocks, end })
    }

    pub fn capacity(&self) -> usize {
        self.end - self.blocks[POOL_START].begin as usize
    }

    /// Free bytes following block `i` in the chain.
    fn gap_after(&self, i: usize) -> usize {
        let block = &self.blocks[i];
        let limit = match block.next {
            MemHandle::NOBLOCK => self.end,
            next => self.blocks[next.index()].begin as usize,
        };
        limit - block.end()
    }

    /// Reserve `size` bytes. Returns [`MemHandle::NOBLOCK`] when no region
    /// is available even after compaction, or when the block table is full.
    pub fn allocate<M: BlockMover>(&mut self, size: MemAddress, mover: &mut M) -> MemHandle {
        let wanted = size as usize;
        if wanted == 0 {
            return MemHandle::NOBLOCK;
        }
        let slot = match self.blocks.iter().skip(1).position(|b| !b.used) {
            Some(i) => i + 1,
            None => {
                trace!("mempool: block table full");
                return MemHandle::NOBLOCK;
            }
        };

        let mut best: Option<usize> = None;
        let mut best_size = usize::MAX;
        let mut cur = POOL_START;
        loop {
            let gap = self.gap_after(cur);
            if gap == wanted {
                best = Some(cur);
                break;
            }
            if gap > wanted && gap < best_size {
                best_size = gap;
                best = Some(cur);
            }
            match self.blocks[cur].next {
                MemHandle::NOBLOCK => break,
                next => cur = next.index(),
            }
        }

        let donor = match best {
            Some(donor) => donor,
            None => {
                let last = self.compact(mover);
                if self.gap_after(last) < wanted {
                    debug!("mempool: cannot allocate {} bytes", size);
                    return MemHandle::NOBLOCK;
                }
                last
            }
        };

        let begin = self.blocks[donor].end() as MemAddress;
        self.blocks[slot] = MemBlock {
            begin,
            size,
            next: self.blocks[donor].next,
            used: true,
        };
        let handle = MemHandle(slot as u8);
        self.blocks[donor].next = handle;
        trace!("mempool: block {} = {} bytes at {:#06x}", slot, size, begin);
        handle
    }

    /// Slide every block down against its predecessor. Returns the last
    /// block of the chain.
    fn compact<M: BlockMover>(&mut self, mover: &mut M) -> usize {
        debug!("mempool: compacting");
        let mut cur = POOL_START;
        loop {
            let next = self.blocks[cur].next;
            if next.is_none() {
                return cur;
            }
            let dest = self.blocks[cur].end() as MemAddress;
            let block = &mut self.blocks[next.index()];
            if block.begin != dest {
                mover.move_block(dest, block.begin, block.size);
                block.begin = dest;
            }
            cur = next.index();
        }
    }

    /// Release a block. Freeing [`MemHandle::NOBLOCK`] or an unknown handle
    /// does nothing.
    pub fn free(&mut self, handle: MemHandle) {
        if handle.is_none() {
            return;
        }
        let mut cur = POOL_START;
        loop {
            let next = self.blocks[cur].next;
            if next.is_none() {
                return;
            }
            if next == handle {
                let freed = self.blocks[next.index()];
                self.blocks[cur].next = freed.next;
                self.blocks[next.index()] = MemBlock::default();
                trace!("mempool: freed block {} ({} bytes)", next.0, freed.size);
                return;
            }
            cur = next.index();
        }
    }

    fn live(&self, handle: MemHandle) -> Option<&MemBlock> {
        if handle.is_none() {
            return None;
        }
        self.blocks.get(handle.index()).filter(|b| b.used)
    }

    /// Advance the start of a block by `position` bytes and set its size.
    ///
    /// The new range must stay below the next block (or the end of the
    /// pool).
    pub fn resize(&mut self, handle: MemHandle, position: MemAddress, size: MemAddress) -> Result<()> {
        let block = *self.live(handle).ok_or(Error::InvalidHandle)?;
        let begin = block.begin as usize + position as usize;
        let limit = match block.next {
            MemHandle::NOBLOCK => self.end,
            next => self.blocks[next.index()].begin as usize,
        };
        if begin + size as usize > limit {
            return Err(Error::ResizeOutOfBounds);
        }
        let block = &mut self.blocks[handle.index()];
        block.begin = begin as MemAddress;
        block.size = size;
        Ok(())
    }

    /// Size of a live block, 0 otherwise.
    pub fn block_size(&self, handle: MemHandle) -> MemAddress {
        self.live(handle).map_or(0, |b| b.size)
    }

    pub fn block_begin(&self, handle: MemHandle) -> Option<MemAddress> {
        self.live(handle).map(|b| b.begin)
    }

    /// Live blocks in address order, as `(handle, begin, size)`.
    pub fn blocks(&self) -> impl Iterator<Item = (MemHandle, MemAddress, MemAddress)> + '_ {
        let mut cur = self.blocks[POOL_START].next;
        core::iter::from_fn(move || {
            if cur.is_none() {
                return None;
            }
            let block = &self.blocks[cur.index()];
            let item = (cur, block.begin, block.size);
            cur = block.next;
            Some(item)
        })
    }

    /// Bytes not covered by any block.
    pub fn free_space(&self) -> usize {
        self.capacity() - self.blocks().map(|(_, _, size)| size as usize).sum::<usize>()
    }
}

/// The pool's RAM window kept in host memory.
#[derive(Debug, Clone)]
pub struct RamWindow {
    base: MemAddress,
    data: Vec<u8>,
}

impl RamWindow {
    pub fn new(base: MemAddress, size: usize) -> Self {
        RamWindow {
            base,
            data: vec![0; size],
        }
    }

    fn offset(&self, addr: MemAddress) -> usize {
        (addr - self.base) as usize
    }
}

impl BlockMover for RamWindow {
    fn move_block(&mut self, dest: MemAddress, src: MemAddress, len: MemAddress) {
        let src = self.offset(src);
        let dest = self.offset(dest);
        self.data.copy_within(src..src + len as usize, dest);
    }
}

impl PacketMemory for RamWindow {
    fn read(&self, addr: MemAddress, buf: &mut [u8]) {
        let at = self.offset(addr);
        buf.copy_from_slice(&self.data[at..at + buf.len()]);
    }

    fn write(&mut self, addr: MemAddress, data: &[u8]) {
        let at = self.offset(addr);
        self.data[at..at + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the moves made during compaction.
    #[derive(Default)]
    struct Moves(Vec<(MemAddress, MemAddress, MemAddress)>);

    impl BlockMover for Moves {
        fn move_block(&mut self, dest: MemAddress, src: MemAddress, len: MemAddress) {
            self.0.push((dest, src, len));
        }
    }

    fn assert_sorted_and_disjoint(pool: &MemoryPool) {
        let blocks: Vec<_> = pool.blocks().collect();
        for pair in blocks.windows(2) {
            let (_, begin, size) = pair[0];
            let (_, next_begin, _) = pair[1];
            assert!(begin as usize + size as usize <= next_begin as usize);
        }
        if let Some(&(_, begin, size)) = blocks.last() {
            assert!(begin as usize + size as usize <= pool.end);
        }
    }

    #[test]
    fn test_allocate_in_address_order() {
        let mut pool = MemoryPool::new(0x100, 300, 8).unwrap();
        let mut moves = Moves::default();
        let a = pool.allocate(100, &mut moves);
        let b = pool.allocate(50, &mut moves);
        assert_ne!(a, MemHandle::NOBLOCK);
        assert_ne!(a, b);
        assert_eq!(pool.block_begin(a), Some(0x100));
        assert_eq!(pool.block_begin(b), Some(0x164));
        assert_eq!(pool.block_size(b), 50);
        assert_eq!(pool.free_space(), 150);
        assert!(moves.0.is_empty());
    }

    #[test]
    fn test_best_fit_prefers_smallest_gap() {
        let mut pool = MemoryPool::new(0, 300, 8).unwrap();
        let mut moves = Moves::default();
        let a = pool.allocate(100, &mut moves);
        let _b = pool.allocate(20, &mut moves);
        let c = pool.allocate(40, &mut moves);
        let _d = pool.allocate(20, &mut moves);
        pool.free(a);
        pool.free(c);
        // Gaps: 100 at 0, 40 at 120, 120 at 180.
        let e = pool.allocate(30, &mut moves);
        assert_eq!(pool.block_begin(e), Some(120));
        // The trailing gap is an exact fit.
        let f = pool.allocate(120, &mut moves);
        assert_eq!(pool.block_begin(f), Some(180));
        assert_sorted_and_disjoint(&pool);
    }

    #[test]
    fn test_compaction_makes_room() {
        let mut pool = MemoryPool::new(0, 200, 8).unwrap();
        let mut moves = Moves::default();
        let first = pool.allocate(100, &mut moves);
        let second = pool.allocate(50, &mut moves);
        pool.free(first);

        // 150 bytes free, but split into 100 + 50.
        let third = pool.allocate(120, &mut moves);
        assert!(!third.is_none());
        assert_eq!(moves.0, vec![(0, 100, 50)]);
        assert_eq!(pool.block_begin(second), Some(0));
        assert_eq!(pool.block_begin(third), Some(50));
        assert_sorted_and_disjoint(&pool);
    }

    #[test]
    fn test_allocation_fails_when_pool_too_small() {
        let mut pool = MemoryPool::new(0, 150, 8).unwrap();
        let mut moves = Moves::default();
        let first = pool.allocate(100, &mut moves);
        let second = pool.allocate(50, &mut moves);
        pool.free(first);

        assert_eq!(pool.allocate(120, &mut moves), MemHandle::NOBLOCK);
        // The compaction still happened.
        assert_eq!(pool.block_begin(second), Some(0));
        assert_eq!(pool.free_space(), 100);
    }

    #[test]
    fn test_block_table_exhaustion() {
        let mut pool = MemoryPool::new(0, 100, 2).unwrap();
        let mut moves = Moves::default();
        assert!(!pool.allocate(10, &mut moves).is_none());
        assert!(!pool.allocate(10, &mut moves).is_none());
        assert!(pool.allocate(10, &mut moves).is_none());
        assert!(pool.allocate(0, &mut moves).is_none());
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut pool = MemoryPool::new(0, 100, 4).unwrap();
        let mut moves = Moves::default();
        let a = pool.allocate(10, &mut moves);
        pool.free(a);
        pool.free(a);
        pool.free(MemHandle::NOBLOCK);
        assert_eq!(pool.block_size(a), 0);
        assert_eq!(pool.blocks().count(), 0);
    }

    #[test]
    fn test_resize_is_bounded_by_next_block() {
        let mut pool = MemoryPool::new(0, 100, 4).unwrap();
        let mut moves = Moves::default();
        let a = pool.allocate(30, &mut moves);
        let b = pool.allocate(30, &mut moves);

        assert_eq!(pool.resize(a, 10, 20), Ok(()));
        assert_eq!(pool.block_begin(a), Some(10));
        assert_eq!(pool.resize(a, 0, 21), Err(Error::ResizeOutOfBounds));
        // The last block may grow into the trailing gap.
        assert_eq!(pool.resize(b, 0, 70), Ok(()));
        assert_eq!(pool.resize(b, 1, 70), Err(Error::ResizeOutOfBounds));
        assert_eq!(pool.resize(MemHandle::NOBLOCK, 0, 1), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_random_workload_keeps_invariants() {
        let mut pool = MemoryPool::new(0, 1000, 16).unwrap();
        let mut moves = Moves::default();
        let mut live: Vec<MemHandle> = Vec::new();
        let mut seed: u32 = 12345;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let roll = (seed >> 16) as usize;
            if roll % 3 == 0 && !live.is_empty() {
                let handle = live.swap_remove(roll % live.len());
                pool.free(handle);
            } else {
                let size = (roll % 200 + 1) as MemAddress;
                let free = pool.free_space();
                let handle = pool.allocate(size, &mut moves);
                if handle.is_none() {
                    assert!(free < size as usize || live.len() == 16);
                } else {
                    live.push(handle);
                }
            }
            assert_sorted_and_disjoint(&pool);
        }
    }

    #[test]
    fn test_ram_window_moves_bytes() {
        let mut pool = MemoryPool::new(0x10, 8, 4).unwrap();
        let mut ram = RamWindow::new(0x10, 8);
        let a = pool.allocate(4, &mut ram);
        let b = pool.allocate(2, &mut ram);
        ram.write(pool.block_begin(b).unwrap(), b"hi");
        pool.free(a);

        let c = pool.allocate(5, &mut ram);
        assert!(!c.is_none());
        let mut buf = [0u8; 2];
        ram.read(pool.block_begin(b).unwrap(), &mut buf);
        assert_eq!(pool.block_begin(b), Some(0x10));
        assert_eq!(&buf, b"hi");
    }
}
