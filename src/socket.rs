//! Per-socket packet queues in pool memory
//!
//! A socket buffers whole packets in the memory pool and remembers them by
//! handle, oldest first. Reading consumes the oldest packet from the front:
//! its block is shrunk as bytes are taken and freed once it is empty.

use log::trace;

use crate::error::{Error, Result};
use crate::mempool::{MemAddress, MemHandle, MemoryPool, PacketMemory};

/// Packets a socket can hold per direction.
pub const SOCKET_NUM_PACKETS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct PacketQueue {
    packets: [MemHandle; SOCKET_NUM_PACKETS],
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.packets.iter().take_while(|h| !h.is_none()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.packets[0].is_none()
    }

    pub fn is_full(&self) -> bool {
        !self.packets[SOCKET_NUM_PACKETS - 1].is_none()
    }

    /// Copy `data` into the pool as a new packet at the back of the queue.
    ///
    /// [`Error::PoolExhausted`] is transient: retry once the reader has
    /// drained something.
    pub fn enqueue_packet<M: PacketMemory>(&mut self, pool: &mut MemoryPool, mem: &mut M, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let slot = self.len();
        if slot == SOCKET_NUM_PACKETS {
            return Err(Error::QueueFull);
        }
        let size = MemAddress::try_from(data.len()).map_err(|_| Error::PoolExhausted)?;
        let handle = pool.allocate(size, mem);
        let begin = pool.block_begin(handle).ok_or(Error::PoolExhausted)?;
        mem.write(begin, data);
        self.packets[slot] = handle;
        trace!("socket: queued {} bytes as block {:?}", size, handle);
        Ok(())
    }

    /// Bytes left in the packet at the front of the queue.
    pub fn available(&self, pool: &MemoryPool) -> usize {
        pool.block_size(self.packets[0]) as usize
    }

    pub fn has_packet(&self) -> bool {
        !self.is_empty()
    }

    /// Read from the front packet into `buf`. Returns the number of bytes
    /// read, 0 when the queue is empty. Never reads past the end of the
    /// front packet.
    pub fn read<M: PacketMemory>(&mut self, pool: &mut MemoryPool, mem: &mut M, buf: &mut [u8]) -> Result<usize> {
        let head = self.packets[0];
        let (begin, size) = match pool.block_begin(head) {
            Some(begin) => (begin, pool.block_size(head) as usize),
            None => return Ok(0),
        };
        let n = size.min(buf.len());
        mem.read(begin, &mut buf[..n]);
        if n == size {
            self.pop(pool);
        } else {
            pool.resize(head, n as MemAddress, (size - n) as MemAddress)?;
        }
        Ok(n)
    }

    /// Drop the front packet.
    pub fn pop(&mut self, pool: &mut MemoryPool) {
        pool.free(self.packets[0]);
        self.packets.rotate_left(1);
        self.packets[SOCKET_NUM_PACKETS - 1] = MemHandle::NOBLOCK;
    }

    /// Release every queued packet.
    pub fn flush(&mut self, pool: &mut MemoryPool) {
        for handle in self.packets.iter_mut() {
            pool.free(*handle);
            *handle = MemHandle::NOBLOCK;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::RamWindow;

    fn setup(size: u16) -> (MemoryPool, RamWindow) {
        (
            MemoryPool::new(0, size, 2 * SOCKET_NUM_PACKETS).unwrap(),
            RamWindow::new(0, size as usize),
        )
    }

    #[test]
    fn test_packets_come_out_in_order() {
        let (mut pool, mut ram) = setup(64);
        let mut queue = PacketQueue::new();
        queue.enqueue_packet(&mut pool, &mut ram, b"first").unwrap();
        queue.enqueue_packet(&mut pool, &mut ram, b"second").unwrap();
        assert_eq!(queue.len(), 2);

        let mut buf = [0u8; 16];
        let n = queue.read(&mut pool, &mut ram, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = queue.read(&mut pool, &mut ram, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
        assert_eq!(queue.read(&mut pool, &mut ram, &mut buf), Ok(0));
        assert_eq!(pool.free_space(), 64);
    }

    #[test]
    fn test_partial_reads_shrink_the_block() {
        let (mut pool, mut ram) = setup(64);
        let mut queue = PacketQueue::new();
        queue.enqueue_packet(&mut pool, &mut ram, b"abcdefgh").unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(queue.read(&mut pool, &mut ram, &mut buf), Ok(3));
        assert_eq!(&buf, b"abc");
        assert_eq!(queue.available(&pool), 5);
        assert_eq!(queue.read(&mut pool, &mut ram, &mut buf), Ok(3));
        assert_eq!(&buf, b"def");
        assert_eq!(queue.read(&mut pool, &mut ram, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"gh");
        assert!(!queue.has_packet());
    }

    #[test]
    fn test_queue_and_pool_limits() {
        let (mut pool, mut ram) = setup(16);
        let mut queue = PacketQueue::new();
        queue.enqueue_packet(&mut pool, &mut ram, &[1; 10]).unwrap();
        assert_eq!(
            queue.enqueue_packet(&mut pool, &mut ram, &[2; 10]),
            Err(Error::PoolExhausted)
        );
        assert_eq!(queue.len(), 1);

        for _ in 1..SOCKET_NUM_PACKETS {
            queue.enqueue_packet(&mut pool, &mut ram, &[3]).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.enqueue_packet(&mut pool, &mut ram, &[4]), Err(Error::QueueFull));

        queue.flush(&mut pool);
        assert!(queue.is_empty());
        assert_eq!(pool.free_space(), 16);
    }

    #[test]
    fn test_data_survives_compaction() {
        let (mut pool, mut ram) = setup(20);
        let mut first = PacketQueue::new();
        let mut second = PacketQueue::new();
        first.enqueue_packet(&mut pool, &mut ram, b"0123456789").unwrap();
        second.enqueue_packet(&mut pool, &mut ram, b"keep").unwrap();
        first.pop(&mut pool);

        // 16 bytes free in two gaps: the pool must compact.
        first.enqueue_packet(&mut pool, &mut ram, b"0123456789ab").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(second.read(&mut pool, &mut ram, &mut buf), Ok(4));
        assert_eq!(&buf, b"keep");
    }
}
