//! Remembered sets: chunked linked lists of pointer locations that
//! partial collections would otherwise miss (spec §4.4).
//!
//! The original threads these chunks through the same word arena as
//! cells, recycled through a process-wide freelist refilled in batches.
//! Since remembered-set entries are metadata about the arena rather than
//! arena contents themselves, this crate keeps them in ordinary `Vec`
//! chunks owned by each generation and recycles whole chunks through a
//! shared pool — the same chunked-list shape, minus unsafe pointer
//! splicing the host language doesn't need.

use crate::memory::Addr;

/// Words per chunk — mirrors the ~40-word chunks of the original.
pub const CHUNK_CAPACITY: usize = 40;

#[derive(Debug, Default)]
struct Chunk {
    entries: Vec<Addr>,
}

impl Chunk {
    fn new() -> Self {
        Self { entries: Vec::with_capacity(CHUNK_CAPACITY) }
    }

    fn has_room(&self) -> bool {
        self.entries.len() < CHUNK_CAPACITY
    }
}

/// A process-wide pool of chunks, refilled in batches of
/// `rem_sets_per_malloc` (spec §6.2) whenever it runs dry.
pub struct ChunkPool {
    free: Vec<Chunk>,
    batch_size: usize,
}

impl ChunkPool {
    pub fn new(batch_size: usize) -> Self {
        Self { free: Vec::new(), batch_size: batch_size.max(1) }
    }

    fn take(&mut self) -> Chunk {
        self.free.pop().unwrap_or_else(|| {
            for _ in 1..self.batch_size {
                self.free.push(Chunk::new());
            }
            Chunk::new()
        })
    }

    fn recycle(&mut self, mut chunks: Vec<Chunk>) {
        for c in &mut chunks {
            c.entries.clear();
        }
        self.free.extend(chunks);
    }
}

/// A remembered set: the addresses of every pointer field known to
/// refer into one generation.
#[derive(Default)]
pub struct RememberedSet {
    chunks: Vec<Chunk>,
}

impl RememberedSet {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() || self.len() == 0
    }

    /// `prepend(rem_set, referrer_ptr)`: write into the current chunk if
    /// it has room, else grab a fresh one from the pool.
    pub fn prepend(&mut self, pool: &mut ChunkPool, referrer_ptr: Addr) {
        if self.chunks.last().map(|c| c.has_room()) != Some(true) {
            self.chunks.push(pool.take());
        }
        self.chunks.last_mut().unwrap().entries.push(referrer_ptr);
    }

    /// `free(rem_set)`: splice this set's chunks back into the pool,
    /// leaving the set empty.
    pub fn free(&mut self, pool: &mut ChunkPool) {
        let chunks = std::mem::take(&mut self.chunks);
        pool.recycle(chunks);
    }

    /// Iterate every remembered pointer location, for seeding the
    /// copying collector's work stack (spec §4.7 step 3a).
    pub fn iter(&self) -> impl Iterator<Item = Addr> + '_ {
        self.chunks.iter().flat_map(|c| c.entries.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_spills_into_new_chunks() {
        let mut pool = ChunkPool::new(4);
        let mut rs = RememberedSet::new();
        for i in 0..(CHUNK_CAPACITY * 2 + 3) as Addr {
            rs.prepend(&mut pool, i);
        }
        assert_eq!(rs.len(), CHUNK_CAPACITY * 2 + 3);
        assert_eq!(rs.chunks.len(), 3);
    }

    #[test]
    fn free_recycles_chunks_through_pool() {
        let mut pool = ChunkPool::new(1);
        let mut rs = RememberedSet::new();
        rs.prepend(&mut pool, 7);
        rs.prepend(&mut pool, 8);
        assert_eq!(pool.free.len(), 0);
        rs.free(&mut pool);
        assert!(rs.is_empty());
        assert_eq!(pool.free.len(), 1);
        // The recycled chunk is actually empty and reusable.
        let mut rs2 = RememberedSet::new();
        rs2.prepend(&mut pool, 1);
        assert_eq!(rs2.len(), 1);
    }
}
