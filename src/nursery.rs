//! The nursery: a downward bump allocator over the top of the arena
//! (spec §4.2).

use crate::cell::{make_header, CellType};
use crate::memory::{Addr, Memory};

pub const MIN_ALLOCATION_WORDS: usize = 2;

/// Red-zone header written before each allocation in debug mode
/// (cookies.h `FIRST_GENERATION_RED_ZONE`): high 16 bits are a fixed
/// marker, low 16 bits the allocation's size in words.
const RED_ZONE_MARKER: u32 = 0xF642_0000;
const RED_ZONE_MASK: u32 = 0xFFFF_0000;
pub const FIRST_GENERATION_DEADBEEF: u32 = 0xF6BE_EF00;

pub struct Nursery {
    base: Addr,
    words: usize,
    /// Bump pointer: the address of the next (lower) allocation. Starts
    /// at `base + words` and decreases toward `base`.
    ptr: Addr,
    debug: bool,
}

impl Nursery {
    pub fn new(mem: &Memory, debug: bool) -> Self {
        let base = mem.nursery_base();
        let words = mem.nursery_words;
        Self {
            base,
            words,
            ptr: base + words as Addr,
            debug,
        }
    }

    /// Words remaining between the bump pointer and the base.
    pub fn words_remaining(&self) -> usize {
        (self.ptr - self.base) as usize
    }

    pub fn can_allocate(&self, n: usize) -> bool {
        let overhead = if self.debug { 1 } else { 0 };
        self.words_remaining() >= n + overhead
    }

    /// Checkpoint for speculative allocation (`get_allocation_point`).
    pub fn allocation_point(&self) -> Addr {
        self.ptr
    }

    /// Rollback to a prior checkpoint (`restore_allocation_point`).
    pub fn restore_allocation_point(&mut self, p: Addr) {
        debug_assert!(p >= self.ptr && p <= self.base + self.words as Addr);
        self.ptr = p;
    }

    /// `raw_allocate(n)`: reserve `n` words without writing a type tag.
    /// Precondition: `can_allocate(n)` was true.
    ///
    /// In debug mode, each allocation is preceded (at the next-lower
    /// address) by a one-word red-zone header carrying `{marker, size}`,
    /// so `check_red_zones` can walk the chain from the bump pointer
    /// upward without prior knowledge of any allocation's size.
    pub fn raw_allocate(&mut self, mem: &mut Memory, n: usize) -> Addr {
        let n = n.max(MIN_ALLOCATION_WORDS);
        self.ptr -= n as Addr;
        let cell_addr = self.ptr;
        if self.debug {
            let red_zone = RED_ZONE_MARKER | (n as u32 & 0xFFFF);
            self.ptr -= 1;
            mem.write(self.ptr, red_zone);
        }
        cell_addr
    }

    /// `allocate(n, type)`: reserve `n` words and stamp the type tag into
    /// word 0.
    pub fn allocate(&mut self, mem: &mut Memory, n: usize, ty: CellType) -> Addr {
        let p = self.raw_allocate(mem, n);
        mem.write(p, make_header(ty, 0));
        p
    }

    #[inline]
    pub fn is_in_first_generation(&self, addr: Addr) -> bool {
        addr >= self.base
    }

    /// Reinitialize the nursery to empty, poisoning its contents in
    /// debug mode (cookies.h `FIRST_GENERATION_DEADBEEF`).
    pub fn clear(&mut self, mem: &mut Memory) {
        if self.debug {
            mem.nursery_slice_mut().fill(FIRST_GENERATION_DEADBEEF);
        }
        self.ptr = self.base + self.words as Addr;
    }

    /// Validate the red-zone chain from the current allocation point up
    /// to the top of the nursery (debug mode only).
    pub fn check_red_zones(&self, mem: &Memory) -> bool {
        if !self.debug {
            return true;
        }
        let mut p = self.ptr;
        let top = self.base + self.words as Addr;
        while p < top {
            let marker = mem.read(p);
            if marker & RED_ZONE_MASK != RED_ZONE_MARKER {
                return false;
            }
            let size = (marker & 0xFFFF) as Addr;
            p += 1 + size.max(MIN_ALLOCATION_WORDS as Addr);
        }
        true
    }

    pub fn base(&self) -> Addr {
        self.base
    }

    pub fn capacity_words(&self) -> usize {
        self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CELL_TEST_PAIR;

    #[test]
    fn bump_allocates_downward() {
        let mut mem = Memory::new(0, 0, 32);
        let mut n = Nursery::new(&mem, false);
        assert!(n.can_allocate(2));
        let p1 = n.allocate(&mut mem, 2, CELL_TEST_PAIR);
        let p2 = n.allocate(&mut mem, 2, CELL_TEST_PAIR);
        assert!(p2 < p1);
        assert_eq!(n.words_remaining(), 28);
    }

    #[test]
    fn checkpoint_rollback() {
        let mut mem = Memory::new(0, 0, 32);
        let mut n = Nursery::new(&mem, false);
        let cp = n.allocation_point();
        n.allocate(&mut mem, 4, CELL_TEST_PAIR);
        assert_eq!(n.words_remaining(), 28);
        n.restore_allocation_point(cp);
        assert_eq!(n.words_remaining(), 32);
    }

    #[test]
    fn debug_red_zones_validate() {
        let mut mem = Memory::new(0, 0, 32);
        let mut n = Nursery::new(&mem, true);
        n.allocate(&mut mem, 2, CELL_TEST_PAIR);
        n.allocate(&mut mem, 3, CELL_TEST_PAIR);
        assert!(n.check_red_zones(&mem));
    }

    #[test]
    fn exhaustion_reported_before_allocating() {
        let mem = Memory::new(0, 0, 4);
        let n = Nursery::new(&mem, false);
        assert!(!n.can_allocate(5));
        assert!(n.can_allocate(4));
    }
}
