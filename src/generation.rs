//! Mature generations and the generation manager (spec §3 "Generation",
//! §4.6).

use crate::cell;
use crate::memory::{Addr, Memory};
use crate::page::PageNumber;
use crate::remset::RememberedSet;
use crate::word::{is_null, NULL};

pub use crate::disk::DiskPageNumber;
pub type GenerationId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Nonexistent,
    Normal,
    ToBeCollected,
    BeingCollected,
    CollectedOnce,
    CollectedTwice,
}

pub struct Generation {
    pub status: GenerationStatus,
    /// Monotonically increasing identity, distinct from the slot index
    /// (slots are reused once a generation goes `Nonexistent`).
    pub number: u64,
    pub pages: Vec<PageNumber>,
    pub disk_pages: Vec<DiskPageNumber>,
    pub rem_set: RememberedSet,
    pub younger: Option<GenerationId>,
    pub older: Option<GenerationId>,
    /// Slots of the older generations whose live data was copied into
    /// this one by the major GC step that created it.
    pub from_generations: Vec<GenerationId>,
    pub collected_twice_next: Option<GenerationId>,
    /// How many root-block / smart-pointer roots refer directly into
    /// this generation (spec §3 "Generation persistence record").
    pub number_of_referring_ptrs: u32,
}

impl Generation {
    fn new() -> Self {
        Self {
            status: GenerationStatus::Nonexistent,
            number: 0,
            pages: Vec::new(),
            disk_pages: Vec::new(),
            rem_set: RememberedSet::new(),
            younger: None,
            older: None,
            from_generations: Vec::new(),
            collected_twice_next: None,
            number_of_referring_ptrs: 0,
        }
    }
}

/// Doubly linked, age-ordered set of generations plus the
/// collected-twice removal list (spec §4.6, §3 Invariant 5).
pub struct GenerationManager {
    slots: Vec<Generation>,
    youngest: Option<GenerationId>,
    oldest: Option<GenerationId>,
    collected_twice_head: Option<GenerationId>,
    next_generation_number: u64,
}

impl GenerationManager {
    pub fn new(max_generations: usize) -> Self {
        let mut slots = Vec::with_capacity(max_generations);
        for _ in 0..max_generations {
            slots.push(Generation::new());
        }
        Self {
            slots,
            youngest: None,
            oldest: None,
            collected_twice_head: None,
            next_generation_number: 0,
        }
    }

    pub fn get(&self, gn: GenerationId) -> &Generation {
        &self.slots[gn as usize]
    }

    pub fn get_mut(&mut self, gn: GenerationId) -> &mut Generation {
        &mut self.slots[gn as usize]
    }

    pub fn youngest(&self) -> Option<GenerationId> {
        self.youngest
    }

    pub fn oldest(&self) -> Option<GenerationId> {
        self.oldest
    }

    /// Iterate generation slots from youngest to oldest.
    pub fn iter_by_age(&self) -> impl Iterator<Item = GenerationId> + '_ {
        let mut cur = self.youngest;
        std::iter::from_fn(move || {
            let gn = cur?;
            cur = self.slots[gn as usize].older;
            Some(gn)
        })
    }

    /// `allocate_generation()`: linear-probe the first `Nonexistent`
    /// slot and initialize it as `Normal`, not yet linked into the age
    /// list.
    pub fn allocate_generation(&mut self) -> GenerationId {
        let idx = self
            .slots
            .iter()
            .position(|g| g.status == GenerationStatus::Nonexistent)
            .expect("generation table exhausted: raise max_generation_size");
        let number = self.next_generation_number;
        self.next_generation_number += 1;
        let g = &mut self.slots[idx];
        *g = Generation::new();
        g.status = GenerationStatus::Normal;
        g.number = number;
        idx as GenerationId
    }

    /// `insert_generation_after(younger_gn)`: splice `gn` into the
    /// age-ordered list. `younger_gn = None` inserts at the youngest end.
    pub fn insert_generation_after(&mut self, gn: GenerationId, younger_gn: Option<GenerationId>) {
        match younger_gn {
            None => {
                self.slots[gn as usize].older = self.youngest;
                if let Some(old_youngest) = self.youngest {
                    self.slots[old_youngest as usize].younger = Some(gn);
                }
                self.youngest = Some(gn);
                if self.oldest.is_none() {
                    self.oldest = Some(gn);
                }
            }
            Some(y) => {
                let older = self.slots[y as usize].older;
                self.slots[y as usize].older = Some(gn);
                self.slots[gn as usize].younger = Some(y);
                self.slots[gn as usize].older = older;
                match older {
                    Some(o) => self.slots[o as usize].younger = Some(gn),
                    None => self.oldest = Some(gn),
                }
            }
        }
    }

    fn unlink(&mut self, gn: GenerationId) {
        let (younger, older) = {
            let g = &self.slots[gn as usize];
            (g.younger, g.older)
        };
        match younger {
            Some(y) => self.slots[y as usize].older = older,
            None => self.youngest = older,
        }
        match older {
            Some(o) => self.slots[o as usize].younger = younger,
            None => self.oldest = younger,
        }
        let g = &mut self.slots[gn as usize];
        g.younger = None;
        g.older = None;
    }

    /// `mark_generation_collected_once(gn)`: frees `gn`'s in-RAM pages
    /// (the caller supplies the page manager / memory), unlinks it from
    /// the age list, and marks every one of its from-generations
    /// `CollectedTwice`, pushing them onto the global removal list.
    pub fn mark_generation_collected_once(
        &mut self,
        gn: GenerationId,
        mut free_page: impl FnMut(PageNumber),
    ) {
        let pages = std::mem::take(&mut self.slots[gn as usize].pages);
        for pn in pages {
            free_page(pn);
        }
        self.unlink(gn);
        self.slots[gn as usize].status = GenerationStatus::CollectedOnce;

        let froms = std::mem::take(&mut self.slots[gn as usize].from_generations);
        for from in froms {
            self.slots[from as usize].status = GenerationStatus::CollectedTwice;
            self.slots[from as usize].collected_twice_next = self.collected_twice_head;
            self.collected_twice_head = Some(from);
        }
    }

    /// `mark_twice_collected_generations_nonexistent()`: called once the
    /// root persisting this transition is durable. Frees every
    /// `CollectedTwice` generation's disk pages and returns the slot to
    /// `Nonexistent`.
    pub fn mark_twice_collected_generations_nonexistent(
        &mut self,
        mut free_disk_page: impl FnMut(DiskPageNumber),
    ) {
        let mut cur = self.collected_twice_head.take();
        while let Some(gn) = cur {
            let next = self.slots[gn as usize].collected_twice_next;
            for dpn in std::mem::take(&mut self.slots[gn as usize].disk_pages) {
                free_disk_page(dpn);
            }
            self.slots[gn as usize] = Generation::new();
            cur = next;
        }
    }

    pub fn to_be_collected(&self) -> impl Iterator<Item = GenerationId> + '_ {
        self.iter_by_age()
            .filter(|&gn| self.slots[gn as usize].status == GenerationStatus::ToBeCollected)
    }
}

// ---------------------------------------------------------------------
// `generation_pinfo` persistence cells (spec §3, §4.6).
//
// Unlike the fixed-width catalog entries in `cell.rs`, a pinfo cell's
// width depends on how many pages its generation held: the header's
// low 24 bits store that page count, and the page/disk-page arrays
// trail the fixed fields as plain (non-pointer) word pairs. This is the
// one catalog member the generic `size_of`/copier dispatch in
// `cell.rs`/`gc.rs` special-cases, the same way the original's variable
// -length cells (shtrings) fall outside the static per-type width table.
// ---------------------------------------------------------------------

/// Fixed words before the page/disk-page array: header, page_count,
/// from_generation_count, prev, generation_number, num_referring_ptrs.
pub const PINFO_FIXED_WORDS: usize = 6;

pub fn pinfo_width(header: u32) -> usize {
    let page_count = (header & 0x00FF_FFFF) as usize;
    PINFO_FIXED_WORDS + 2 * page_count
}

/// Allocate and populate a `generation_pinfo` cell describing `g` in
/// the nursery, linking `prev` (the previous head of the list, or null)
/// as its predecessor. Returns the new cell's address.
pub fn write_pinfo_cell(
    mem: &mut Memory,
    nursery: &mut crate::nursery::Nursery,
    g: &Generation,
    num_from: u32,
    prev: Addr,
) -> Addr {
    let page_count = g.pages.len();
    let width = PINFO_FIXED_WORDS + 2 * page_count;
    let addr = nursery.raw_allocate(mem, width);
    let header = cell::make_header(cell::CELL_GENERATION_PINFO, page_count as u32);
    mem.write(addr, header);
    mem.write(addr + 1, page_count as u32);
    mem.write(addr + 2, num_from);
    mem.write(addr + 3, prev);
    mem.write(addr + 4, (g.number & 0xFFFF_FFFF) as u32);
    mem.write(addr + 5, g.number_of_referring_ptrs);
    for (i, (&pn, &dpn)) in g.pages.iter().zip(g.disk_pages.iter()).enumerate() {
        mem.write(addr + PINFO_FIXED_WORDS as Addr + (2 * i) as Addr, pn);
        mem.write(
            addr + PINFO_FIXED_WORDS as Addr + (2 * i + 1) as Addr,
            dpn as u32,
        );
    }
    addr
}

pub struct PinfoView {
    pub page_count: u32,
    pub from_generation_count: u32,
    pub prev: Addr,
    pub generation_number: u64,
    pub number_of_referring_ptrs: u32,
}

pub fn read_pinfo(mem: &Memory, addr: Addr) -> PinfoView {
    PinfoView {
        page_count: mem.read(addr + 1),
        from_generation_count: mem.read(addr + 2),
        prev: mem.read(addr + 3),
        generation_number: mem.read(addr + 4) as u64,
        number_of_referring_ptrs: mem.read(addr + 5),
    }
}

pub fn read_pinfo_page(mem: &Memory, addr: Addr, i: usize) -> (PageNumber, DiskPageNumber) {
    let pn = mem.read(addr + PINFO_FIXED_WORDS as Addr + (2 * i) as Addr);
    let dpn = mem.read(addr + PINFO_FIXED_WORDS as Addr + (2 * i + 1) as Addr) as DiskPageNumber;
    (pn, dpn)
}

pub fn pinfo_is_null(addr: Addr) -> bool {
    is_null(addr)
}

pub const NULL_PINFO: Addr = NULL;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use crate::nursery::Nursery;

    #[test]
    fn age_list_insert_and_unlink() {
        let mut gm = GenerationManager::new(4);
        let a = gm.allocate_generation();
        gm.insert_generation_after(a, None);
        let b = gm.allocate_generation();
        gm.insert_generation_after(b, None);
        // b is youngest, a is next.
        assert_eq!(gm.youngest(), Some(b));
        assert_eq!(gm.oldest(), Some(a));
        assert_eq!(gm.iter_by_age().collect::<Vec<_>>(), vec![b, a]);

        gm.mark_generation_collected_once(a, |_| {});
        assert_eq!(gm.get(a).status, GenerationStatus::CollectedOnce);
        assert_eq!(gm.iter_by_age().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn collected_twice_chain_freed_on_root_persist() {
        let mut gm = GenerationManager::new(4);
        let old = gm.allocate_generation();
        gm.insert_generation_after(old, None);
        let young = gm.allocate_generation();
        gm.insert_generation_after(young, None);
        gm.get_mut(young).from_generations.push(old);

        gm.mark_generation_collected_once(young, |_| {});
        assert_eq!(gm.get(old).status, GenerationStatus::CollectedTwice);

        let mut freed = Vec::new();
        gm.get_mut(old).disk_pages.push(42);
        gm.mark_twice_collected_generations_nonexistent(|dpn| freed.push(dpn));
        assert_eq!(freed, vec![42]);
        assert_eq!(gm.get(old).status, GenerationStatus::Nonexistent);
    }

    #[test]
    fn pinfo_roundtrip() {
        let mut mem = Memory::new(0, 0, 64);
        let mut nursery = Nursery::new(&mem, false);
        let mut g = Generation::new();
        g.number = 7;
        g.number_of_referring_ptrs = 2;
        g.pages = vec![3, 5];
        g.disk_pages = vec![103, 105];
        let addr = write_pinfo_cell(&mut mem, &mut nursery, &g, 1, NULL);
        let view = read_pinfo(&mem, addr);
        assert_eq!(view.page_count, 2);
        assert_eq!(view.from_generation_count, 1);
        assert_eq!(view.generation_number, 7);
        assert_eq!(read_pinfo_page(&mem, addr, 0), (3, 103));
        assert_eq!(read_pinfo_page(&mem, addr, 1), (5, 105));
        assert_eq!(pinfo_width(mem.read(addr)), PINFO_FIXED_WORDS + 4);
    }
}
