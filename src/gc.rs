//! The copying collector (spec §4.5) and incremental major GC driver
//! (spec §4.7).
//!
//! One `Copier` serves both roles: nursery promotion during group
//! commit, and mature-generation compaction during an incremental
//! major GC step. Both drive the same `copy_cell` / `drain_copy_stack`
//! pair; what differs is only what seeds the work stack and which
//! generation is the copy target.

use crate::cell::{self, is_forwarded, CellType, FieldKind, CELL_GENERATION_PINFO, CELL_TYPE_FORWARDED};
use crate::error::Result;
use crate::generation::{pinfo_width, GenerationId, GenerationManager, GenerationStatus};
use crate::memory::{Addr, Memory};
use crate::page::{self, PageManager, PageNumber};
use crate::remset::ChunkPool;
use crate::word::{is_null, NULL};

/// What to do with a pointer field encountered while copying or
/// draining, decided by where its referent currently lives.
enum Disposition {
    /// Target lives in a generation not presently being collected:
    /// leave the pointer untouched.
    Leave,
    /// Target lives in a generation marked for a future step of this
    /// major GC round: record the slot in that generation's remembered
    /// set and leave the pointer untouched for now.
    Remember(GenerationId),
    /// Target must be evacuated into the current to-generation.
    Copy,
}

pub struct Copier<'a> {
    pub mem: &'a mut Memory,
    pub pages: &'a mut PageManager,
    pub gens: &'a mut GenerationManager,
    pub pool: &'a mut ChunkPool,
    /// The generation new cells are copied into.
    pub to_gn: GenerationId,
    to_pn: Option<PageNumber>,
    to_ptr: Addr,
    to_end: Addr,
    /// Work stack of arena slot addresses still holding an unresolved
    /// (old-space) pointer value.
    stack: Vec<Addr>,
    /// Invoked every time a to-page fills up (or draining completes),
    /// so the caller can schedule its asynchronous write.
    on_page_finished: Box<dyn FnMut(PageNumber) + 'a>,
}

impl<'a> Copier<'a> {
    pub fn new(
        mem: &'a mut Memory,
        pages: &'a mut PageManager,
        gens: &'a mut GenerationManager,
        pool: &'a mut ChunkPool,
        to_gn: GenerationId,
        on_page_finished: impl FnMut(PageNumber) + 'a,
    ) -> Self {
        Self {
            mem,
            pages,
            gens,
            pool,
            to_gn,
            to_pn: None,
            to_ptr: 0,
            to_end: 0,
            stack: Vec::new(),
            on_page_finished: Box::new(on_page_finished),
        }
    }

    /// Seed the work stack with one arena slot (used when copying an
    /// internal cell field).
    pub fn push_slot(&mut self, slot: Addr) {
        self.stack.push(slot);
    }

    /// Evacuate a top-level reference that doesn't live at an arena
    /// address — a root-block pointer slot or a registered smart
    /// pointer (spec §4.7 step 3b/3c). Root-level referents into a
    /// `ToBeCollected`-but-not-yet-started generation are simply left
    /// alone: the root is rescanned in full on every subsequent step,
    /// so no remembered-set entry is needed here (see DESIGN.md).
    pub fn evacuate_root_value(&mut self, value: Addr) -> Result<Addr> {
        if is_null(value) {
            return Ok(value);
        }
        match self.disposition(value) {
            Disposition::Copy => self.copy_cell(value),
            Disposition::Leave | Disposition::Remember(_) => Ok(value),
        }
    }

    fn disposition(&self, target: Addr) -> Disposition {
        if self.mem.is_in_first_generation(target) {
            return Disposition::Copy;
        }
        let pn = page::page_number_of(self.mem, target);
        match self.pages.owner(pn) {
            page::PageOwner::Free => {
                debug_assert!(false, "live pointer into a free page");
                Disposition::Leave
            }
            page::PageOwner::Generation(g) => match self.gens.get(g).status {
                GenerationStatus::Normal => Disposition::Leave,
                GenerationStatus::ToBeCollected => Disposition::Remember(g),
                GenerationStatus::BeingCollected => Disposition::Copy,
                GenerationStatus::CollectedOnce
                | GenerationStatus::CollectedTwice
                | GenerationStatus::Nonexistent => {
                    debug_assert!(false, "live pointer into a reclaimed generation");
                    Disposition::Leave
                }
            },
        }
    }

    /// Process one arena slot: read its current value, decide what to
    /// do per `disposition`, and recurse via the work stack rather than
    /// the call stack (spec §4.5 "drain_copy_stack").
    fn process_slot(&mut self, slot: Addr) -> Result<()> {
        let target = self.mem.read(slot);
        if is_null(target) {
            return Ok(());
        }
        match self.disposition(target) {
            Disposition::Leave => {}
            Disposition::Remember(g) => {
                self.gens.get_mut(g).rem_set.prepend(self.pool, slot);
            }
            Disposition::Copy => {
                let new_addr = self.copy_cell(target)?;
                self.mem.write(slot, new_addr);
            }
        }
        Ok(())
    }

    fn width_of(&self, header: u32) -> usize {
        if cell::cell_type(header) == CELL_GENERATION_PINFO {
            pinfo_width(header)
        } else {
            cell::lookup(cell::cell_type(header))
                .map(|info| info.width as usize)
                .unwrap_or(1)
        }
    }

    fn fields_of(&self, ty: CellType) -> &'static [FieldKind] {
        if ty == CELL_GENERATION_PINFO {
            // Only the `prev` field (word offset 2, i.e. the third field
            // after the header) is a pointer; the trailing page/disk-page
            // array is opaque words handled by the verbatim copy below.
            const PINFO_FIELDS: &[FieldKind] = &[
                FieldKind::Word,
                FieldKind::Word,
                FieldKind::Ptr,
                FieldKind::Word,
                FieldKind::Word,
            ];
            PINFO_FIELDS
        } else {
            cell::lookup(ty).map(|info| info.fields).unwrap_or(&[])
        }
    }

    /// `copy_cell(pp)`: evacuate the cell at `old_addr`, installing a
    /// forwarding marker, and return its new address. Copying an
    /// already-forwarded cell is idempotent (spec §8 "Copy idempotence").
    pub fn copy_cell(&mut self, old_addr: Addr) -> Result<Addr> {
        let header = self.mem.read(old_addr);
        if is_forwarded(header) {
            return Ok(self.mem.read(old_addr + 1));
        }
        let ty = cell::cell_type(header);
        let width = self.width_of(header);
        let new_addr = self.reserve(width)?;

        self.mem.write(new_addr, header);
        let fields = self.fields_of(ty);
        for (i, kind) in fields.iter().enumerate() {
            let old_slot = old_addr + 1 + i as Addr;
            let new_slot = new_addr + 1 + i as Addr;
            let value = self.mem.read(old_slot);
            self.mem.write(new_slot, value);
            let pointer_like = matches!(kind, FieldKind::Ptr | FieldKind::NonNullPtr)
                || (*kind == FieldKind::Tagged && crate::word::Tag::of(value) == crate::word::Tag::Pointer);
            if pointer_like && !is_null(value) {
                self.stack.push(new_slot);
            }
        }
        // Any words beyond the fixed fields (e.g. a pinfo cell's
        // page/disk-page array) are opaque and copied verbatim.
        for i in (1 + fields.len()) as Addr..width as Addr {
            let v = self.mem.read(old_addr + i);
            self.mem.write(new_addr + i, v);
        }

        // Install the forwarding marker over the source cell.
        self.mem.write(old_addr, cell::make_header(CELL_TYPE_FORWARDED, 0));
        self.mem.write(old_addr + 1, new_addr);
        Ok(new_addr)
    }

    fn reserve(&mut self, width: usize) -> Result<Addr> {
        loop {
            if self.to_pn.is_some() && self.to_ptr + width as Addr <= self.to_end {
                let addr = self.to_ptr;
                self.to_ptr += width as Addr;
                return Ok(addr);
            }
            self.start_new_to_page()?;
        }
    }

    fn start_new_to_page(&mut self) -> Result<()> {
        if let Some(pn) = self.to_pn.take() {
            self.finish_to_page(pn);
        }
        let pn = self.pages.allocate_page(self.to_gn)?;
        page::init_page_header(self.mem, pn);
        self.gens.get_mut(self.to_gn).pages.push(pn);
        self.to_pn = Some(pn);
        self.to_ptr = self.mem.page_base(pn as usize) + page::PAGE_HEADER_WORDS as Addr;
        self.to_end = self.mem.page_base(pn as usize) + self.mem.page_words as Addr;
        Ok(())
    }

    fn finish_to_page(&mut self, pn: PageNumber) {
        let base = self.mem.page_base(pn as usize);
        let used = (self.to_ptr - base) as u32;
        page::set_page_word_count(self.mem, pn, used);
        (self.on_page_finished)(pn);
    }

    /// `drain_copy_stack()`: process every outstanding slot to
    /// completion.
    pub fn drain(&mut self) -> Result<()> {
        while let Some(slot) = self.stack.pop() {
            self.process_slot(slot)?;
        }
        Ok(())
    }

    /// Finish the current to-page (if any) so its word count is
    /// finalized and it is handed to the caller's write callback. Call
    /// after `drain()` at the end of a GC pass.
    pub fn finish(&mut self) {
        if let Some(pn) = self.to_pn.take() {
            self.finish_to_page(pn);
        }
    }
}

pub const NULL_ADDR: Addr = NULL;
