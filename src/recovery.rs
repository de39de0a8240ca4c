//! Crash recovery: rebuild every in-RAM structure from the newest
//! durable root block (spec §4.12).
//!
//! The root's own `youngest_generation_*` fields describe the most
//! recently committed generation directly, since it was never given a
//! `generation_pinfo` cell (see `commit.rs`). From there, walking
//! `prev` pointers through the persisted pinfo chain works backward
//! through progressively older generations — each pinfo cell's bytes
//! live on a page of the generation one step younger than the one it
//! describes, so by the time a step needs to read one, that page has
//! already been loaded back into the arena by the previous step.
//!
//! Because a major GC round always completes within the single commit
//! that starts it (see `commit.rs`), no generation is ever left
//! `ToBeCollected`/`BeingCollected` in a durable root, and remembered
//! sets carry no information across commits — recovery reconstructs
//! every generation as `Normal` with an empty remembered set, which is
//! exactly the state a commit leaves behind once it finishes.

use crate::config::Config;
use crate::disk::DiskStore;
use crate::engine::EngineState;
use crate::error::{Error, Result};
use crate::generation::{self, GenerationId, GenerationManager};
use crate::memory::Memory;
use crate::nursery::Nursery;
use crate::page::{self, PageManager};
use crate::remset::ChunkPool;
use crate::rootblock::RootBlock;
use crate::rootlocate;
use crate::word::is_null;

pub fn recover(cfg: Config) -> Result<EngineState> {
    let mut disk = DiskStore::open(&cfg)?;
    let (root_dpn, _ts) =
        rootlocate::locate_newest_root(&disk, cfg.root_search_is_verbose).ok_or(Error::NoRoot)?;
    let words = disk.read_page_words(root_dpn)?;
    page::check_cookie(&words, true)?;
    let root = RootBlock::from_words(&words, cfg.max_generation_size);
    disk.set_current_root(root_dpn);

    let mem = Memory::new(cfg.num_pages(), cfg.page_words(), cfg.nursery_words());
    let pages = PageManager::new(cfg.num_pages());
    let nursery = Nursery::new(&mem, cfg.debug);
    let gens = GenerationManager::new(cfg.max_generations);
    let pool = ChunkPool::new(cfg.rem_sets_per_malloc);

    let mut state = EngineState { mem, pages, nursery, gens, pool, disk, root, cfg };

    // The never-committed-yet database has no youngest generation at
    // all: `RootBlock::fresh` leaves the sentinel `u64::MAX` in place.
    if state.root.youngest_generation_number != u64::MAX {
        let n = state.root.youngest_generation_number_of_pages as usize;
        let pairs = state.root.youngest_generation_pages[..n].to_vec();
        let youngest_gn = state.gens.allocate_generation();
        state.gens.get_mut(youngest_gn).number = state.root.youngest_generation_number;
        state.gens.get_mut(youngest_gn).number_of_referring_ptrs =
            state.root.youngest_generation_number_of_referring_ptrs;
        load_generation_pages(&mut state, youngest_gn, &pairs)?;
        state.gens.insert_generation_after(youngest_gn, None);

        let mut younger_gn = youngest_gn;
        let mut cur_addr = state.root.generation_pinfo_list;
        while !is_null(cur_addr) {
            let view = generation::read_pinfo(&state.mem, cur_addr);
            let gn = state.gens.allocate_generation();
            state.gens.get_mut(gn).number = view.generation_number;
            state.gens.get_mut(gn).number_of_referring_ptrs = view.number_of_referring_ptrs;

            let mut pairs = Vec::with_capacity(view.page_count as usize);
            for i in 0..view.page_count as usize {
                pairs.push(generation::read_pinfo_page(&state.mem, cur_addr, i));
            }
            load_generation_pages(&mut state, gn, &pairs)?;
            state.gens.insert_generation_after(gn, Some(younger_gn));

            younger_gn = gn;
            cur_addr = view.prev;
        }
    }

    state.pages.construct_page_freelist();
    state.disk.declare_unallocated_pages_free();

    Ok(state)
}

/// Read each `(page_number, disk_page_number)` pair's content back from
/// disk into the arena at its original page number — pointers stored
/// within the data are only valid if every page returns to the exact
/// slot it occupied when written (spec §4.12 point 2).
fn load_generation_pages(
    state: &mut EngineState,
    gn: GenerationId,
    pairs: &[(u32, u32)],
) -> Result<()> {
    for &(pn, dpn) in pairs {
        let words = state.disk.read_page_words(dpn)?;
        page::check_cookie(&words, false)?;
        state.mem.page_slice_mut(pn as usize).copy_from_slice(&words);
        state.pages.claim_page(pn, gn);
        state.disk.declare_allocated(dpn);
        state.gens.get_mut(gn).pages.push(pn);
        state.gens.get_mut(gn).disk_pages.push(dpn);
    }
    Ok(())
}
