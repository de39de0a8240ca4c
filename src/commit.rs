//! Group commit (spec §4.8) and the incremental major GC driver it
//! invokes on every pass (spec §4.7).
//!
//! A commit has three jobs: evacuate the nursery's reachable data into
//! a fresh mature generation, optionally run one round of major GC,
//! and atomically publish the result as a new root block. The
//! youngest generation a commit produces is never immediately
//! described by a `generation_pinfo` cell — doing so would require the
//! cell to describe a page count that includes its own page, before
//! that page count is known. Instead its metadata is cached directly
//! in the root block (`youngest_generation_*`) and converted into a
//! real pinfo cell lazily, at the start of the *next* commit, once its
//! final page list is long since settled. That conversion is excluded
//! from this commit's own major GC round (if one starts): a generation
//! only becomes collection-eligible once a prior commit has already
//! given it a persisted pinfo cell, never the commit that just wrote
//! one for it.

use crate::engine::EngineState;
use crate::error::Result;
use crate::gc::Copier;
use crate::generation::{self, Generation, GenerationId, GenerationStatus};
use crate::memory::Addr;
use crate::page::{self, PageOwner};
use crate::remset::RememberedSet;
use crate::word::is_null;

pub fn group_commit(state: &mut EngineState) -> Result<()> {
    if state.cfg.be_verbose {
        let used = state.nursery.capacity_words() - state.nursery.words_remaining();
        tracing::debug!(nursery_used = used, "group_commit: starting");
    }
    let prev_youngest_gn = state.gens.youngest();
    let gc_round_started = maybe_start_major_gc_round(state, prev_youngest_gn);
    let demote_snapshot = prev_youngest_gn.map(|gn| snapshot_generation(state, gn));

    let new_gn = state.gens.allocate_generation();

    let mut named_roots = state.root.named_roots.clone();
    let mut head = state.root.generation_pinfo_list;
    let mut prev = state.root.prev_generation_pinfo_list;
    let mut prev_prev = state.root.prev_prev_generation_pinfo_list;

    {
        let mut copier = Copier::new(
            &mut state.mem,
            &mut state.pages,
            &mut state.gens,
            &mut state.pool,
            new_gn,
            |_| {},
        );
        for v in named_roots.iter_mut() {
            *v = copier.evacuate_root_value(*v)?;
        }
        head = copier.evacuate_root_value(head)?;
        prev = copier.evacuate_root_value(prev)?;
        prev_prev = copier.evacuate_root_value(prev_prev)?;
        copier.drain()?;
        copier.finish();

        if let Some((snapshot, num_from)) = &demote_snapshot {
            let pinfo_addr =
                generation::write_pinfo_cell(copier.mem, &mut state.nursery, snapshot, *num_from, head);
            let evacuated = copier.evacuate_root_value(pinfo_addr)?;
            copier.drain()?;
            copier.finish();
            prev_prev = prev;
            prev = head;
            head = evacuated;
        }
    }

    state.root.named_roots = named_roots;
    state.root.generation_pinfo_list = head;
    state.root.prev_generation_pinfo_list = prev;
    state.root.prev_prev_generation_pinfo_list = prev_prev;

    if gc_round_started {
        major_gc_step(state, new_gn)?;
    }
    state.root.major_gc_was_started_at_last_commit = gc_round_started;

    let dpns = flush_generation(state, new_gn)?;
    state.gens.get_mut(new_gn).disk_pages = dpns.clone();
    state.gens.insert_generation_after(new_gn, None);

    let pages = state.gens.get(new_gn).pages.clone();
    let referring = count_root_referring_ptrs(state, new_gn);
    state.root.youngest_generation_number_of_pages = pages.len() as u32;
    state.root.youngest_generation_number = state.gens.get(new_gn).number;
    state.root.youngest_generation_number_of_referring_ptrs = referring;
    state.root.youngest_generation_pages = pages.into_iter().zip(dpns).collect();

    state.nursery.clear(&mut state.mem);
    state.root.advance_timestamp();
    let words = state.root.to_words(state.cfg.max_generation_size);
    state.disk.write_root(&words)?;

    if state.cfg.root_timestamp_is_displayed {
        let (hi, lo) = state.root.timestamp();
        tracing::info!(hi, lo, "group_commit: wrote root");
    }

    let EngineState { gens, disk, .. } = state;
    gens.mark_twice_collected_generations_nonexistent(|dpn| disk.free(dpn));

    if state.cfg.file_usage_is_displayed {
        tracing::info!(
            free_pages = state.pages.free_count(),
            free_disk_pages = state.disk.number_of_free_disk_pages(),
            "group_commit: page usage"
        );
    }

    Ok(())
}

/// Copy a generation's persisted-relevant fields out so a
/// `generation_pinfo` cell can describe it while `gens` is held
/// exclusively elsewhere (e.g. by a [`Copier`]).
fn snapshot_generation(state: &EngineState, gn: GenerationId) -> (Generation, u32) {
    let g = state.gens.get(gn);
    let snapshot = Generation {
        status: g.status,
        number: g.number,
        pages: g.pages.clone(),
        disk_pages: g.disk_pages.clone(),
        rem_set: RememberedSet::new(),
        younger: None,
        older: None,
        from_generations: Vec::new(),
        collected_twice_next: None,
        number_of_referring_ptrs: g.number_of_referring_ptrs,
    };
    (snapshot, g.from_generations.len() as u32)
}

/// Write every page a generation currently owns to disk, allocating a
/// fresh disk page for each one not already backed by one.
fn flush_generation(state: &mut EngineState, gn: GenerationId) -> Result<Vec<u32>> {
    let pns = state.gens.get(gn).pages.clone();
    let mut dpns = Vec::with_capacity(pns.len());
    for &pn in &pns {
        let dpn = state.disk.allocate_data_page()?;
        let words = state.mem.page_slice(pn as usize).to_vec();
        state.disk.write_page_words(dpn, &words)?;
        dpns.push(dpn);
    }
    Ok(dpns)
}

/// How many root-level pointers (named roots, or the live pinfo-chain
/// head) refer directly into `gn` — cached in the root block alongside
/// a generation's page list (spec §3 "Generation persistence record").
fn count_root_referring_ptrs(state: &EngineState, gn: GenerationId) -> u32 {
    let mut count = 0u32;
    let mut check = |addr: Addr| {
        if is_null(addr) || state.mem.is_in_first_generation(addr) {
            return;
        }
        let pn = page::page_number_of(&state.mem, addr);
        if state.pages.owner(pn) == PageOwner::Generation(gn) {
            count += 1;
        }
    };
    for &v in &state.root.named_roots {
        check(v);
    }
    check(state.root.generation_pinfo_list);
    count
}

/// Whether `addr` currently lives on a page owned by one of `targets`.
fn points_into_targets(state: &EngineState, addr: Addr, targets: &[GenerationId]) -> bool {
    if is_null(addr) || state.mem.is_in_first_generation(addr) {
        return false;
    }
    let pn = page::page_number_of(&state.mem, addr);
    matches!(state.pages.owner(pn), PageOwner::Generation(g) if targets.contains(&g))
}

/// Decide whether this commit starts a major GC round (spec §4.7): once
/// the live mature-page total crosses `start_gc_limit`, every `Normal`
/// generation except `exclude` (the generation this same commit is
/// about to give its first persisted pinfo cell, if any) is swept to
/// `ToBeCollected`. A round always runs to completion within the
/// commit that starts it, one atomic pass per triggering commit rather
/// than stepping across several commits (see DESIGN.md).
fn maybe_start_major_gc_round(state: &mut EngineState, exclude: Option<GenerationId>) -> bool {
    let limit = state.cfg.start_gc_limit as usize;
    if limit == 0 {
        return false;
    }
    let mature_pages: usize = state
        .gens
        .iter_by_age()
        .map(|gn| state.gens.get(gn).pages.len())
        .sum();
    if mature_pages < limit {
        return false;
    }
    let ids: Vec<_> = state.gens.iter_by_age().collect();
    for gn in ids {
        if Some(gn) == exclude {
            continue;
        }
        if state.gens.get(gn).status == GenerationStatus::Normal {
            state.gens.get_mut(gn).status = GenerationStatus::ToBeCollected;
        }
    }
    true
}

/// Run the major GC round this commit already started: evacuate every
/// `ToBeCollected` generation's live data into one fresh "into"
/// generation, seeded from their remembered sets and a direct rescan
/// of the root (spec §4.7 steps 3-5).
fn major_gc_step(state: &mut EngineState, pinfo_target_gn: GenerationId) -> Result<()> {
    let targets: Vec<GenerationId> = state.gens.to_be_collected().collect();
    if targets.is_empty() {
        return Ok(());
    }
    if state.cfg.must_show_groups {
        let numbers: Vec<u32> = targets.iter().map(|&gn| state.gens.get(gn).number).collect();
        tracing::info!(?numbers, "major_gc_step: collecting generations");
    }
    for &gn in &targets {
        state.gens.get_mut(gn).status = GenerationStatus::BeingCollected;
    }

    // Snapshot every remembered-set entry and every root-level pointer
    // into a target generation before `gens` is borrowed exclusively by
    // the collector (spec §4.7 step 3a/3c).
    let mut seed_slots: Vec<Addr> = Vec::new();
    for &gn in &targets {
        seed_slots.extend(state.gens.get(gn).rem_set.iter());
    }
    let root_seed_indices: Vec<usize> = (0..state.root.named_roots.len())
        .filter(|&i| points_into_targets(state, state.root.named_roots[i], &targets))
        .collect();
    let head_is_target = points_into_targets(state, state.root.generation_pinfo_list, &targets);

    let into_gn = state.gens.allocate_generation();
    state.gens.get_mut(into_gn).from_generations = targets.clone();

    {
        let mut copier = Copier::new(
            &mut state.mem,
            &mut state.pages,
            &mut state.gens,
            &mut state.pool,
            into_gn,
            |_| {},
        );
        for slot in seed_slots {
            copier.push_slot(slot);
        }
        for &i in &root_seed_indices {
            let v = state.root.named_roots[i];
            state.root.named_roots[i] = copier.evacuate_root_value(v)?;
        }
        if head_is_target {
            state.root.generation_pinfo_list = copier.evacuate_root_value(state.root.generation_pinfo_list)?;
        }
        copier.drain()?;
        copier.finish();
    }

    let dpns = flush_generation(state, into_gn)?;
    state.gens.get_mut(into_gn).disk_pages = dpns;

    // Describe the just-compacted generation with its own pinfo cell
    // right away: unlike a commit's nursery-promoted generation, its
    // final page list is already settled, so no deferral is needed.
    let (snapshot, num_from) = snapshot_generation(state, into_gn);
    {
        let mut copier = Copier::new(
            &mut state.mem,
            &mut state.pages,
            &mut state.gens,
            &mut state.pool,
            pinfo_target_gn,
            |_| {},
        );
        let old_head = state.root.generation_pinfo_list;
        let pinfo_addr =
            generation::write_pinfo_cell(copier.mem, &mut state.nursery, &snapshot, num_from, old_head);
        let evacuated = copier.evacuate_root_value(pinfo_addr)?;
        copier.drain()?;
        copier.finish();
        state.root.prev_prev_generation_pinfo_list = state.root.prev_generation_pinfo_list;
        state.root.prev_generation_pinfo_list = old_head;
        state.root.generation_pinfo_list = evacuated;
    }

    let old_oldest = state.gens.oldest();
    state.gens.insert_generation_after(into_gn, old_oldest);

    let EngineState { gens, pages, mem, pool, cfg, .. } = state;
    let debug = cfg.debug;
    for &gn in &targets {
        gens.get_mut(gn).rem_set.free(pool);
        gens.mark_generation_collected_once(gn, |pn| pages.free_page(mem, pn, debug));
    }

    Ok(())
}
