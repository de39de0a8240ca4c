//! Root-locate: binary search with probes over file positions to find
//! the newest valid root block (spec §4.11.1).
//!
//! Writes cycle round-robin within a file, so timestamps along any one
//! file are piecewise monotone: a two-direction probe finds a root
//! adjacent to the binary search's midpoint, letting the search
//! converge in `O(log P)` page reads per file plus a small constant of
//! extra probes.

use crate::disk::{self, DiskPageNumber, DiskStore};
use crate::page::{PAGE_MAGIC_COOKIE, ROOT_MAGIC_COOKIE, UNUSED_PAGE_COOKIE};

type Timestamp = (u32, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Data,
    Root(Timestamp),
    Unused,
}

fn read_kind(store: &DiskStore, file: usize, page: u32) -> Kind {
    let words = store
        .read_page_words(disk::pack(file as u32, page))
        .expect("root-locate read");
    match words[0] {
        ROOT_MAGIC_COOKIE => Kind::Root((words[1], words[2])),
        PAGE_MAGIC_COOKIE => Kind::Data,
        UNUSED_PAGE_COOKIE => Kind::Unused,
        other => {
            tracing::warn!(cookie = other, file, page, "unrecognized page cookie during root-locate");
            Kind::Unused
        }
    }
}

/// Run the search within a single file; returns the newest root page
/// found (if any).
fn locate_in_file(store: &DiskStore, file: usize, verbose: bool) -> Option<(u32, Timestamp)> {
    let page_count = store.page_count(file);
    if page_count == 0 {
        return None;
    }

    // Step 1: find the left boundary — the first root-or-data page.
    let mut left_page = 0u32;
    let mut left_ts: Option<Timestamp> = loop {
        match read_kind(store, file, left_page) {
            Kind::Root(ts) => break Some(ts),
            Kind::Data => break None,
            Kind::Unused => {
                left_page += 1;
                if left_page >= page_count {
                    // Every page in the file is unused: no root here.
                    return None;
                }
            }
        }
    };

    let mut right_page = page_count - 1;
    let mut right_ts: Option<Timestamp> = None;
    let mut right_valid = false;
    let mut probe_left_first = true;

    loop {
        if left_page >= right_page {
            break;
        }
        let mid = left_page + (right_page - left_page) / 2;
        match read_kind(store, file, mid) {
            Kind::Root(ts) => {
                if verbose {
                    tracing::debug!(file, mid, ?ts, "root-locate: root page");
                }
                if left_ts.map(|l| ts > l).unwrap_or(true) {
                    left_page = mid;
                    left_ts = Some(ts);
                } else {
                    right_page = mid;
                    right_ts = Some(ts);
                    right_valid = true;
                }
                probe_left_first = !probe_left_first;
            }
            Kind::Unused => {
                // Treat as a new right boundary: later writes have not
                // (yet) extended this far.
                right_page = mid;
                right_ts = None;
                right_valid = false;
            }
            Kind::Data => {
                match probe_outward(store, file, mid, left_page, right_page, probe_left_first) {
                    Some((found, ts)) => {
                        if left_ts.map(|l| ts > l).unwrap_or(true) {
                            left_page = found;
                            left_ts = Some(ts);
                        } else {
                            right_page = found;
                            right_ts = Some(ts);
                            right_valid = true;
                        }
                        probe_left_first = !probe_left_first;
                    }
                    None => break, // both directions exhausted: [left,right] is the answer.
                }
            }
        }
    }

    if right_valid && right_ts.map(|r| Some(r) > left_ts).unwrap_or(false) {
        right_ts.map(|ts| (right_page, ts))
    } else {
        left_ts.map(|ts| (left_page, ts))
    }
}

/// Probe outward from `mid`, alternating direction, looking for a root
/// page within `[left, right]` (spec §4.11.1 step 4 "Data page").
fn probe_outward(
    store: &DiskStore,
    file: usize,
    mid: u32,
    left: u32,
    right: u32,
    left_first: bool,
) -> Option<(u32, Timestamp)> {
    let mut d = 1u32;
    loop {
        let lo = mid.checked_sub(d).filter(|&p| p >= left);
        let hi = mid.checked_add(d).filter(|&p| p <= right);
        if lo.is_none() && hi.is_none() {
            return None;
        }
        let order: [Option<u32>; 2] = if left_first { [lo, hi] } else { [hi, lo] };
        for candidate in order.into_iter().flatten() {
            if let Kind::Root(ts) = read_kind(store, file, candidate) {
                return Some((candidate, ts));
            }
        }
        d += 1;
    }
}

/// Locate the globally newest root across every backing file. Returns
/// the winning disk page number and its timestamp.
pub fn locate_newest_root(store: &DiskStore, verbose: bool) -> Option<(DiskPageNumber, Timestamp)> {
    let mut best: Option<(DiskPageNumber, Timestamp)> = None;
    for file in 0..store.num_files() {
        if let Some((page, ts)) = locate_in_file(store, file, verbose) {
            let dpn = disk::pack(file as u32, page);
            if best.map(|(_, best_ts)| ts > best_ts).unwrap_or(true) {
                best = Some((dpn, ts));
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, IoMode};
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path, npages: u32) -> Config {
        let mut cfg = Config::default();
        cfg.page_size = 64;
        cfg.disk_filename = vec![dir.join("f0.db")];
        cfg.disk_filesize = vec![64 * npages as u64];
        cfg.io_mode = IoMode::Sync;
        cfg
    }

    fn write_root_at(store: &mut DiskStore, page: u32, ts: Timestamp) {
        let mut words = vec![0u32; store.page_words()];
        words[0] = ROOT_MAGIC_COOKIE;
        words[1] = ts.0;
        words[2] = ts.1;
        store.write_page_words(disk::pack(0, page), &words).unwrap();
    }

    #[test]
    fn finds_only_root_among_unused_pages() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), 16);
        let mut store = DiskStore::create(&cfg).unwrap();
        // Creating a file zero-fills it; every page reads back as
        // cookie 0 which this test treats as "unused" by writing the
        // real unused cookie explicitly first.
        for p in 0..16 {
            let mut words = vec![0u32; store.page_words()];
            words[0] = UNUSED_PAGE_COOKIE;
            store.write_page_words(disk::pack(0, p), &words).unwrap();
        }
        write_root_at(&mut store, 5, (0, 42));
        let (dpn, ts) = locate_newest_root(&store, false).unwrap();
        assert_eq!(disk::unpack(dpn), (0, 5));
        assert_eq!(ts, (0, 42));
    }

    #[test]
    fn picks_the_newer_of_two_roots() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), 16);
        let mut store = DiskStore::create(&cfg).unwrap();
        for p in 0..16 {
            let mut words = vec![0u32; store.page_words()];
            words[0] = UNUSED_PAGE_COOKIE;
            store.write_page_words(disk::pack(0, p), &words).unwrap();
        }
        write_root_at(&mut store, 2, (0, 10));
        write_root_at(&mut store, 9, (0, 20));
        let (dpn, ts) = locate_newest_root(&store, false).unwrap();
        assert_eq!(disk::unpack(dpn), (0, 9));
        assert_eq!(ts, (0, 20));
    }

    #[test]
    fn no_root_anywhere_returns_none() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), 8);
        let mut store = DiskStore::create(&cfg).unwrap();
        for p in 0..8 {
            let mut words = vec![0u32; store.page_words()];
            words[0] = UNUSED_PAGE_COOKIE;
            store.write_page_words(disk::pack(0, p), &words).unwrap();
        }
        assert!(locate_newest_root(&store, false).is_none());
    }
}
