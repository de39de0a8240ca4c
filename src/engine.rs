//! The top-level engine (spec §9 "Global mutable state"): a single
//! value concentrating every piece of process-wide state the rest of
//! the crate would otherwise reach for as a singleton — the word
//! arena, page and generation bookkeeping, the disk store, and the
//! current root block — created exactly once per process through
//! [`Engine::create`] or [`Engine::open`].

use crate::cell::{self, CellType};
use crate::config::Config;
use crate::disk::DiskStore;
use crate::error::{Error, Result};
use crate::generation::GenerationManager;
use crate::memory::{Addr, Memory};
use crate::nursery::Nursery;
use crate::page::PageManager;
use crate::remset::ChunkPool;
use crate::rootblock::RootBlock;
use crate::{commit, recovery};

/// Every piece of state a commit or a recovery pass needs to touch.
/// Kept as a plain struct (rather than fields directly on [`Engine`])
/// so `commit.rs`/`recovery.rs` can borrow disjoint fields of it
/// without fighting the borrow checker over one opaque `Engine`.
pub(crate) struct EngineState {
    pub mem: Memory,
    pub pages: PageManager,
    pub nursery: Nursery,
    pub gens: GenerationManager,
    pub pool: ChunkPool,
    pub disk: DiskStore,
    pub root: RootBlock,
    pub cfg: Config,
}

/// A Shades database. One value per open database, per process (spec
/// §9's "single engine value" redesign).
pub struct Engine {
    pub(crate) state: EngineState,
}

impl Engine {
    /// `shades_create`: build a brand-new database, writing an initial
    /// root so that `open` always has something to find.
    pub fn create(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let mem = Memory::new(cfg.num_pages(), cfg.page_words(), cfg.nursery_words());
        let pages = PageManager::new(cfg.num_pages());
        let nursery = Nursery::new(&mem, cfg.debug);
        let gens = GenerationManager::new(cfg.max_generations);
        let pool = ChunkPool::new(cfg.rem_sets_per_malloc);
        let disk = DiskStore::create(&cfg)?;
        let mut root = RootBlock::fresh(cfg.max_generation_size);
        root.advance_timestamp();

        let mut state = EngineState { mem, pages, nursery, gens, pool, disk, root, cfg };
        let words = state.root.to_words(state.cfg.max_generation_size);
        state.disk.write_root(&words)?;
        tracing::info!(timestamp = ?state.root.timestamp(), "database created");
        Ok(Self { state })
    }

    /// `shades_open`: reopen an existing database, locating the newest
    /// valid root and rebuilding every in-RAM structure from it (spec
    /// §4.12).
    pub fn open(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let state = recovery::recover(cfg)?;
        tracing::info!(timestamp = ?state.root.timestamp(), "database opened");
        Ok(Self { state })
    }

    /// Read a named root's current pointer value (spec §6.3), `NULL`
    /// if it has never been set.
    pub fn get_root(&self, name: &str) -> Option<Addr> {
        self.state.root.named_root(name)
    }

    /// Set a named root to point at `value`. Visible to other readers
    /// of this `Engine` immediately, but not durable until the next
    /// [`Engine::commit`].
    pub fn set_root(&mut self, name: &str, value: Addr) {
        self.state.root.set_named_root(name, value);
    }

    /// Allocate a cell of `n` words tagged `ty` in the nursery (spec
    /// §4.2). Returns [`Error::NurseryExhausted`] rather than panicking
    /// so the caller can commit and retry (spec §7).
    pub fn alloc(&mut self, n: usize, ty: CellType) -> Result<Addr> {
        if !self.state.nursery.can_allocate(n) {
            return Err(Error::NurseryExhausted);
        }
        Ok(self.state.nursery.allocate(&mut self.state.mem, n, ty))
    }

    pub fn read_word(&self, addr: Addr) -> u32 {
        self.state.mem.read(addr)
    }

    pub fn write_word(&mut self, addr: Addr, value: u32) {
        self.state.mem.write(addr, value);
    }

    /// Allocate a `test_word_ptr` cell: one opaque word plus a
    /// nullable pointer field, used by the CLI and integration tests
    /// (spec §8 scenario 2).
    pub fn alloc_word_ptr(&mut self, value: u32, next: Addr) -> Result<Addr> {
        let addr = self.alloc(3, cell::CELL_TEST_WORD_PTR)?;
        self.write_word(addr + 1, value);
        self.write_word(addr + 2, next);
        Ok(addr)
    }

    pub fn read_word_ptr(&self, addr: Addr) -> (u32, Addr) {
        (self.read_word(addr + 1), self.read_word(addr + 2))
    }

    /// Allocate a `test_pair` cell: two pointer fields, used to build
    /// small (possibly cyclic) reference graphs in tests.
    pub fn alloc_pair(&mut self, a: Addr, b: Addr) -> Result<Addr> {
        let addr = self.alloc(3, cell::CELL_TEST_PAIR)?;
        self.write_word(addr + 1, a);
        self.write_word(addr + 2, b);
        Ok(addr)
    }

    pub fn read_pair(&self, addr: Addr) -> (Addr, Addr) {
        (self.read_word(addr + 1), self.read_word(addr + 2))
    }

    /// `shades_commit`: the group-commit protocol (spec §4.8).
    pub fn commit(&mut self) -> Result<()> {
        commit::group_commit(&mut self.state)
    }

    pub fn config(&self) -> &Config {
        &self.state.cfg
    }

    pub fn timestamp(&self) -> (u32, u32) {
        self.state.root.timestamp()
    }

    /// Number of currently free main-memory pages, mostly useful for
    /// tests and `--show-params`-style diagnostics.
    pub fn free_page_count(&self) -> usize {
        self.state.pages.free_count()
    }

    pub fn free_disk_page_count(&self) -> usize {
        self.state.disk.number_of_free_disk_pages()
    }
}
