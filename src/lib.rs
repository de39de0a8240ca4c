//! Shades: a main-memory, recoverable, shadow-paging database engine.
//!
//! The public surface is deliberately small: [`Config`] describes a
//! database, [`Engine::create`]/[`Engine::open`] build or recover one,
//! and the handful of methods on [`Engine`] are everything a mutator
//! needs — allocate cells in the nursery, read/write named roots, and
//! [`Engine::commit`] to make a batch of mutations durable (spec §1,
//! §9 "Global mutable state"). Everything else — the nursery, the
//! copying collector, the generation manager, the disk and async I/O
//! layers — is internal machinery, not part of the crate's API.

pub mod cell;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod word;

pub(crate) mod asyncio;
pub(crate) mod commit;
pub(crate) mod disk;
pub(crate) mod gc;
pub(crate) mod generation;
pub(crate) mod nursery;
pub(crate) mod page;
pub(crate) mod recovery;
pub(crate) mod remset;
pub(crate) mod rootblock;
pub(crate) mod rootlocate;

pub use cell::CellType;
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use memory::Addr;

/// Crate version, echoed by the CLI's `--show-params` output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
