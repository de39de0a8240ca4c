//! Configuration surface (spec §6.2).
//!
//! Mirrors the original's `params.h` three-tier precedence — resource
//! file, then environment, then CLI flags — simplified to a from-scratch
//! Rust loader (TOML file -> `SHADES_`-prefixed env vars -> values an
//! embedder sets directly on the struct before `Engine::create`/`open`),
//! since this crate is not a transliteration of `params.c`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Where the root block is written (spec §4.11, original `io.c`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootPlacement {
    /// The root always lives at the last page of a designated file.
    FixedLocation,
    /// The root is written like any other page, at a free disk page,
    /// and located on open via the binary-search-with-probes algorithm.
    FreeSlot,
}

/// Async I/O backend selection (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Synchronous lseek+write/read, returns only after completion.
    Sync,
    /// One reader and one writer thread per file, FIFO queues.
    ThreadPool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub disk_filename: Vec<PathBuf>,
    /// Parallel to `disk_filename`; `0` inherits the previous entry's
    /// size, a missing entry also inherits the previous (spec §6.2).
    pub disk_filesize: Vec<u64>,
    pub disk_skip_nbytes: u64,
    pub disk_file_permissions: u32,
    pub disk_file_group: Option<String>,

    /// Bytes of the main-memory page region.
    pub db_size: u64,
    /// Bytes of the nursery.
    pub first_generation_size: u64,
    /// Bytes per page; `db_size / page_size` gives the page count.
    pub page_size: u64,
    /// Pages per generation, bounded by root-block capacity
    /// (`MaxGenSize`, spec §6.1).
    pub max_generation_size: usize,
    /// Maximum number of live mature generations tracked at once.
    pub max_generations: usize,

    pub relative_mature_generation_size: f64,
    pub start_gc_limit: u64,
    pub max_gc_limit: u64,
    pub max_gc_effort: u64,
    pub allow_additional_generationality: bool,
    pub generation_shrinkage_margin: f64,

    pub rem_sets_per_malloc: usize,

    pub root_placement: RootPlacement,
    pub io_mode: IoMode,
    /// When true, `io_write_page` picks the least-loaded file among
    /// those with >=2 free pages; when false, plain round-robin.
    pub load_balance: bool,

    pub be_verbose: bool,
    pub must_show_groups: bool,
    pub root_search_is_verbose: bool,
    pub root_timestamp_is_displayed: bool,
    pub file_load_is_displayed: bool,
    pub file_usage_is_displayed: bool,
    pub pthread_io_is_verbose: bool,

    /// Debug mode: red zones in the nursery, DEADBEEF poisoning, etc.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            disk_filename: vec![PathBuf::from("shades.db")],
            disk_filesize: vec![64 * 4096],
            disk_skip_nbytes: 0,
            disk_file_permissions: 0o644,
            disk_file_group: None,

            db_size: 64 * 4096,
            first_generation_size: 16 * 1024,
            page_size: 4096,
            max_generation_size: 64,
            max_generations: 64,

            relative_mature_generation_size: 0.5,
            start_gc_limit: 0,
            max_gc_limit: 0,
            max_gc_effort: u64::MAX,
            allow_additional_generationality: true,
            generation_shrinkage_margin: 0.1,

            rem_sets_per_malloc: 16,

            root_placement: RootPlacement::FreeSlot,
            io_mode: IoMode::Sync,
            load_balance: true,

            be_verbose: false,
            must_show_groups: false,
            root_search_is_verbose: false,
            root_timestamp_is_displayed: false,
            file_load_is_displayed: false,
            file_usage_is_displayed: false,
            pthread_io_is_verbose: false,

            debug: cfg!(debug_assertions),
        }
    }
}

impl Config {
    pub fn page_words(&self) -> usize {
        (self.page_size / 4) as usize
    }

    pub fn num_pages(&self) -> usize {
        (self.db_size / self.page_size) as usize
    }

    pub fn nursery_words(&self) -> usize {
        (self.first_generation_size / 4) as usize
    }

    /// Resolve the final size of each backing file in bytes, applying
    /// the "0 or missing inherits the previous" rule (spec §6.2).
    pub fn resolved_filesizes(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.disk_filename.len());
        let mut prev = 0u64;
        for i in 0..self.disk_filename.len() {
            let size = self.disk_filesize.get(i).copied().unwrap_or(0);
            let resolved = if size == 0 { prev } else { size };
            out.push(resolved);
            prev = resolved;
        }
        out
    }

    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .map_err(|e| Error::FileOpen { path: p.display().to_string(), source: e })?;
                toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?
            }
            None => Config::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `SHADES_`-prefixed environment overrides, taking
    /// precedence over the resource file (spec §6.2, `params.h`).
    fn apply_env_overrides(&mut self) -> Result<()> {
        macro_rules! env_bytes {
            ($name:literal, $field:expr) => {
                if let Ok(v) = std::env::var(concat!("SHADES_", $name)) {
                    $field = parse_byte_size(&v)?;
                }
            };
        }
        macro_rules! env_bool {
            ($name:literal, $field:expr) => {
                if let Ok(v) = std::env::var(concat!("SHADES_", $name)) {
                    $field = parse_bool(&v)?;
                }
            };
        }
        env_bytes!("DB_SIZE", self.db_size);
        env_bytes!("FIRST_GENERATION_SIZE", self.first_generation_size);
        env_bytes!("DISK_SKIP_NBYTES", self.disk_skip_nbytes);
        env_bool!("BE_VERBOSE", self.be_verbose);
        env_bool!("ROOT_SEARCH_IS_VERBOSE", self.root_search_is_verbose);
        env_bool!("PTHREAD_IO_IS_VERBOSE", self.pthread_io_is_verbose);
        if let Ok(v) = std::env::var("SHADES_DISK_FILENAME") {
            self.disk_filename = v.split(',').map(PathBuf::from).collect();
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.disk_filename.is_empty() {
            return Err(Error::Config("disk_filename must name at least one file".into()));
        }
        if self.page_size % 4 != 0 || self.page_size == 0 {
            return Err(Error::Config("page_size must be a nonzero multiple of 4".into()));
        }
        if self.db_size % self.page_size != 0 {
            return Err(Error::Config("db_size must be a multiple of page_size".into()));
        }
        if !(0.0..=1.0).contains(&self.relative_mature_generation_size)
            || self.relative_mature_generation_size <= 0.0
        {
            return Err(Error::Config(
                "relative_mature_generation_size must be in (0, 1]".into(),
            ));
        }
        if self.disk_skip_nbytes % crate::disk::DISK_BLOCK_SIZE as u64 != 0 {
            return Err(Error::Config(
                "disk_skip_nbytes must be a multiple of the disk block size".into(),
            ));
        }
        if crate::rootblock::RootBlock::word_count(self.max_generation_size) > self.page_words() {
            return Err(Error::Config(
                "max_generation_size makes the root block wider than one page".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a byte-size value accepting `k`/`M`/`G` suffixes and `0x` hex,
/// per `params.h`'s documented grammar (power-of-two exponent syntax
/// like `2^20` is dropped — see DESIGN.md).
pub fn parse_byte_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_err(|_| Error::Config(format!("bad hex size {s:?}")));
    }
    let (digits, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * mult)
        .map_err(|_| Error::Config(format!("bad size value {s:?}")))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("bad boolean value {s:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_suffixes() {
        assert_eq!(parse_byte_size("10").unwrap(), 10);
        assert_eq!(parse_byte_size("4k").unwrap(), 4096);
        assert_eq!(parse_byte_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_byte_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("0x100").unwrap(), 256);
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn resolved_filesizes_inherit_previous() {
        let mut cfg = Config::default();
        cfg.disk_filename = vec!["a".into(), "b".into(), "c".into()];
        cfg.disk_filesize = vec![4096, 0, 8192];
        assert_eq!(cfg.resolved_filesizes(), vec![4096, 4096, 8192]);
    }
}
