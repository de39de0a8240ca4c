//! `shades` — the CLI test driver for the storage engine (spec §6.3).
//!
//! Two subcommands: `create` initializes a fresh database from a
//! configuration and exits; `run` opens (recovering if necessary) an
//! existing one, drives a synthetic workload until the nursery has
//! cycled a requested number of times or a time limit elapses, commits,
//! and exits. Exit code 0 on clean termination, nonzero with a
//! diagnostic on any fatal error (spec §7).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use shades::{Config, Engine};

struct Args {
    command: String,
    config: Option<PathBuf>,
    show_params: bool,
    commits: u64,
    time_limit: Option<Duration>,
}

fn usage() -> ! {
    eprintln!(
        "usage: shades <create|run> [--config FILE] [--show-params] \
         [--commits N] [--time-limit SECS]"
    );
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut argv = std::env::args().skip(1);
    let command = argv.next().unwrap_or_else(|| usage());
    if command != "create" && command != "run" {
        usage();
    }
    let mut config = None;
    let mut show_params = false;
    let mut commits = 1u64;
    let mut time_limit = None;
    while let Some(flag) = argv.next() {
        match flag.as_str() {
            "--config" => config = Some(PathBuf::from(argv.next().unwrap_or_else(|| usage()))),
            "--show-params" => show_params = true,
            "--commits" => {
                commits = argv
                    .next()
                    .unwrap_or_else(|| usage())
                    .parse()
                    .unwrap_or_else(|_| usage());
            }
            "--time-limit" => {
                let secs: u64 = argv
                    .next()
                    .unwrap_or_else(|| usage())
                    .parse()
                    .unwrap_or_else(|_| usage());
                time_limit = Some(Duration::from_secs(secs));
            }
            other => {
                eprintln!("shades: unrecognized flag {other:?}");
                usage();
            }
        }
    }
    Args { command, config, show_params, commits, time_limit }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let args = parse_args();
    let cfg = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("shades: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.show_params {
        print_params(&cfg);
    }

    let result = match args.command.as_str() {
        "create" => run_create(cfg),
        "run" => run_workload(cfg, args.commits, args.time_limit),
        _ => unreachable!("validated in parse_args"),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("shades: fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_params(cfg: &Config) {
    tracing::info!(version = shades::VERSION, "shades resolved parameters");
    tracing::info!(
        disk_filename = ?cfg.disk_filename,
        db_size = cfg.db_size,
        first_generation_size = cfg.first_generation_size,
        page_size = cfg.page_size,
        max_generation_size = cfg.max_generation_size,
        io_mode = ?cfg.io_mode,
        root_placement = ?cfg.root_placement,
        load_balance = cfg.load_balance,
        start_gc_limit = cfg.start_gc_limit,
        "config"
    );
    tracing::info!(
        be_verbose = cfg.be_verbose,
        must_show_groups = cfg.must_show_groups,
        root_search_is_verbose = cfg.root_search_is_verbose,
        root_timestamp_is_displayed = cfg.root_timestamp_is_displayed,
        file_load_is_displayed = cfg.file_load_is_displayed,
        file_usage_is_displayed = cfg.file_usage_is_displayed,
        pthread_io_is_verbose = cfg.pthread_io_is_verbose,
        "config: observability flags"
    );
}

/// `create`: build a brand-new database and exit.
fn run_create(cfg: Config) -> shades::Result<()> {
    let engine = Engine::create(cfg)?;
    println!(
        "created database: {} free disk pages, timestamp {:?}",
        engine.free_disk_page_count(),
        engine.timestamp()
    );
    Ok(())
}

/// `run`: open (recovering if necessary), drive a synthetic workload
/// for `commits` group-commit rounds or until `time_limit` elapses,
/// whichever comes first, then exit.
fn run_workload(cfg: Config, commits: u64, time_limit: Option<Duration>) -> shades::Result<()> {
    let mut engine = Engine::open(cfg)?;
    let start = Instant::now();
    let mut round = 0u64;
    let mut value = 0u32;

    loop {
        if round >= commits {
            break;
        }
        if let Some(limit) = time_limit {
            if start.elapsed() >= limit {
                break;
            }
        }

        let mut head = engine.get_root("test1").unwrap_or(0);
        loop {
            match engine.alloc_word_ptr(value, head) {
                Ok(addr) => {
                    head = addr;
                    value = value.wrapping_add(1);
                }
                Err(shades::Error::NurseryExhausted) => break,
                Err(e) => return Err(e),
            }
        }
        engine.set_root("test1", head);
        engine.commit()?;
        round += 1;
        tracing::debug!(round, timestamp = ?engine.timestamp(), "committed");
    }

    println!(
        "ran {round} commit(s); final timestamp {:?}; {} free pages, {} free disk pages",
        engine.timestamp(),
        engine.free_page_count(),
        engine.free_disk_page_count()
    );
    Ok(())
}
