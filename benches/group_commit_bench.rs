//! Group-commit throughput benchmarks: one `criterion_group!`/
//! `criterion_main!` pair per concern.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use shades::{Config, Engine};
use tempfile::tempdir;

fn make_config(dir: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.disk_filename = vec![dir.join("bench.db")];
    cfg.disk_filesize = vec![16 * 1024 * 1024];
    cfg.db_size = 8 * 1024 * 1024;
    cfg.first_generation_size = 64 * 1024;
    cfg
}

/// Commit a full nursery's worth of `test_word_ptr` cells, repeatedly.
fn bench_group_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_commit");
    for &cells_per_commit in &[64usize, 512, 2048] {
        group.bench_with_input(
            BenchmarkId::from_parameter(cells_per_commit),
            &cells_per_commit,
            |b, &cells_per_commit| {
                let dir = tempdir().unwrap();
                let cfg = make_config(dir.path());
                let mut engine = Engine::create(cfg).unwrap();
                let mut value = 0u32;
                b.iter(|| {
                    let mut head = engine.get_root("test1").unwrap_or(0);
                    for _ in 0..cells_per_commit {
                        match engine.alloc_word_ptr(value, head) {
                            Ok(addr) => {
                                head = addr;
                                value = value.wrapping_add(1);
                            }
                            Err(_) => break,
                        }
                    }
                    engine.set_root("test1", head);
                    engine.commit().unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Commit enough generations to trigger at least one major GC round,
/// to measure its incremental cost on top of an ordinary commit.
fn bench_commit_with_major_gc(c: &mut Criterion) {
    c.bench_function("commit_with_major_gc", |b| {
        let dir = tempdir().unwrap();
        let mut cfg = make_config(dir.path());
        cfg.start_gc_limit = 4;
        let mut engine = Engine::create(cfg).unwrap();
        let mut value = 0u32;
        b.iter(|| {
            let mut head = engine.get_root("test1").unwrap_or(0);
            for _ in 0..128 {
                match engine.alloc_word_ptr(value, head) {
                    Ok(addr) => {
                        head = addr;
                        value = value.wrapping_add(1);
                    }
                    Err(_) => break,
                }
            }
            engine.set_root("test1", head);
            engine.commit().unwrap();
        });
    });
}

criterion_group!(benches, bench_group_commit, bench_commit_with_major_gc);
criterion_main!(benches);
