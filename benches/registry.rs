// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for registry writes and lock operations.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use gatehouse::workspace::registry::Registry;
use gatehouse::workspace::{LockManager, Registration};

fn populated(dir: &TempDir, entries: usize) -> Registry {
    let registry = Registry::open(dir.path());
    for i in 0..entries {
        let id = format!("ws-{i}");
        registry
            .register(Registration::new(&id, format!("/work/{id}"), format!("feat/{id}")))
            .unwrap();
    }
    registry
}

/// Benchmark a register (full read-modify-write) at several registry sizes.
fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry/register");

    for size in [0usize, 10, 100, 1000] {
        let dir = TempDir::new().unwrap();
        let registry = populated(&dir, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                registry
                    .register(black_box(Registration::new(
                        "bench",
                        "/work/bench",
                        format!("feat/bench-{i}"),
                    )))
                    .unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark lookups.
fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry/lookup");
    let dir = TempDir::new().unwrap();
    let registry = populated(&dir, 100);

    group.bench_function("hit", |b| {
        b.iter(|| registry.lookup(black_box("ws-50")).unwrap());
    });
    group.bench_function("list", |b| {
        b.iter(|| registry.list().unwrap());
    });

    group.finish();
}

/// Benchmark lock acquire/release cycles.
fn bench_lock_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry/lock");
    let dir = TempDir::new().unwrap();
    let locks = LockManager::new(dir.path().join("locks"), Duration::from_secs(86_400));

    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            locks.acquire(black_box("feat-auth"), "s1").unwrap();
            locks.release("feat-auth", "s1").unwrap();
        });
    });
    locks.acquire("held", "s1").unwrap();
    group.bench_function("heartbeat", |b| {
        b.iter(|| locks.heartbeat(black_box("held"), "s1").unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_register, bench_lookup, bench_lock_cycle);
criterion_main!(benches);
