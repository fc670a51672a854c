// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for guard classification.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gatehouse::guard::lexer::lex;
use gatehouse::guard::{Guard, GuardContext, Policy};

fn context() -> GuardContext {
    GuardContext::new("/work/repo.worktrees/feat-auth")
        .in_workspace("/work/repo.worktrees/feat-auth")
        .on_branch("feat/auth")
        .with_home("/home/agent")
}

/// Benchmark classification across verdict kinds.
fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("guard/classify");
    let guard = Guard::new(Policy::default());
    let ctx = context();

    let commands = [
        ("allow", "cargo test --workspace -- --nocapture"),
        ("deny_nuclear", "rm -rf /"),
        ("deny_nested", "bash -c \"echo ok && $(rm -rf ~)\""),
        ("rewrite_force_push", "git push --force origin feat/auth"),
        ("rewrite_tmp", "cargo test > /tmp/out.log"),
        ("confirm", "git reset --hard HEAD~3"),
        ("quoted_literal", "echo \"rm -rf /\""),
    ];

    for (name, command) in commands {
        group.bench_with_input(BenchmarkId::new("command", name), &command, |b, command| {
            b.iter(|| guard.classify(black_box(command), black_box(&ctx)));
        });
    }

    group.finish();
}

/// Benchmark long pipelines to see how evaluation scales with segment count.
fn bench_pipeline_length(c: &mut Criterion) {
    let mut group = c.benchmark_group("guard/pipeline");
    let guard = Guard::new(Policy::default());
    let ctx = context();

    for segments in [1usize, 8, 32, 128] {
        let command = vec!["grep -r pattern src | sort | uniq -c"; segments].join(" && ");
        group.throughput(Throughput::Bytes(command.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(segments), &command, |b, command| {
            b.iter(|| guard.classify(black_box(command), black_box(&ctx)));
        });
    }

    group.finish();
}

/// Benchmark the lexer alone.
fn bench_lexer(c: &mut Criterion) {
    let mut group = c.benchmark_group("guard/lexer");
    let command = r#"FOO=1 git commit -m "fix: handle 'quoted' input" && git push origin "$(git branch --show-current)""#;
    group.throughput(Throughput::Bytes(command.len() as u64));
    group.bench_function("mixed_quoting", |b| {
        b.iter(|| lex(black_box(command)));
    });
    group.finish();
}

criterion_group!(benches, bench_classify, bench_pipeline_length, bench_lexer);
criterion_main!(benches);
