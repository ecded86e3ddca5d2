//! Benchmarks for siteindex lookup performance.
//!
//! Run with: cargo bench
//!
//! This benchmark suite measures:
//! - Domain lookup throughput against catalogs of different sizes
//! - Block-pattern tests with and without memoized results
//! - Header rewriting
//! - Index build time

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use siteindex::{ConfigEntry, DomainIndex, EngineConfig, PatternCache, SiteEngine};
use std::sync::Arc;

/// Generate a catalog with `count` sites, every third with a block pattern.
fn generate_catalog(count: usize) -> Vec<ConfigEntry> {
    (0..count)
        .map(|i| {
            let entry = ConfigEntry::new(format!("site{}", i), format!("site{}.example.com", i));
            match i % 3 {
                0 => entry.with_block_pattern(&format!(r"\.tracker{}\.net/", i)),
                1 => entry.with_referer("google").with_random_origin(),
                _ => entry,
            }
        })
        .collect()
}

/// Generate lookups - mix of hits and misses.
fn generate_queries(count: usize, hit_ratio: f64, catalog_size: usize) -> Vec<String> {
    let hits = (count as f64 * hit_ratio) as usize;
    (0..count)
        .map(|i| {
            if i < hits {
                format!("site{}.example.com", i % catalog_size)
            } else {
                format!("unknown{}.nonexistent.org", i)
            }
        })
        .collect()
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for size in [100, 1_000, 10_000].iter() {
        let index = DomainIndex::new(Arc::new(PatternCache::default()));
        index.build(generate_catalog(*size));
        let queries = generate_queries(1000, 0.8, *size);

        group.throughput(Throughput::Elements(queries.len() as u64));
        group.bench_with_input(BenchmarkId::new("sites", size), size, |b, _| {
            b.iter(|| {
                for query in &queries {
                    black_box(index.lookup(query));
                }
            })
        });
    }

    group.finish();
}

fn bench_should_block(c: &mut Criterion) {
    let urls: Vec<String> = (0..300)
        .map(|i| format!("https://cdn.tracker{}.net/pixel?id={}", i % 30, i))
        .collect();

    let mut group = c.benchmark_group("should_block");
    group.throughput(Throughput::Elements(urls.len() as u64));

    let cold = DomainIndex::new(Arc::new(PatternCache::new(0)));
    cold.build(generate_catalog(1_000));
    group.bench_function("no_memo", |b| {
        b.iter(|| {
            for url in &urls {
                black_box(cold.should_block("site0.example.com", url));
            }
        })
    });

    let warm = DomainIndex::new(Arc::new(PatternCache::new(10_000)));
    warm.build(generate_catalog(1_000));
    for url in &urls {
        warm.should_block("site0.example.com", url);
    }
    group.bench_function("memoized", |b| {
        b.iter(|| {
            for url in &urls {
                black_box(warm.should_block("site0.example.com", url));
            }
        })
    });

    group.finish();
}

fn bench_apply_headers(c: &mut Criterion) {
    let engine = SiteEngine::with_catalog(EngineConfig::default(), generate_catalog(1_000));
    let headers = vec![
        ("User-Agent".to_string(), "Mozilla/5.0".to_string()),
        ("Accept".to_string(), "*/*".to_string()),
        ("Referer".to_string(), "https://site1.example.com/".to_string()),
    ];

    c.bench_function("apply_headers", |b| {
        b.iter(|| black_box(engine.apply_headers("site1.example.com", &headers)))
    });
}

fn bench_build(c: &mut Criterion) {
    let catalog = generate_catalog(1_000);

    c.bench_function("build_1000", |b| {
        b.iter_batched(
            || catalog.clone(),
            |entries| {
                let index = DomainIndex::new(Arc::new(PatternCache::default()));
                index.build(entries);
                black_box(index.len())
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_lookup,
    bench_should_block,
    bench_apply_headers,
    bench_build
);
criterion_main!(benches);
