// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memstone::{
    CasToken, Datatype, DocState, DocStateFilter, Engine, KvEngine, StoreOp, TaskPool,
};

fn bench_engine() -> (Arc<Engine>, Arc<TaskPool>) {
    let tasks = TaskPool::new(1);
    let engine = Engine::from_config_str("cache_size=134217728", Arc::clone(&tasks))
        .expect("bench engine");
    (engine, tasks)
}

/// Benchmark: allocate + set of a 256-byte value.
fn bench_store_set_256b(c: &mut Criterion) {
    let (engine, _tasks) = bench_engine();
    c.bench_function("store_set_256b", |b| {
        let value = [0x5au8; 256];
        b.iter(|| {
            let mut item = engine
                .allocate(black_box(b"bench-key"), value.len(), 0, 0, Datatype::RAW, 0)
                .expect("allocate");
            item.value_mut().copy_from_slice(&value);
            engine
                .store(item, CasToken::Any, StoreOp::Set, DocState::Alive)
                .expect("set")
        })
    });
}

/// Benchmark: hot get of a linked item.
fn bench_get_hit(c: &mut Criterion) {
    let (engine, _tasks) = bench_engine();
    let mut item = engine
        .allocate(b"hot", 64, 0, 0, Datatype::RAW, 0)
        .expect("allocate");
    item.value_mut().copy_from_slice(&[1u8; 64]);
    engine
        .store(item, CasToken::Any, StoreOp::Set, DocState::Alive)
        .expect("seed");
    c.bench_function("get_hit_64b", |b| {
        b.iter(|| {
            engine
                .get(black_box(b"hot"), 0, DocStateFilter::Alive)
                .expect("hit")
        })
    });
}

/// Benchmark: get miss (hash walk only).
fn bench_get_miss(c: &mut Criterion) {
    let (engine, _tasks) = bench_engine();
    c.bench_function("get_miss", |b| {
        b.iter(|| engine.get(black_box(b"absent"), 0, DocStateFilter::Alive).err())
    });
}

criterion_group!(benches, bench_store_set_256b, bench_get_hit, bench_get_miss);
criterion_main!(benches);
