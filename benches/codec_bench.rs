use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crawl_session::keys::SessionKeys;
use crawl_session::models::SessionMeta;
use crawl_session::{UrlState, UrlStatus};
use std::collections::HashMap;

// Metadata decode runs on every get_meta/is_valid round trip
fn bench_meta_decode(c: &mut Criterion) {
    let mut meta = SessionMeta::initial("hint-42", "https://example.com/");
    meta.total_tasks = 123_456;
    meta.complete_tasks = 100_000;
    let fields: HashMap<String, String> = meta
        .to_fields()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

    c.bench_function("meta_from_fields", |b| {
        b.iter(|| black_box(SessionMeta::from_fields(black_box(&fields)).unwrap()))
    });
}

// URL state JSON size grows with worker id length
fn bench_url_state_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_state");

    for worker_len in [0usize, 16, 64] {
        let state = UrlState::new(UrlStatus::InProgress).with_worker("w".repeat(worker_len));
        let encoded = state.to_json().unwrap();

        group.bench_with_input(BenchmarkId::new("encode", worker_len), &state, |b, state| {
            b.iter(|| black_box(state.to_json().unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", worker_len), &encoded, |b, raw| {
            b.iter(|| black_box(UrlState::from_json(raw).unwrap()))
        });
    }

    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    c.bench_function("session_keys", |b| {
        b.iter(|| black_box(SessionKeys::new(black_box("0f4c2a9e8b7d41c3a5e6f7081928374a"))))
    });
}

criterion_group!(benches, bench_meta_decode, bench_url_state_codec, bench_key_derivation);
criterion_main!(benches);
