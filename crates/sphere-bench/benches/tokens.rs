//! Token issuance, verification and rotation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sphere_bench::token_fixture;
use tokio::runtime::Runtime;

fn bench_verify_access(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (tokens, id) = rt.block_on(token_fixture());
    let pair = rt.block_on(tokens.issue(id)).unwrap();

    c.bench_function("verify_access", |b| {
        b.iter(|| tokens.verify_access(black_box(&pair.access_token)).unwrap());
    });
}

fn bench_issue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (tokens, id) = rt.block_on(token_fixture());

    c.bench_function("issue", |b| {
        b.iter(|| rt.block_on(tokens.issue(black_box(id))).unwrap());
    });
}

/// Each iteration consumes the current refresh token and keeps the new one.
fn bench_rotate(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (tokens, id) = rt.block_on(token_fixture());
    let mut current = rt.block_on(tokens.issue(id)).unwrap().refresh_token;

    c.bench_function("rotate", |b| {
        b.iter(|| {
            let pair = rt.block_on(tokens.rotate(&current)).unwrap();
            current = pair.refresh_token;
        });
    });
}

criterion_group!(benches, bench_verify_access, bench_issue, bench_rotate);
criterion_main!(benches);
