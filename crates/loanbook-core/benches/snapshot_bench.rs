use criterion::{criterion_group, criterion_main, Criterion};
use loanbook_core::validate_snapshot;
use serde_json::{json, Value};

fn mk_snapshot(records: usize) -> Value {
    let elements = (0..records)
        .map(|index| {
            json!({
                "id": index,
                "name": format!("client-{index}"),
                "loan": format!("{}.50", 100 + index),
                "repaid": index % 7,
                "created_at": "2025-06-01T00:00:00Z",
                "email": format!("client-{index}@example.com"),
                "phone": null
            })
        })
        .collect::<Vec<_>>();
    Value::Array(elements)
}

fn bench_snapshot_validation(c: &mut Criterion) {
    let snapshot = mk_snapshot(10_000);
    c.bench_function("validate_snapshot_10k", |b| {
        b.iter(|| match validate_snapshot(&snapshot) {
            Ok(candidates) => candidates.len(),
            Err(err) => panic!("snapshot should validate: {err}"),
        });
    });
}

criterion_group!(benches, bench_snapshot_validation);
criterion_main!(benches);
