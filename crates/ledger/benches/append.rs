use criterion::{criterion_group, criterion_main, Criterion};
use ledger::{EventType, Ledger};
use serde_json::json;

fn bench_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Ledger::open(dir.path().join("bench.jsonl")).expect("open");
    c.bench_function("ledger_append", |b| {
        b.iter(|| {
            ledger
                .append(
                    "bench-session",
                    EventType::ActionEvaluate,
                    json!({"tool": "file:read", "verdict": "allow", "path": "/data/a.txt"}),
                )
                .expect("append")
        })
    });
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
