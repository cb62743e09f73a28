use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use surveyline_core::TenantId;
use surveyline_infra::jobs::{InMemoryJobStore, JobSource, JobStore, NewJob};
use surveyline_infra::webhooks::{SignatureVerifier, parse_webhook};

fn batch_body(size: usize) -> Vec<u8> {
    let items: Vec<_> = (0..size)
        .map(|i| {
            serde_json::json!({
                "phone_number_id": "pn-1",
                "message": {
                    "id": format!("wamid.{i}"),
                    "type": "text",
                    "from": "5511999999999",
                    "text": { "body": "10" },
                    "kapso": { "direction": "inbound" }
                }
            })
        })
        .collect();
    serde_json::json!({ "data": items }).to_string().into_bytes()
}

fn bench_signature_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_verification");
    let verifier = SignatureVerifier::new("bench-secret");

    for size in [1usize, 10, 100].iter() {
        let body = batch_body(*size);
        let signature = verifier.sign(&body);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| verifier.verify(black_box(body), Some(&signature)).unwrap());
        });
    }
    group.finish();
}

fn bench_payload_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_parsing");

    for size in [1usize, 10, 100].iter() {
        let body = batch_body(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| parse_webhook(black_box(body)).unwrap());
        });
    }
    group.finish();
}

fn bench_enqueue_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_queue");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("enqueue_acquire_complete", |b| {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let mut n: u64 = 0;
        b.iter(|| {
            n += 1;
            runtime.block_on(async {
                store
                    .enqueue(NewJob::new(
                        tenant,
                        format!("kapso:bench-{n}"),
                        JobSource::Webhook,
                        "kapso.message.received",
                        serde_json::json!({}),
                    ))
                    .await
                    .unwrap();
                let job = store.acquire().await.unwrap().unwrap();
                store.complete(job.id).await.unwrap();
            });
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_signature_verification,
    bench_payload_parsing,
    bench_enqueue_acquire
);
criterion_main!(benches);
