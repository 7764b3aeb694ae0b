//! Benchmarks for handle open/write/close and streaming writes

use bytes::Bytes;
use cloudstore::{AccessMode, OpContext, Store, StoreConfig};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

fn local_store(rt: &tokio::runtime::Runtime, dir: &TempDir) -> Store {
    let config = StoreConfig::local(dir.path().join("root"), dir.path().join("cache"));
    rt.block_on(Store::from_config(&config)).unwrap()
}

fn handle_write_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let store = local_store(&rt, &dir);

    let mut group = c.benchmark_group("handle_write");

    for size in [64 * 1024, 1_000_000, 10_000_000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        let data = vec![0u8; *size];

        group.bench_function(format!("{}KB", size / 1024), |b| {
            b.to_async(&rt).iter(|| async {
                let ctx = OpContext::background();
                let _ = store.delete(&ctx, "bench/handle.bin").await;
                let object = store.new_object(&ctx, "bench/handle.bin").await.unwrap();
                let mut handle = object.open(&ctx, AccessMode::ReadWrite).await.unwrap();
                handle.write_all(&data).await.unwrap();
                handle.close(&ctx).await.unwrap();
            });
        });
    }

    group.finish();
}

fn handle_read_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let store = local_store(&rt, &dir);
    let size = 10_000_000;

    rt.block_on(async {
        let ctx = OpContext::background();
        store
            .put_bytes(&ctx, "bench/read.bin", Bytes::from(vec![1u8; size]))
            .await
            .unwrap();
    });

    let mut group = c.benchmark_group("handle_read");
    group.throughput(Throughput::Bytes(size as u64));

    group.bench_function("open_read_only", |b| {
        b.to_async(&rt).iter(|| async {
            let ctx = OpContext::background();
            let object = store.get(&ctx, "bench/read.bin").await.unwrap();
            let handle = object.open(&ctx, AccessMode::ReadOnly).await.unwrap();
            handle.close(&ctx).await.unwrap();
        });
    });

    group.bench_function("stream_reader", |b| {
        b.to_async(&rt).iter(|| async {
            let ctx = OpContext::background();
            let bytes = store.get_bytes(&ctx, "bench/read.bin").await.unwrap();
            assert_eq!(bytes.len(), size);
        });
    });

    group.finish();
}

criterion_group!(benches, handle_write_benchmark, handle_read_benchmark);
criterion_main!(benches);
