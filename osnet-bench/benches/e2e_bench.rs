//! End-to-end client-server benchmarks over loopback TCP.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use osnet_client::{Client, ConnectionConfig};
use osnet_protocol::OpenMode;
use osnet_server::{Server, ServerConfig, StreamRegistry, StreamsConfig};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

struct TestSetup {
    _server_handle: tokio::task::JoinHandle<()>,
    client: Client,
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    let registry = Arc::new(StreamRegistry::new(StreamsConfig::default()));
    let server = Arc::new(Server::new(ServerConfig::default(), registry));

    rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = server.clone();
        let server_handle = tokio::spawn(async move {
            let _ = serving.run_on(listener).await;
        });

        let config = ConnectionConfig::new(addr).with_client_name("bench");
        let client = Client::connect(config).await.unwrap();

        TestSetup {
            _server_handle: server_handle,
            client,
        }
    })
}

fn bench_ping_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.ping().await.unwrap()) });
    });

    group.finish();
}

fn bench_concurrent_requests(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_concurrent");
    group.sample_size(20);

    for concurrency in [1, 10, 50] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("pings", concurrency),
            &concurrency,
            |b, &conc| {
                b.to_async(&rt).iter(|| {
                    let client = &setup.client;
                    async move {
                        let futures: Vec<_> = (0..conc).map(|_| client.ping()).collect();
                        black_box(futures::future::join_all(futures).await)
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_stream_read(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_stream_read");

    for size in [1024usize, 16 * 1024, 64 * 1024] {
        let mut stream = rt.block_on(async {
            let mut stream = setup
                .client
                .open_stream("scratch:", OpenMode::ReadWrite)
                .await
                .unwrap();
            stream.write_all(Bytes::from(vec![7u8; size])).await.unwrap();
            stream
        });

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                rt.block_on(async {
                    stream.seek(SeekFrom::Start(0)).await.unwrap();
                    black_box(stream.read(size).await.unwrap())
                })
            });
        });

        rt.block_on(stream.close()).unwrap();
    }

    group.finish();
}

fn bench_stream_write(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_stream_write");

    for size in [1024usize, 16 * 1024, 64 * 1024] {
        let data = Bytes::from(vec![9u8; size]);
        let mut stream = rt.block_on(
            setup
                .client
                .open_stream("scratch:", OpenMode::ReadWrite),
        )
        .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                rt.block_on(async {
                    stream.seek(SeekFrom::Start(0)).await.unwrap();
                    black_box(stream.write(data.clone()).await.unwrap())
                })
            });
        });

        rt.block_on(stream.close()).unwrap();
    }

    group.finish();
}

fn bench_roundtrip_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_latency");

    group.bench_function("info", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.info().await.unwrap()) });
    });

    group.bench_function("stream_test_open_close", |b| {
        b.to_async(&rt).iter(|| async {
            let mut stream = setup.client.stream_test().await.unwrap();
            stream.close().await.unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_ping_latency,
    bench_concurrent_requests,
    bench_stream_read,
    bench_stream_write,
    bench_roundtrip_latency,
);

criterion_main!(benches);
