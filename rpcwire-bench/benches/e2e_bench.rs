//! End-to-end client-server benchmarks.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rpcwire_client::{Client, ConnectionConfig};
use rpcwire_protocol::{binary, JsonProtocol, Metadata, Protocol, Request};
use rpcwire_server::{Handler, ResponseWriter, Server, ServerConfig};
use std::sync::Arc;
use tokio::runtime::Runtime;

const PROTOCOL: &str = r#"{"protocol":"Bench","messages":{"echo":{"request":[{"name":"data","type":"bytes"}],"response":"bytes"}}}"#;

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn serve(&self, w: &mut ResponseWriter, mut req: Request) {
        if let Some(body) = req.body.take() {
            w.write(&body);
        }
    }
}

struct TestSetup {
    _server: Arc<Server>,
    client: Client,
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    let protocol: Arc<dyn Protocol> = Arc::new(JsonProtocol::parse(PROTOCOL).unwrap());

    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(Server::new(
            ServerConfig::new(addr),
            protocol.clone(),
            Arc::new(EchoHandler),
        ));
        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });

        let client = Client::new(ConnectionConfig::new(addr), protocol);
        client.connect().await.unwrap();
        // Negotiate up front so the handshake is not measured
        client.ping().await.unwrap();

        TestSetup {
            _server: server,
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

fn bench_echo_call(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_echo");

    for size in [100, 1000, 10000, 100000] {
        let mut buf = BytesMut::new();
        binary::put_bytes(&mut buf, &vec![0x42u8; size]);
        let payload: Bytes = buf.freeze();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    setup
                        .client
                        .call("echo", payload.clone(), Metadata::new())
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ping_latency, bench_echo_call);

criterion_main!(benches);
