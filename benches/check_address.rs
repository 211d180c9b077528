use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use ipblocker::{BlockRule, IpBlockLayer, IpBlocker};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

// Returns the peer address it was given.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn rule() -> BlockRule {
    BlockRule::builder()
        .count(u64::MAX)
        .duration(Duration::from_secs(60))
        .delay(1_000, Duration::from_millis(1))
        .allow("10.0.0.0/8")
        .build()
        .unwrap()
}

fn check_same_address(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let blocker = IpBlocker::in_memory(rule());

    c.bench_function("check_address_same_ip", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(blocker.check_address(black_box("203.0.113.10")).await);
        });
    });
}

fn check_distinct_addresses(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let blocker = IpBlocker::in_memory(rule());
    let next = AtomicU32::new(0);

    c.bench_function("check_address_distinct_ips", |b| {
        b.to_async(&rt).iter(|| async {
            let n = next.fetch_add(1, Ordering::Relaxed) % 65_536;
            let address = std::net::Ipv4Addr::from(0xC633_0000 | n).into();
            let _ = black_box(blocker.check_ip(address).await);
        });
    });
}

fn check_whitelisted(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let blocker = IpBlocker::in_memory(rule());

    c.bench_function("check_address_whitelisted", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(blocker.check_address(black_box("10.1.2.3")).await);
        });
    });
}

fn middleware_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let rule = BlockRule::new(u64::MAX, Duration::from_secs(60)).unwrap();
    let blocker = Arc::new(IpBlocker::in_memory(rule));
    let layer = IpBlockLayer::new(blocker, |req: &&'static str| Some(req.to_string()));
    let svc = ServiceBuilder::new().layer(layer).service(EchoService);

    c.bench_function("ip_block_layer_round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("198.51.100.7"))).await;
        });
    });
}

criterion_group!(
    benches,
    check_same_address,
    check_distinct_addresses,
    check_whitelisted,
    middleware_round_trip
);
criterion_main!(benches);
