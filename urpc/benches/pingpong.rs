//! Benchmark for ping/ACK round trip latency.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::thread;
use std::time::Duration;
use urpc::{Config, DmaEngine, Peer, SoftDma, protocol};
use uuid::Uuid;

fn pin_to_core(core_id: usize) {
    core_affinity::set_for_current(core_affinity::CoreId { id: core_id });
}

const TIMEOUT: Duration = Duration::from_secs(5);

fn bench_ping_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("urpc_ping");
    group.throughput(Throughput::Elements(1));

    for staged in [false, true] {
        let label = if staged { "staged" } else { "direct" };
        group.bench_function(label, |b| {
            let name = format!("/urpc_bench_{}", Uuid::now_v7());
            let config = Config::new().with_shm_name(name).with_comm_size(4 << 20);
            let mut host = Peer::host(config.clone()).unwrap();
            let acc_config = config.with_core(30);
            let acc = thread::spawn(move || {
                let dma = staged.then(|| Box::new(unsafe { SoftDma::new(32) }) as Box<dyn DmaEngine>);
                let mut acc = Peer::accelerator(acc_config, dma).unwrap();
                protocol::install_defaults(&mut acc).unwrap();
                acc.serve().unwrap();
            });
            host.wait_attached().unwrap();
            pin_to_core(31);
            for _ in 0..1000 {
                let req = protocol::send_ping(&mut host).unwrap();
                protocol::wait_ack(&mut host, req, TIMEOUT).unwrap();
            }
            b.iter(|| {
                let req = protocol::send_ping(&mut host).unwrap();
                protocol::wait_ack(&mut host, black_box(req), TIMEOUT).unwrap();
            });
            let req = protocol::send_exit(&mut host).unwrap();
            protocol::wait_ack(&mut host, req, TIMEOUT).unwrap();
            acc.join().unwrap();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ping_latency);
criterion_main!(benches);
