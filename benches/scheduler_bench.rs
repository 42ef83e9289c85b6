//! Benchmarks for the scheduler tick and the wire codec.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use basal_ganglia::config::{MonitorConfig, SchedulerConfig};
use basal_ganglia::core::{
    CortexEndpoint, CortexRegistry, CortexRelayTask, DeviceCache, TaskError, TracingDisplay,
};
use basal_ganglia::transport::codec::{decode_frame, encode_frame};
use basal_ganglia::{
    BasalGanglia, CommandEnvelope, CommunicationTask, ConnectionType, TaskContext, TokioSpawner,
    Transport, TransportError, TransportFactory,
};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

struct NullCortex;

#[async_trait]
impl CortexEndpoint for NullCortex {
    async fn receive(&self, _source: &str, data: Value) -> Result<Value, TaskError> {
        Ok(data)
    }
}

struct Offline;

impl TransportFactory for Offline {
    fn create(&self, kind: ConnectionType) -> Result<Box<dyn Transport>, TransportError> {
        Err(TransportError::UnsupportedConnection(kind.to_string()))
    }
}

fn context(rt: &Runtime) -> TaskContext {
    let cortices = Arc::new(CortexRegistry::new());
    cortices.register("sink", Arc::new(NullCortex));
    TaskContext {
        comm: Arc::new(CommunicationTask::new(Arc::new(Offline), MonitorConfig::default())),
        cache: Arc::new(DeviceCache::new()),
        cortices,
        display: Arc::new(TracingDisplay),
        spawner: TokioSpawner::new(rt.handle().clone()),
    }
}

fn bench_tick(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let ctx = context(&rt);
    let mut group = c.benchmark_group("tick");
    for n in [8_usize, 64, 256] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("relay_tasks", n), &n, |b, &n| {
            b.to_async(&rt).iter(|| {
                let ctx = ctx.clone();
                async move {
                    let scheduler = BasalGanglia::new(
                        SchedulerConfig::default().with_max_tasks(n),
                        ctx,
                    );
                    for i in 0..n {
                        let priority = i32::try_from(i % 7).unwrap_or_default();
                        scheduler
                            .register_task(Arc::new(
                                CortexRelayTask::new("bench", "sink", json!(i)).with_priority(priority),
                            ))
                            .unwrap();
                    }
                    black_box(scheduler.tick_at(Instant::now()).await)
                }
            });
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let cmd = CommandEnvelope::inference("llm.1000", "What is the capital of France?", false);
    let reply = format!(
        "{}\n",
        json!({
            "request_id": cmd.request_id,
            "work_id": cmd.work_id,
            "error": {"code": 0, "message": ""},
            "data": "Paris is the capital of France.",
        })
    );
    let mut group = c.benchmark_group("codec");
    group.bench_function("encode_inference", |b| {
        b.iter(|| black_box(encode_frame(black_box(&cmd)).unwrap()));
    });
    group.bench_function("decode_reply", |b| {
        b.iter(|| black_box(decode_frame(black_box(reply.as_bytes()), &cmd)));
    });
    group.bench_function("decode_garbage", |b| {
        b.iter(|| black_box(decode_frame(black_box(b"<<noise>>\n"), &cmd)));
    });
    group.finish();
}

criterion_group!(benches, bench_tick, bench_codec);
criterion_main!(benches);
