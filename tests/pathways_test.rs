//! End-to-end behaviour of the SynapticPathways façade over a scripted device.

mod common;

use std::sync::Arc;
use std::time::Duration;

use basal_ganglia::config::PathwaysConfig;
use basal_ganglia::{
    CommandEnvelope, ConnectionType, PathwaysBuilder, SynapticPathways,
};
use common::{healthy_device, RecordingCortex, ScriptedFactory, Wire};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;

fn config() -> PathwaysConfig {
    let mut config = PathwaysConfig::default();
    config.scheduler.tick_interval_ms = 5;
    config.scheduler.wait.think_timeout_secs = 5;
    config.scheduler.wait.task_timeout_ms = 2_000;
    config.device.connection.fallback = vec![ConnectionType::Adb, ConnectionType::Serial];
    config.device.connection.max_fallback_attempts = 2;
    config
}

fn pathways(factory: ScriptedFactory) -> (Arc<SynapticPathways>, Arc<Wire>) {
    let wire = Arc::clone(&factory.wire);
    let pathways = PathwaysBuilder::new(config())
        .with_transport_factory(Arc::new(factory))
        .build()
        .unwrap();
    (pathways, wire)
}

#[tokio::test]
async fn cold_start_think_and_shutdown() {
    let (p, _) = pathways(ScriptedFactory::new(healthy_device("hi")));
    assert!(p.initialize_default().await);
    assert!(p.is_initialized());
    assert_eq!(p.connection_type(), Some(ConnectionType::Tcp));

    let answer = p.think("hello", false).await;
    assert_eq!(answer, json!("hi"));

    let health = p.status();
    assert!(health.ok);
    assert_eq!(health.endpoint.as_deref(), Some("fake-tcp"));
    let kinds: Vec<&str> = p.task_statuses().iter().map(|t| t.kind).collect();
    assert!(kinds.contains(&"communication"));
    assert!(kinds.contains(&"hardware_info"));
    assert!(kinds.contains(&"model_management"));

    p.final_shutdown().await;
    assert!(!p.is_connected());
    let ticks = p.basal_ganglia().ticks();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(p.basal_ganglia().ticks(), ticks);
}

#[tokio::test]
async fn failed_transport_falls_back_in_policy_order() {
    let factory = ScriptedFactory::new(healthy_device("hi"));
    factory.refuse(ConnectionType::Tcp);
    factory.refuse(ConnectionType::Adb);
    let (p, wire) = pathways(factory);

    assert!(p.initialize(ConnectionType::Tcp).await);
    assert_eq!(p.connection_type(), Some(ConnectionType::Serial));
    assert_eq!(wire.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    p.final_shutdown().await;
}

#[tokio::test]
async fn unknown_transport_name_is_rejected() {
    let (p, _) = pathways(ScriptedFactory::new(healthy_device("hi")));
    assert!(!p.initialize_named("bluetooth").await);
    assert!(!p.is_initialized());
    assert!(p.initialize_named("wifi").await);
    p.final_shutdown().await;
}

#[tokio::test]
async fn cleanup_and_shutdown_are_idempotent() {
    let (p, _) = pathways(ScriptedFactory::new(healthy_device("hi")));
    assert!(p.initialize_default().await);

    p.cleanup().await;
    p.cleanup().await;
    assert!(!p.is_initialized());
    assert!(!p.is_connected());

    // A cleaned-up façade can reconnect.
    assert!(p.initialize_default().await);

    p.final_shutdown().await;
    p.final_shutdown().await;
    assert!(!p.initialize_default().await);
    assert!(p.basal_ganglia().is_shut_down());
}

#[tokio::test]
async fn concurrent_commands_never_interleave_on_the_wire() {
    let factory = ScriptedFactory::new(healthy_device("hi")).with_latency(Duration::from_millis(3));
    let (p, wire) = pathways(factory);
    assert!(p.initialize(ConnectionType::Serial).await);

    let calls = (0..8).map(|_| {
        let p = Arc::clone(&p);
        async move { p.send_command(&CommandEnvelope::ping()).await }
    });
    let replies = join_all(calls).await;
    assert!(replies.iter().all(|r| r.is_success()));
    assert!(!wire.overlapped.load(std::sync::atomic::Ordering::SeqCst));
    p.final_shutdown().await;
}

#[tokio::test]
async fn device_queries_update_the_cache() {
    let (p, _) = pathways(ScriptedFactory::new(healthy_device("hi")));
    assert!(p.initialize_default().await);

    let hw = p.refresh_hardware_info().await;
    assert_eq!(hw.temperature, Some(51.5));
    assert!(p.format_hw_info().contains("Temp: 51.5"));

    let models = p.refresh_models().await;
    assert_eq!(models.len(), 1);
    assert_eq!(p.status().llm.default_model.as_deref(), Some("qwen2.5-0.5B"));

    assert!(p.set_active_model("qwen2.5-0.5B").await);
    assert_eq!(p.context().cache.llm_work_id(), "llm.1000");
    assert!(p.reset_llm().await);

    assert!(p.ping_system().await);
    assert!(p.reboot_device().await);
    p.final_shutdown().await;
}

#[tokio::test]
async fn commands_without_a_connection_degrade_gracefully() {
    let (p, _) = pathways(ScriptedFactory::new(healthy_device("hi")));
    let reply = p.send_command(&CommandEnvelope::ping()).await;
    assert_eq!(reply.error_code(), -1);

    let answer = p.think("anyone there?", false).await;
    assert_eq!(answer["error"], "Transport not initialized");
    assert!(!p.set_active_model("qwen2.5-0.5B").await);
    assert_eq!(p.refresh_hardware_info().await, p.get_hardware_info());
}

#[tokio::test]
async fn cortices_exchange_data_directly_and_through_the_scheduler() {
    let (p, _) = pathways(ScriptedFactory::new(healthy_device("hi")));
    let log = Arc::new(Mutex::new(Vec::new()));
    p.register_cortex(
        "motor",
        Arc::new(RecordingCortex {
            name: "motor".into(),
            log: Arc::clone(&log),
        }),
    );

    let ack = p
        .relay_between_cortices("vision", "motor", json!({"seen": "cup"}))
        .await
        .unwrap();
    assert_eq!(ack, json!({"ack": "motor"}));
    assert!(p.relay_between_cortices("vision", "nowhere", json!(1)).await.is_err());

    let task = p.schedule_relay("audio", "motor", json!("beep")).unwrap();
    assert!(p.basal_ganglia().start());
    tokio::time::timeout(Duration::from_secs(2), task.control().wait_completed())
        .await
        .unwrap();
    assert_eq!(log.lock().len(), 2);
    p.final_shutdown().await;
}
