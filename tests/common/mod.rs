//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use basal_ganglia::core::{CortexEndpoint, TaskError};
use basal_ganglia::{CommandEnvelope, ConnectionType, ResponseEnvelope, Transport, TransportError, TransportFactory};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Decides the device's answer to each command.
pub type Responder = dyn Fn(&CommandEnvelope) -> Result<ResponseEnvelope, TransportError> + Send + Sync;

/// Successful envelope answering `cmd` with `data`.
pub fn ok_reply(cmd: &CommandEnvelope, data: Value) -> ResponseEnvelope {
    serde_json::from_value(json!({
        "request_id": cmd.request_id,
        "work_id": cmd.work_id,
        "error": {"code": 0, "message": ""},
        "data": data,
    }))
    .unwrap()
}

/// Device that answers pings, hardware and model queries, and echoes
/// inference prompts back as `reply`.
pub fn healthy_device(reply: &'static str) -> Arc<Responder> {
    Arc::new(move |cmd: &CommandEnvelope| {
        let data = match cmd.action.as_str() {
            "hwinfo" => json!({"cpu_loadavg": 12, "mem": 40, "temperature": 51.5}),
            "lsmode" => json!([{"model": "qwen2.5-0.5B", "type": "llm"}]),
            "inference" => json!(reply),
            _ => Value::Null,
        };
        let mut reply = ok_reply(cmd, data);
        if cmd.action == "setup" {
            reply.work_id = "llm.1000".to_string();
        }
        Ok(reply)
    })
}

/// State shared by every transport a [`ScriptedFactory`] hands out.
#[derive(Default)]
pub struct Wire {
    in_flight: AtomicBool,
    /// Set if two exchanges ever overlapped.
    pub overlapped: AtomicBool,
    /// Commands seen, in order.
    pub seen: Mutex<Vec<String>>,
    /// Connection types whose `connect` fails.
    pub refuse: Mutex<HashSet<ConnectionType>>,
    /// Successful connects.
    pub connects: AtomicUsize,
}

/// Transport answering through a [`Responder`].
pub struct ScriptedTransport {
    kind: ConnectionType,
    wire: Arc<Wire>,
    responder: Arc<Responder>,
    latency: Duration,
    connected: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn connection_type(&self) -> ConnectionType {
        self.kind
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn endpoint(&self) -> Option<String> {
        self.connected.then(|| format!("fake-{}", self.kind))
    }

    async fn is_available(&mut self) -> bool {
        !self.wire.refuse.lock().contains(&self.kind)
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.wire.refuse.lock().contains(&self.kind) {
            return Err(TransportError::ConnectionFailed(format!("{} refused", self.kind)));
        }
        self.connected = true;
        self.wire.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn transmit(&mut self, command: &CommandEnvelope) -> Result<ResponseEnvelope, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.wire.in_flight.swap(true, Ordering::SeqCst) {
            self.wire.overlapped.store(true, Ordering::SeqCst);
        }
        self.wire.seen.lock().push(command.action.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let reply = (self.responder)(command);
        self.wire.in_flight.store(false, Ordering::SeqCst);
        reply
    }

    async fn next_frame(&mut self, _request: &CommandEnvelope) -> Result<ResponseEnvelope, TransportError> {
        Err(TransportError::EmptyResponse)
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Factory handing out [`ScriptedTransport`]s over one shared [`Wire`].
pub struct ScriptedFactory {
    pub wire: Arc<Wire>,
    responder: Arc<Responder>,
    latency: Duration,
}

impl ScriptedFactory {
    pub fn new(responder: Arc<Responder>) -> Self {
        Self {
            wire: Arc::new(Wire::default()),
            responder,
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn refuse(&self, kind: ConnectionType) {
        self.wire.refuse.lock().insert(kind);
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, kind: ConnectionType) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(ScriptedTransport {
            kind,
            wire: Arc::clone(&self.wire),
            responder: Arc::clone(&self.responder),
            latency: self.latency,
            connected: false,
        }))
    }
}

/// Cortex that records `(source, data)` pairs into a shared log.
pub struct RecordingCortex {
    pub name: String,
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CortexEndpoint for RecordingCortex {
    async fn receive(&self, source: &str, data: Value) -> Result<Value, TaskError> {
        self.log.lock().push(format!("{}<-{source}:{data}", self.name));
        Ok(json!({"ack": self.name}))
    }
}

/// Cortex whose handler panics.
pub struct PanickingCortex;

#[async_trait]
impl CortexEndpoint for PanickingCortex {
    async fn receive(&self, _source: &str, _data: Value) -> Result<Value, TaskError> {
        panic!("cortex exploded");
    }
}
