//! The communication task: sole owner of the device transport.
//!
//! Every device interaction goes through [`CommunicationTask::send_command`]
//! (or [`send_streaming`](CommunicationTask::send_streaming)), which hold an
//! async mutex around the transport for the whole exchange. At most one
//! request is ever on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::envelope::{CommandEnvelope, ResponseEnvelope};
use super::error::ERR_COMMAND;
use super::task::TaskControl;
use crate::config::MonitorConfig;
use crate::transport::{ConnectionType, Transport, TransportFactory};

/// Upper bound on frames read for one streaming inference.
const MAX_STREAM_FRAMES: usize = 4096;

/// Name the communication task registers under.
pub const COMMUNICATION_TASK: &str = "communication";

/// One piece of a streaming inference payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    /// New text.
    pub delta: String,
    /// Whether the device signalled the end of the stream.
    pub finished: bool,
}

impl StreamChunk {
    /// Interpret response `data`: a plain string, or an object carrying
    /// `delta`/`generated_text` and `finish`/`finished`. A missing end flag
    /// counts as finished.
    #[must_use]
    pub fn from_data(data: &Value) -> Option<Self> {
        match data {
            Value::String(s) => Some(Self {
                delta: s.clone(),
                finished: true,
            }),
            Value::Object(fields) => {
                let delta = fields
                    .get("delta")
                    .or_else(|| fields.get("generated_text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let finished = fields
                    .get("finish")
                    .or_else(|| fields.get("finished"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Some(Self { delta, finished })
            }
            _ => None,
        }
    }
}

/// Owner of the live transport.
pub struct CommunicationTask {
    control: TaskControl,
    factory: Arc<dyn TransportFactory>,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    connection_type: Mutex<Option<ConnectionType>>,
    endpoint: Mutex<Option<String>>,
    connected: AtomicBool,
    last_activity: Mutex<Instant>,
    monitor_config: MonitorConfig,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CommunicationTask {
    /// Unstarted task building transports with `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn TransportFactory>, monitor_config: MonitorConfig) -> Self {
        Self {
            control: TaskControl::new(COMMUNICATION_TASK, 1, Duration::from_secs(1)).unstarted(),
            factory,
            transport: tokio::sync::Mutex::new(None),
            connection_type: Mutex::new(None),
            endpoint: Mutex::new(None),
            connected: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            monitor_config,
            monitor: Mutex::new(None),
        }
    }

    /// Lifecycle block.
    #[must_use]
    pub const fn control(&self) -> &TaskControl {
        &self.control
    }

    /// Whether the transport reported a live session after the last call.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Type of the current (or last attempted) transport.
    #[must_use]
    pub fn connection_type(&self) -> Option<ConnectionType> {
        *self.connection_type.lock()
    }

    /// Endpoint of the current session.
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint.lock().clone()
    }

    /// Time since the last exchange.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Status value stored as the task result on each scheduled run.
    #[must_use]
    pub fn status(&self) -> Value {
        json!({
            "status": if self.is_connected() { "connected" } else { "disconnected" },
            "connection_type": self.connection_type().map(ConnectionType::as_str),
            "endpoint": self.endpoint(),
        })
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn sync_state(&self, transport: Option<&dyn Transport>) {
        let connected = transport.is_some_and(|t| t.is_connected());
        self.connected.store(connected, Ordering::Release);
        *self.endpoint.lock() = transport.and_then(|t| t.endpoint());
    }

    /// Replace any current transport with a new one of `kind` and connect it.
    ///
    /// Returns whether the session is up. On failure nothing is left open and
    /// the call can simply be retried.
    pub async fn initialize(&self, kind: ConnectionType) -> bool {
        let mut slot = self.transport.lock().await;
        if let Some(mut previous) = slot.take() {
            previous.disconnect().await;
        }
        self.sync_state(None);
        *self.connection_type.lock() = Some(kind);

        let mut transport = match self.factory.create(kind) {
            Ok(t) => t,
            Err(e) => {
                error!(connection = %kind, error = %e, "Could not build transport");
                return false;
            }
        };
        match transport.connect().await {
            Ok(()) => {
                self.sync_state(Some(&*transport));
                *slot = Some(transport);
                drop(slot);
                self.touch();
                self.control.activate();
                info!(connection = %kind, endpoint = ?self.endpoint(), "Communication initialized");
                true
            }
            Err(e) => {
                error!(connection = %kind, error = %e, "Transport connect failed");
                transport.disconnect().await;
                false
            }
        }
    }

    /// Send one command. Never fails: transport errors come back as an error
    /// envelope (`code` -1, or -2 for an empty response).
    pub async fn send_command(&self, command: &CommandEnvelope) -> ResponseEnvelope {
        let mut slot = self.transport.lock().await;
        let Some(transport) = slot.as_mut() else {
            return ResponseEnvelope::failure(command, ERR_COMMAND, "Transport not initialized");
        };
        let response = match transport.transmit(command).await {
            Ok(r) => r,
            Err(e) => {
                warn!(action = %command.action, error = %e, "Command failed");
                ResponseEnvelope::from_transport_error(command, &e)
            }
        };
        self.sync_state(Some(&**transport));
        drop(slot);
        self.touch();
        response
    }

    /// Send a streaming inference and keep reading frames until the device
    /// marks the stream finished, passing each delta to `on_delta`.
    ///
    /// The returned envelope carries the concatenated text as `data`, or the
    /// first error envelope encountered.
    pub async fn send_streaming<F>(&self, command: &CommandEnvelope, mut on_delta: F) -> ResponseEnvelope
    where
        F: FnMut(&str) + Send,
    {
        let mut slot = self.transport.lock().await;
        let Some(transport) = slot.as_mut() else {
            return ResponseEnvelope::failure(command, ERR_COMMAND, "Transport not initialized");
        };

        let mut text = String::new();
        let mut frame = transport.transmit(command).await;
        let mut result = None;
        for _ in 0..MAX_STREAM_FRAMES {
            let response = match frame {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "Stream interrupted");
                    result = Some(ResponseEnvelope::from_transport_error(command, &e));
                    break;
                }
            };
            if !response.is_success() {
                result = Some(response);
                break;
            }
            let Some(chunk) = StreamChunk::from_data(&response.data) else {
                result = Some(response);
                break;
            };
            if !chunk.delta.is_empty() {
                on_delta(&chunk.delta);
                text.push_str(&chunk.delta);
            }
            if chunk.finished {
                let mut done = response;
                done.data = Value::String(std::mem::take(&mut text));
                result = Some(done);
                break;
            }
            frame = transport.next_frame(command).await;
        }
        self.sync_state(Some(&**transport));
        drop(slot);
        self.touch();

        result.unwrap_or_else(|| {
            ResponseEnvelope::failure(command, ERR_COMMAND, "Stream exceeded frame limit")
        })
    }

    /// Ping if idle past the threshold, re-initializing on failure.
    /// Returns whether the connection is believed healthy.
    pub async fn check_connection(&self) -> bool {
        let threshold = Duration::from_secs(self.monitor_config.idle_threshold_secs);
        if self.idle_for() < threshold {
            return self.is_connected();
        }
        let response = self.send_command(&CommandEnvelope::ping()).await;
        if response.is_success() {
            debug!("Idle ping succeeded");
            return true;
        }
        warn!(error = %response.error_message(), "Idle ping failed, reconnecting");
        match self.connection_type() {
            Some(kind) => self.initialize(kind).await,
            None => false,
        }
    }

    /// Start the background connection monitor. Returns `false` if one is
    /// already running or there is no tokio runtime.
    pub fn start_monitor(self: &Arc<Self>) -> bool {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, connection monitor not started");
            return false;
        };
        let interval = Duration::from_secs(self.monitor_config.interval_secs.max(1));
        let weak: Weak<Self> = Arc::downgrade(self);
        *monitor = Some(handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(task) = weak.upgrade() else {
                    break;
                };
                if task.control.has_completed() {
                    break;
                }
                task.check_connection().await;
            }
        }));
        debug!(?interval, "Connection monitor started");
        true
    }

    /// Stop the monitor. Idempotent.
    pub fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
    }

    /// Stop the monitor and tear down the transport. Idempotent.
    pub async fn disconnect(&self) {
        self.stop_monitor();
        let mut slot = self.transport.lock().await;
        if let Some(mut transport) = slot.take() {
            transport.disconnect().await;
            info!(connection = %transport.connection_type(), "Communication disconnected");
        }
        self.sync_state(None);
    }
}
