//! Dedicated I/O thread for a blocking serial port.
//!
//! The port is owned by one OS thread. Outgoing writes reach it over a
//! bounded `crossbeam_channel`; complete lines come back over a bounded
//! `tokio::sync::mpsc` channel the async side awaits on. Reads are one byte
//! at a time so a frame boundary is never split across buffers. The thread
//! never blocks on the line queue: when nobody drains it, new lines are
//! dropped and the command queue keeps being polled.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError as LineSendError;
use tracing::{debug, error, info, warn};

use crate::core::error::TransportError;
use crate::transport::codec::MAX_FRAME_BYTES;

/// Blocking byte port the I/O thread drives.
pub trait SerialIo: Read + Write + Send {}

impl<T: Read + Write + Send> SerialIo for T {}

const COMMAND_QUEUE_DEPTH: usize = 32;
const LINE_QUEUE_DEPTH: usize = 256;
const IDLE_BACKOFF: Duration = Duration::from_millis(2);

enum LinkCommand {
    Write(Vec<u8>),
    Shutdown,
}

/// Async handle to a serial port running on its own thread.
pub struct SerialLink {
    name: String,
    commands: Sender<LinkCommand>,
    lines: mpsc::Receiver<String>,
    closed: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Move `port` onto a new I/O thread.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the thread cannot be spawned.
    pub fn spawn(port: Box<dyn SerialIo>, name: impl Into<String>) -> Result<Self, TransportError> {
        let name = name.into();
        let (cmd_tx, cmd_rx) = bounded(COMMAND_QUEUE_DEPTH);
        let (line_tx, line_rx) = mpsc::channel(LINE_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));

        let worker = {
            let closed = Arc::clone(&closed);
            let port_name = name.clone();
            thread::Builder::new()
                .name(format!("serial-io-{name}"))
                .spawn(move || io_loop(port, &port_name, &cmd_rx, &line_tx, &closed))?
        };
        info!(port = %name, "Serial I/O thread started");

        Ok(Self {
            name,
            commands: cmd_tx,
            lines: line_rx,
            closed,
            worker: Some(worker),
        })
    }

    /// Port name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the I/O thread has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue `line` plus a newline for writing.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Serial` if the queue is full or the thread is gone.
    pub fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        match self.commands.try_send(LinkCommand::Write(bytes)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(TransportError::Serial(format!("{}: write queue full", self.name)))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(TransportError::Serial(format!("{}: link closed", self.name)))
            }
        }
    }

    /// Await the next complete line.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing arrives in time, `ConnectionClosed` if the thread stopped.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        match tokio::time::timeout(timeout, self.lines.recv()).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Ok(Some(line)) => Ok(line),
        }
    }

    /// Take every line already received.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = self.lines.try_recv() {
            out.push(line);
        }
        out
    }

    /// Stop the I/O thread and wait for it. Idempotent.
    ///
    /// The wait is bounded by one port read timeout.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.lines.close();
        if self.commands.try_send(LinkCommand::Shutdown).is_err() {
            debug!(port = %self.name, "Command queue full, relying on closed line queue");
        }
        if worker.join().is_err() {
            warn!(port = %self.name, "Serial I/O thread panicked");
        }
        debug!(port = %self.name, "Serial I/O thread joined");
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        // Signal only; the thread exits on its next loop turn.
        if self.worker.is_some() {
            let _ = self.commands.try_send(LinkCommand::Shutdown);
        }
    }
}

fn io_loop(
    mut port: Box<dyn SerialIo>,
    name: &str,
    commands: &Receiver<LinkCommand>,
    lines: &mpsc::Sender<String>,
    closed: &AtomicBool,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    let mut dropped: u64 = 0;
    loop {
        if lines.is_closed() {
            closed.store(true, Ordering::Release);
            return;
        }
        loop {
            match commands.try_recv() {
                Ok(LinkCommand::Write(bytes)) => {
                    if let Err(e) = port.write_all(&bytes).and_then(|()| port.flush()) {
                        error!(port = name, error = %e, "Serial write failed");
                        closed.store(true, Ordering::Release);
                        return;
                    }
                }
                Ok(LinkCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    closed.store(true, Ordering::Release);
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match port.read(&mut byte) {
            Ok(0) => thread::sleep(IDLE_BACKOFF),
            Ok(_) if byte[0] == b'\n' => {
                let line = String::from_utf8_lossy(&buf).trim_end_matches('\r').to_string();
                buf.clear();
                if line.trim().is_empty() {
                    continue;
                }
                match lines.try_send(line) {
                    Ok(()) => dropped = 0,
                    Err(LineSendError::Full(_)) => {
                        dropped += 1;
                        if dropped == 1 {
                            warn!(port = name, "Line queue full, dropping serial output");
                        }
                    }
                    Err(LineSendError::Closed(_)) => {
                        closed.store(true, Ordering::Release);
                        return;
                    }
                }
            }
            Ok(_) => {
                buf.push(byte[0]);
                if buf.len() > MAX_FRAME_BYTES {
                    warn!(port = name, "Discarding oversized serial line");
                    buf.clear();
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                error!(port = name, error = %e, "Serial read failed");
                closed.store(true, Ordering::Release);
                return;
            }
        }
    }
}
