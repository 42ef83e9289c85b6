//! Rendering of text and streamed LLM output.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::info;

use crate::core::error::TaskError;
use crate::core::task::{TaskContext, TaskControl};
use crate::util::ids::task_name;

/// A frame handed to the display backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    /// Producing task.
    pub task: String,
    /// `text` or `llm_stream`.
    pub kind: &'static str,
    /// Fully composed content.
    pub content: String,
}

/// Display backend.
pub trait DisplaySink: Send + Sync {
    /// Show one frame.
    fn render(&self, frame: &DisplayFrame);
}

/// Backend that logs frames through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDisplay;

impl DisplaySink for TracingDisplay {
    fn render(&self, frame: &DisplayFrame) {
        info!(task = %frame.task, kind = frame.kind, "[OUTPUT] {}", frame.content);
    }
}

/// Options for `llm_stream` rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Append a token count and rate line.
    pub show_tokens: bool,
    /// Words wrapped in `[HIGHLIGHT]..[/HIGHLIGHT]`.
    pub keywords: Vec<String>,
}

#[derive(Debug)]
enum Mode {
    Text,
    LlmStream(StreamOptions),
}

#[derive(Debug, Default)]
struct Buffer {
    content: String,
    rendered: Option<String>,
    complete: bool,
}

/// Shows a piece of text once, or follows a growing LLM stream until it is
/// marked complete.
#[derive(Debug)]
pub struct DisplaySinkTask {
    control: TaskControl,
    mode: Mode,
    started: Instant,
    buffer: Mutex<Buffer>,
}

impl DisplaySinkTask {
    /// One-shot text display.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            control: TaskControl::new(task_name("display"), 2, Duration::ZERO),
            mode: Mode::Text,
            started: Instant::now(),
            buffer: Mutex::new(Buffer {
                content: content.into(),
                ..Buffer::default()
            }),
        }
    }

    /// Streaming display fed by [`append`](Self::append) or
    /// [`update_stream`](Self::update_stream).
    #[must_use]
    pub fn llm_stream(options: StreamOptions) -> Self {
        Self {
            control: TaskControl::new(task_name("display"), 2, Duration::ZERO),
            mode: Mode::LlmStream(options),
            started: Instant::now(),
            buffer: Mutex::new(Buffer::default()),
        }
    }

    /// Override the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.control = self.control.with_priority(priority);
        self
    }

    /// Lifecycle block.
    #[must_use]
    pub const fn control(&self) -> &TaskControl {
        &self.control
    }

    /// Whether this follows a stream.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self.mode, Mode::LlmStream(_))
    }

    /// Current raw content.
    #[must_use]
    pub fn content(&self) -> String {
        self.buffer.lock().content.clone()
    }

    /// Add streamed text.
    pub fn append(&self, delta: &str) {
        self.buffer.lock().content.push_str(delta);
    }

    /// Replace the content, optionally marking the stream complete.
    pub fn update_stream(&self, content: &str, complete: bool) {
        let mut buffer = self.buffer.lock();
        content.clone_into(&mut buffer.content);
        buffer.complete |= complete;
    }

    /// No more content will arrive.
    pub fn mark_complete(&self) {
        self.buffer.lock().complete = true;
    }

    pub(crate) fn execute(&self, ctx: &TaskContext) -> Result<Option<Value>, TaskError> {
        match &self.mode {
            Mode::Text => {
                let content = self.content();
                ctx.display.render(&DisplayFrame {
                    task: self.control.name().to_string(),
                    kind: "text",
                    content,
                });
                Ok(Some(json!({"status": "displayed", "type": "text"})))
            }
            Mode::LlmStream(options) => {
                let (changed, complete) = {
                    let mut buffer = self.buffer.lock();
                    let changed = buffer.rendered.as_deref() != Some(buffer.content.as_str());
                    if changed {
                        buffer.rendered = Some(buffer.content.clone());
                    }
                    (changed.then(|| buffer.content.clone()), buffer.complete)
                };
                if let Some(content) = changed {
                    ctx.display.render(&DisplayFrame {
                        task: self.control.name().to_string(),
                        kind: "llm_stream",
                        content: compose(&content, options, self.started.elapsed()),
                    });
                }
                if complete {
                    self.control.stop();
                    return Ok(Some(json!({"status": "completed", "type": "llm_stream"})));
                }
                Ok(None)
            }
        }
    }
}

/// Apply keyword highlighting and the optional statistics suffix.
#[must_use]
pub fn compose(content: &str, options: &StreamOptions, elapsed: Duration) -> String {
    let mut out = content.to_string();
    for keyword in options.keywords.iter().filter(|k| !k.is_empty()) {
        out = out.replace(keyword.as_str(), &format!("[HIGHLIGHT]{keyword}[/HIGHLIGHT]"));
    }
    if options.show_tokens {
        let tokens = content.split_whitespace().count();
        #[allow(clippy::cast_precision_loss)]
        let rate = tokens as f64 / elapsed.as_secs_f64().max(0.1);
        out.push_str(&format!("\n\n[Tokens: {tokens}, Rate: {rate:.1} tokens/sec]"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlights_keywords_and_appends_stats() {
        let options = StreamOptions {
            show_tokens: true,
            keywords: vec!["Penphin".into()],
        };
        let out = compose("I am Penphin here", &options, Duration::from_secs(2));
        assert_eq!(
            out,
            "I am [HIGHLIGHT]Penphin[/HIGHLIGHT] here\n\n[Tokens: 4, Rate: 2.0 tokens/sec]"
        );
    }

    #[test]
    fn rate_uses_a_minimum_elapsed_time() {
        let options = StreamOptions {
            show_tokens: true,
            keywords: Vec::new(),
        };
        assert_eq!(
            compose("a b", &options, Duration::ZERO),
            "a b\n\n[Tokens: 2, Rate: 20.0 tokens/sec]"
        );
        assert_eq!(compose("plain", &StreamOptions::default(), Duration::ZERO), "plain");
    }

    #[test]
    fn stream_buffer_accumulates() {
        let task = DisplaySinkTask::llm_stream(StreamOptions::default());
        assert!(task.is_stream());
        task.append("Hel");
        task.append("lo");
        assert_eq!(task.content(), "Hello");
        task.update_stream("Hello there", true);
        assert_eq!(task.content(), "Hello there");
        assert!(!DisplaySinkTask::text("x").is_stream());
    }
}
