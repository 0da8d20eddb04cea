//! Structured logging setup (§10.3). No distributed tracing exporter is
//! carried forward from the teacher crate — the admin REST log tail is the
//! only consumer of captured events, so a `tracing_subscriber::Layer` that
//! feeds an in-memory ring buffer is the whole story.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// One captured log line, as the admin REST `/api/logs` endpoint serves it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogLine {
    pub ts: i64,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Bounded ring buffer of the most recent structured events.
pub struct LogTail {
    capacity: usize,
    lines: Mutex<VecDeque<LogLine>>,
}

impl LogTail {
    pub fn new(capacity: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    fn push(&self, line: LogLine) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Most recent `limit` lines, newest last.
    pub fn tail(&self, limit: usize) -> Vec<LogLine> {
        let lines = self.lines.lock().unwrap();
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }
}

struct RingBufferLayer {
    tail: std::sync::Arc<LogTail>,
}

impl<S> Layer<S> for RingBufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        struct Visitor(String);
        impl tracing::field::Visit for Visitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }
        let mut visitor = Visitor(String::new());
        event.record(&mut visitor);

        self.tail.push(LogLine {
            ts: chrono::Utc::now().timestamp(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

/// Full subscriber for the long-running `run` command: stdout formatting
/// plus the ring buffer the admin REST surface reads from.
pub fn init_tracing(verbose: bool) -> std::sync::Arc<LogTail> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let tail = LogTail::new(500);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(level));

    let ring_layer = RingBufferLayer { tail: tail.clone() };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(ring_layer)
        .init();

    tail
}

/// Basic console-only logging for one-shot commands (`init`, `status`).
pub fn init_basic_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_evicts_oldest_past_capacity() {
        let tail = LogTail::new(2);
        for i in 0..5 {
            tail.push(LogLine {
                ts: i,
                level: "INFO".into(),
                target: "t".into(),
                message: format!("msg{i}"),
            });
        }
        let lines = tail.tail(10);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "msg3");
        assert_eq!(lines[1].message, "msg4");
    }
}
