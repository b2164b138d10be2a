//! Structured tracing hooks.
//!
//! Callers that want visibility into the decompiler's decisions provide a
//! `TraceSink`; the default is no tracing at all. Events are serializable
//! so a sink can stream them to a log or snapshot them in tests.

use crate::{cfg::BlockId, patterns::PatternKind};

/// One decision point in a decompilation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TraceEvent {
    /// A block was classified and dispatched.
    BlockPattern { block: BlockId, pattern: PatternKind },
    /// A block's merged entry stack converged at this depth.
    StackIn { block: BlockId, depth: usize },
    /// A rewrite pass ran.
    Pass { name: String },
    /// A code object finished decompiling.
    CodeDone { name: String, statements: usize },
}

/// Receiver for trace events.
pub trait TraceSink {
    fn event(&mut self, event: &TraceEvent);
}

/// Discards every event; tracing is off by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrace;

impl TraceSink for NoTrace {
    fn event(&mut self, _event: &TraceEvent) {}
}

/// Collects events into a vector, mostly for tests and snapshots.
#[derive(Debug, Default)]
pub struct CollectTrace {
    pub events: Vec<TraceEvent>,
}

impl TraceSink for CollectTrace {
    fn event(&mut self, event: &TraceEvent) {
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_trace_gathers_events() {
        let mut sink = CollectTrace::default();
        sink.event(&TraceEvent::Pass { name: "imports".into() });
        sink.event(&TraceEvent::CodeDone {
            name: "<module>".into(),
            statements: 3,
        });
        assert_eq!(sink.events.len(), 2);
    }

    #[test]
    fn test_events_serialize() {
        let event = TraceEvent::Pass { name: "asserts".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("asserts"));
    }
}
