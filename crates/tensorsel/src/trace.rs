//! Diagnostic events emitted while compiling.
//!
//! Every reorder insertion and every forced backend demotion is reported to
//! the [`EventSink`] of the running pass. Sinks are observers only; nothing
//! they do affects the compiled graph.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::graph::{NodeId, ReorderReason};
use crate::layout::LayoutKey;
use crate::registry::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CompileEvent {
    ReorderInserted {
        reorder: NodeId,
        producer: NodeId,
        consumer: NodeId,
        slot: usize,
        source: LayoutKey,
        target: LayoutKey,
        reason: ReorderReason,
    },
    KindDemoted {
        node: NodeId,
        from: BackendKind,
        to: BackendKind,
        reason: String,
    },
    PassFinished {
        pass: String,
        changed: bool,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &CompileEvent);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &CompileEvent) {
        match event {
            CompileEvent::ReorderInserted {
                reorder,
                producer,
                consumer,
                slot,
                source,
                target,
                reason,
            } => log::debug!(
                "reorder {reorder} on {producer} -> {consumer}[{slot}]: {source} -> {target} ({reason})"
            ),
            CompileEvent::KindDemoted {
                node,
                from,
                to,
                reason,
            } => log::warn!("node {node} demoted from {from} to {to}: {reason}"),
            CompileEvent::PassFinished { pass, changed } => {
                log::trace!("pass {pass} finished (changed: {changed})")
            }
        }
    }
}

/// Keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CompileEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CompileEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reorders(&self) -> usize {
        self.count(|event| matches!(event, CompileEvent::ReorderInserted { .. }))
    }

    pub fn demotions(&self) -> usize {
        self.count(|event| matches!(event, CompileEvent::KindDemoted { .. }))
    }

    fn count(&self, pred: impl Fn(&CompileEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| pred(event))
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.events())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &CompileEvent) {
        LogSink.emit(event);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
