//! Graph passes run by the compile pipeline.

mod format_propagation;
mod parallel_compile;
mod reorder_insertion;

use crate::config::CompileConfig;
use crate::error::CompileResult;
use crate::exec::TaskExecutor;
use crate::graph::Graph;
use crate::registry::ImplRegistry;
use crate::select::Selector;
use crate::trace::{CompileEvent, EventSink};

pub use format_propagation::FormatPropagation;
pub use parallel_compile::ParallelCompile;
pub use reorder_insertion::ReorderInsertion;

/// Statistics returned by a [`GraphPass`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    pub preferences_recorded: usize,
    pub reorders_inserted: usize,
    pub demotions: usize,
    pub impls_built: usize,
    /// Dynamic nodes left without an implementation until first invocation.
    pub deferred: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            preferences_recorded: self.preferences_recorded + other.preferences_recorded,
            reorders_inserted: self.reorders_inserted + other.reorders_inserted,
            demotions: self.demotions + other.demotions,
            impls_built: self.impls_built + other.impls_built,
            deferred: self.deferred + other.deferred,
        }
    }
}

/// Services shared by every pass of one compilation.
pub struct PassContext<'a> {
    registry: &'a ImplRegistry,
    config: CompileConfig,
    executor: &'a dyn TaskExecutor,
    sink: &'a dyn EventSink,
}

impl<'a> PassContext<'a> {
    pub fn new(
        registry: &'a ImplRegistry,
        config: CompileConfig,
        executor: &'a dyn TaskExecutor,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            registry,
            config,
            executor,
            sink,
        }
    }

    pub fn registry(&self) -> &'a ImplRegistry {
        self.registry
    }

    pub fn selector(&self) -> Selector<'a> {
        Selector::new(self.registry)
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn executor(&self) -> &'a dyn TaskExecutor {
        self.executor
    }

    pub fn emit(&self, event: CompileEvent) {
        self.sink.emit(&event);
    }
}

/// Interface implemented by the selection passes.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> CompileResult<PassResult>;
}
