use std::sync::Arc;
use std::time::Instant;

use crate::config::CompileConfig;
use crate::error::CompileResult;
use crate::exec::{RayonExecutor, SerialExecutor, TaskExecutor};
use crate::graph::{validate_topology, Graph};
use crate::passes::{
    FormatPropagation, GraphPass, ParallelCompile, PassContext, PassResult, ReorderInsertion,
};
use crate::registry::ImplRegistry;
use crate::trace::{EventSink, LogSink};

/// Ordered list of passes run over a graph.
pub struct CompilePipeline {
    passes: Vec<Arc<dyn GraphPass>>,
}

impl CompilePipeline {
    pub fn empty() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn pass(mut self, pass: Arc<dyn GraphPass>) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    pub fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> CompileResult<PassResult> {
        validate_topology(graph)?;
        let mut total = PassResult::default();
        for pass in &self.passes {
            let started = Instant::now();
            let result = pass.run(graph, cx)?;
            log::debug!(
                "pass {} finished in {:?} (changed: {})",
                pass.name(),
                started.elapsed(),
                result.changed
            );
            total = total.merge(result);
        }
        log::info!(
            "compiled {} nodes: {} reorders, {} demotions, {} implementations, {} deferred",
            graph.len(),
            total.reorders_inserted,
            total.demotions,
            total.impls_built,
            total.deferred
        );
        Ok(total)
    }
}

impl Default for CompilePipeline {
    /// Format propagation, reorder insertion, then parallel compilation.
    fn default() -> Self {
        Self::empty()
            .pass(Arc::new(FormatPropagation))
            .pass(Arc::new(ReorderInsertion))
            .pass(Arc::new(ParallelCompile))
    }
}

/// Runs the default pipeline with an explicit pass context.
pub fn compile_graph(graph: &mut Graph, cx: &mut PassContext<'_>) -> CompileResult<PassResult> {
    CompilePipeline::default().run(graph, cx)
}

/// Runs the default pipeline with an executor derived from `config` and
/// events forwarded to the log.
pub fn compile(
    graph: &mut Graph,
    registry: &ImplRegistry,
    config: CompileConfig,
) -> CompileResult<PassResult> {
    compile_with_sink(graph, registry, config, &LogSink)
}

pub fn compile_with_sink(
    graph: &mut Graph,
    registry: &ImplRegistry,
    config: CompileConfig,
    sink: &dyn EventSink,
) -> CompileResult<PassResult> {
    let executor = build_executor(&config);
    let mut cx = PassContext::new(registry, config, executor.as_ref(), sink);
    compile_graph(graph, &mut cx)
}

fn build_executor(config: &CompileConfig) -> Box<dyn TaskExecutor> {
    if !config.parallel_build {
        return Box::new(SerialExecutor);
    }
    match RayonExecutor::with_threads(config.build_threads) {
        Ok(executor) => Box::new(executor),
        Err(err) => {
            log::warn!(
                "failed to start {} build threads ({err}); using the global pool",
                config.build_threads
            );
            Box::new(RayonExecutor::new())
        }
    }
}
