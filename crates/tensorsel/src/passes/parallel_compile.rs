use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::error::{CompileError, CompileResult};
use crate::exec::{SerialExecutor, Task, TaskExecutor};
use crate::graph::{Graph, NodeId, OpKind};
use crate::registry::{BackendKind, KindMask};
use crate::select::{Selected, Selector};
use crate::trace::CompileEvent;

use super::{GraphPass, PassContext, PassResult};

/// Builds the implementation of every eligible node as independent tasks.
///
/// Output layouts are settled serially first; the builds then only read the
/// graph and each write a private slot. Results are stored once every task
/// has finished, and the first recorded failure fails the pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelCompile;

impl ParallelCompile {
    const NAME: &'static str = "parallel_compile";
}

impl GraphPass for ParallelCompile {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> CompileResult<PassResult> {
        let order = graph.processing_order().to_vec();
        for &id in &order {
            if graph.node(id).is_constant() {
                continue;
            }
            graph.resolve_output_layout(id);
        }

        let eligible: Vec<NodeId> = order
            .iter()
            .copied()
            .filter(|id| is_eligible(graph, *id))
            .collect();
        let slots: Vec<OnceLock<Option<Selected>>> =
            eligible.iter().map(|_| OnceLock::new()).collect();
        let failure: Mutex<Option<CompileError>> = Mutex::new(None);

        let selector = cx.selector();
        let executor: &dyn TaskExecutor = if cx.config().parallel_build {
            cx.executor()
        } else {
            &SerialExecutor
        };
        log::debug!(
            "{}: building {} nodes on {} executor",
            Self::NAME,
            eligible.len(),
            executor.name()
        );

        {
            let graph: &Graph = graph;
            let failure = &failure;
            let tasks: Vec<Task<'_>> = eligible
                .iter()
                .zip(&slots)
                .map(|(&id, slot)| {
                    Box::new(move || {
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| build_node(selector, graph, id)))
                                .unwrap_or_else(|payload| {
                                    Err(CompileError::TaskPanicked {
                                        node: id,
                                        message: panic_message(payload.as_ref()),
                                    })
                                });
                        match outcome {
                            Ok(selected) => {
                                let _ = slot.set(selected);
                            }
                            Err(error) => record_failure(failure, error),
                        }
                    }) as Task<'_>
                })
                .collect();
            executor.run_all(tasks);
        }

        if let Some(error) = failure
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(error);
        }

        let mut result = PassResult::default();
        for (id, slot) in eligible.into_iter().zip(slots) {
            graph.refresh_shape_class(id);
            match slot.into_inner() {
                Some(Some(selected)) => {
                    log::trace!(
                        "{} uses {} ({})",
                        graph.describe(id),
                        selected.descriptor,
                        selected.kind
                    );
                    graph.node_mut(id).set_implementation(selected.handle);
                    result.impls_built += 1;
                }
                Some(None) => result.deferred += 1,
                None => {}
            }
        }
        result.changed = result.impls_built > 0;

        cx.emit(CompileEvent::PassFinished {
            pass: Self::NAME.to_string(),
            changed: result.changed,
        });
        Ok(result)
    }
}

fn is_eligible(graph: &Graph, id: NodeId) -> bool {
    let node = graph.node(id);
    if node.is_constant() || node.implementation().is_some() {
        return false;
    }
    !(node.op() == OpKind::MutableBuffer && node.deps().is_empty())
}

/// Host pins are kept; every other node may use any kind.
fn build_node(selector: Selector<'_>, graph: &Graph, id: NodeId) -> CompileResult<Option<Selected>> {
    let node = graph.node(id);
    let shape = graph.shape_class_of(id);
    let mask = match node.pinned_kind() {
        Some(BackendKind::Host) => KindMask::only(BackendKind::Host),
        _ => KindMask::ANY,
    };
    match selector.choose_impl(graph, id, mask) {
        Ok(selected) => Ok(Some(selected)),
        Err(CompileError::NoImplementation { .. }) if shape.is_dynamic() => {
            log::debug!(
                "{} has dynamic shapes; selection deferred to first run",
                graph.describe(id)
            );
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

fn record_failure(failure: &Mutex<Option<CompileError>>, error: CompileError) {
    let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(error);
    } else {
        log::debug!("discarding additional build failure: {error}");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
