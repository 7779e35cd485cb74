//! Descriptor selection for a single node.

use std::fmt::Write as _;

use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, NodeId, NodeView};
use crate::layout::ShapeClass;
use crate::registry::{BackendKind, DescriptorRef, ImplDescriptor, ImplHandle, ImplRegistry, KindMask};

/// Outcome of testing one descriptor against a node.
///
/// Only `Accepted` stops a scan; a later build failure on an accepted
/// descriptor is fatal rather than a reason to try the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    ShapeMismatch,
    Rejected,
    Accepted,
}

pub fn probe(descriptor: &dyn ImplDescriptor, node: &NodeView<'_>, shape: ShapeClass) -> Probe {
    if !descriptor.support_shapes(shape) {
        Probe::ShapeMismatch
    } else if descriptor.validate(node) {
        Probe::Accepted
    } else {
        Probe::Rejected
    }
}

/// A built implementation together with where it came from.
#[derive(Debug, Clone)]
pub struct Selected {
    pub kind: BackendKind,
    pub descriptor: String,
    pub handle: ImplHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct Selector<'r> {
    registry: &'r ImplRegistry,
}

impl<'r> Selector<'r> {
    pub fn new(registry: &'r ImplRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &'r ImplRegistry {
        self.registry
    }

    /// Highest-priority descriptor in `mask` that accepts the node as it
    /// currently is, without building it.
    pub fn candidate(&self, graph: &Graph, id: NodeId, mask: KindMask) -> Option<&'r DescriptorRef> {
        let view = graph.view(id);
        let shape = view.shape_class();
        self.registry
            .entries(view.op())
            .iter()
            .filter(|entry| mask.contains(entry.kind()))
            .find(|entry| probe(entry.as_ref(), &view, shape) == Probe::Accepted)
    }

    /// Like [`Selector::candidate`], but vendor entries are judged on the
    /// inputs they will read after reorder insertion strips batch and
    /// spatial padding. Returns the winner with the view it accepted.
    pub fn candidate_after_stripping<'g>(
        &self,
        graph: &'g Graph,
        id: NodeId,
        mask: KindMask,
    ) -> Option<(&'r DescriptorRef, NodeView<'g>)> {
        let view = graph.view(id);
        let stripped = graph.stripped_view(id);
        let shape = view.shape_class();
        self.registry
            .entries(view.op())
            .iter()
            .filter(|entry| mask.contains(entry.kind()))
            .find_map(|entry| {
                let seen = if entry.kind() == BackendKind::Vendor {
                    stripped
                } else {
                    view
                };
                (probe(entry.as_ref(), &seen, shape) == Probe::Accepted).then_some((entry, seen))
            })
    }

    /// Picks and builds the best descriptor for the node.
    pub fn choose_impl(&self, graph: &Graph, id: NodeId, mask: KindMask) -> CompileResult<Selected> {
        let view = graph.view(id);
        let Some(descriptor) = self.candidate(graph, id, mask) else {
            return Err(self.no_implementation(graph, id, mask));
        };
        log::debug!(
            "building {} ({}) for {}",
            descriptor.name(),
            descriptor.kind(),
            view.describe()
        );
        let handle = descriptor.build(&view).map_err(|source| {
            log::error!(
                "{} failed to build {}: {source:#}",
                descriptor.name(),
                view.describe()
            );
            CompileError::Build {
                node: view.describe(),
                kind: descriptor.kind(),
                descriptor: descriptor.name().to_string(),
                source,
            }
        })?;
        Ok(Selected {
            kind: descriptor.kind(),
            descriptor: descriptor.name().to_string(),
            handle,
        })
    }

    /// Whether any descriptor in `mask` serving `shape` validates the node.
    pub fn is_node_supported(
        &self,
        graph: &Graph,
        id: NodeId,
        mask: KindMask,
        shape: ShapeClass,
    ) -> bool {
        let view = graph.view(id);
        self.registry
            .entries(view.op())
            .iter()
            .filter(|entry| mask.contains(entry.kind()))
            .any(|entry| probe(entry.as_ref(), &view, shape) == Probe::Accepted)
    }

    /// Backend kinds whose best-priority descriptor for the node's shape
    /// classification currently validates it.
    pub fn available_impls(&self, graph: &Graph, id: NodeId) -> KindMask {
        let view = graph.view(id);
        let shape = view.shape_class();
        let entries = self.registry.entries(view.op());
        BackendKind::ALL
            .into_iter()
            .filter(|kind| {
                entries
                    .iter()
                    .find(|entry| entry.kind() == *kind && entry.support_shapes(shape))
                    .is_some_and(|entry| entry.validate(&view))
            })
            .collect()
    }

    pub(crate) fn no_implementation(&self, graph: &Graph, id: NodeId, mask: KindMask) -> CompileError {
        let view = graph.view(id);
        let error = CompileError::NoImplementation {
            node: view.describe(),
            op: view.op(),
            requested: mask,
            shape: view.shape_class(),
            formats: attempted_formats(&view),
        };
        log::debug!("{error}");
        error
    }
}

/// Input and output layouts a node was checked with, for diagnostics.
pub fn attempted_formats(node: &NodeView<'_>) -> String {
    let mut text = String::new();
    for slot in 0..node.input_count() {
        if !text.is_empty() {
            text.push_str(", ");
        }
        let _ = write!(text, "in{slot}={}", node.input_layout(slot).key());
    }
    for (port, layout) in node.outputs().iter().enumerate() {
        if !text.is_empty() {
            text.push_str(", ");
        }
        let _ = write!(text, "out{port}={}", layout.key());
    }
    text
}
