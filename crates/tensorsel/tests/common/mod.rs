#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;

use tensorsel::exec::SerialExecutor;
use tensorsel::graph::{Graph, NodeId, NodeView, OpAttrs, ReorderReason};
use tensorsel::layout::{DType, Dimension, Format, Layout, Shape};
use tensorsel::passes::{GraphPass, PassContext};
use tensorsel::registry::ImplDescriptor;
use tensorsel::trace::RecordingSink;
use tensorsel::{
    compile_with_sink, BackendKind, CompileConfig, CompileResult, Descriptor, ImplHandle,
    ImplRegistry, Implementation, OpKind, RegistryBuilder,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug)]
pub struct MockImpl {
    kind: BackendKind,
    name: String,
}

impl Implementation for MockImpl {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn mock_build(descriptor: &Descriptor, _node: &NodeView<'_>) -> anyhow::Result<ImplHandle> {
    Ok(Arc::new(MockImpl {
        kind: descriptor.kind(),
        name: descriptor.name().to_string(),
    }))
}

/// Descriptor accepting every node its shape support allows.
pub fn accept(name: &str, kind: BackendKind) -> Descriptor {
    Descriptor::new(name, kind, mock_build)
}

/// Descriptor that validates but fails to build.
pub fn broken(name: &str, kind: BackendKind) -> Descriptor {
    Descriptor::new(name, kind, |descriptor, node| {
        anyhow::bail!("{} ran out of kernel memory for {}", descriptor.name(), node.describe())
    })
}

/// Graph inputs, buffers and reorders are always buildable.
pub fn base_registry() -> RegistryBuilder {
    let mut builder = RegistryBuilder::new();
    builder
        .register(OpKind::Input, accept("input", BackendKind::Generic))
        .register(OpKind::MutableBuffer, accept("buffer", BackendKind::Generic))
        .register(OpKind::Reorder, accept("reorder", BackendKind::Generic));
    builder
}

pub fn f32(dims: &[usize], format: Format) -> Layout {
    Layout::of(dims, DType::F32, format)
}

/// Layout with `None` entries as dynamic axes.
pub fn dynamic(dims: &[Option<usize>], format: Format) -> Layout {
    let dims: Vec<Dimension> = dims
        .iter()
        .enumerate()
        .map(|(axis, dim)| match dim {
            Some(extent) => Dimension::Static(*extent),
            None => Dimension::dynamic(format!("d{axis}")),
        })
        .collect();
    Layout::new(Shape::new(dims), DType::F32, format)
}

pub fn no_batch_or_spatial_padding(node: &NodeView<'_>) -> bool {
    node.real_inputs().all(|slot| {
        let layout = node.input_layout(slot);
        !layout.padding.has_batch_padding() && !layout.padding.has_spatial_padding()
    })
}

pub fn run_pass<P: GraphPass>(
    pass: P,
    graph: &mut Graph,
    registry: &ImplRegistry,
    config: CompileConfig,
) -> (CompileResult<tensorsel::passes::PassResult>, RecordingSink) {
    let sink = RecordingSink::new();
    let result = {
        let mut cx = PassContext::new(registry, config, &SerialExecutor, &sink);
        pass.run(graph, &mut cx)
    };
    (result, sink)
}

pub fn compile_recorded(
    graph: &mut Graph,
    registry: &ImplRegistry,
    config: CompileConfig,
) -> (CompileResult<tensorsel::passes::PassResult>, RecordingSink) {
    let sink = RecordingSink::new();
    let result = compile_with_sink(graph, registry, config, &sink);
    (result, sink)
}

pub fn impl_name(graph: &Graph, id: NodeId) -> Option<String> {
    graph
        .node(id)
        .implementation()
        .map(|handle| handle.name().to_string())
}

pub fn impl_kind(graph: &Graph, id: NodeId) -> Option<BackendKind> {
    graph.node(id).implementation().map(|handle| handle.kind())
}

pub fn reorder_count(graph: &Graph, reason: ReorderReason) -> usize {
    graph
        .reorders()
        .filter(|node| matches!(node.attrs(), OpAttrs::Reorder(attrs) if attrs.reason == reason))
        .count()
}

/// Every real edge delivers the format its consumer asked for.
pub fn assert_edges_agree(graph: &Graph) {
    for node in graph.nodes() {
        for (slot, edge) in node.deps().iter().enumerate() {
            let producer = graph.node(edge.node);
            if producer.is_constant() || producer.is_shared_surface() {
                continue;
            }
            let produced = producer.output_layout(edge.port);
            let required = node.preferred_input(slot);
            if required.is_resolved() {
                assert_eq!(
                    produced.format,
                    required.adapt_to_rank(produced.rank()),
                    "edge {} -> {}[{slot}] disagrees",
                    graph.describe(edge.node),
                    graph.describe(node.id())
                );
            }
        }
    }
}

/// Number of reorders between `consumer`'s input `slot` and the first
/// producer that is not a reorder.
pub fn reorders_on_edge(graph: &Graph, consumer: NodeId, slot: usize) -> usize {
    let mut count = 0;
    let mut producer = graph.producer(consumer, slot);
    while producer.is_reorder() && !producer.is_shared_surface() {
        count += 1;
        producer = graph.producer(producer.id(), 0);
    }
    count
}

/// No edge between two non-reorder nodes carries more than one reorder.
pub fn assert_single_reorder_per_edge(graph: &Graph) {
    for node in graph.nodes().filter(|node| !node.is_reorder()) {
        for slot in 0..node.deps().len() {
            let count = reorders_on_edge(graph, node.id(), slot);
            assert!(
                count <= 1,
                "input {slot} of {} carries {count} reorders",
                graph.describe(node.id())
            );
        }
    }
}
