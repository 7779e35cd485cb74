use crate::layout::Layout;
use crate::registry::BackendKind;

use super::{validate_topology, Edge, FusedOp, Graph, Node, NodeId, OpAttrs, OpKind, TopologyError};

/// Description of one node handed to [`GraphBuilder::add`].
#[derive(Debug, Clone)]
pub struct NodeSpec {
    name: String,
    op: OpKind,
    inputs: Vec<Edge>,
    outputs: Vec<Layout>,
    attrs: OpAttrs,
    fused: Vec<FusedOp>,
    pinned: Option<BackendKind>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, op: OpKind) -> Self {
        Self {
            name: name.into(),
            op,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: OpAttrs::None,
            fused: Vec::new(),
            pinned: None,
        }
    }

    pub fn input(mut self, edge: impl Into<Edge>) -> Self {
        self.inputs.push(edge.into());
        self
    }

    pub fn inputs<I, E>(mut self, edges: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Edge>,
    {
        self.inputs.extend(edges.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, layout: Layout) -> Self {
        self.outputs.push(layout);
        self
    }

    pub fn attrs(mut self, attrs: OpAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn fuse(mut self, fused: FusedOp) -> Self {
        self.fused.push(fused);
        self
    }

    pub fn pin(mut self, kind: BackendKind) -> Self {
        self.pinned = Some(kind);
        self
    }
}

/// Appends nodes in processing order and validates the result.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: NodeSpec) -> NodeId {
        let id = NodeId(self.graph.len() as u32);
        let mut node = Node::new(id, spec.name, spec.op, spec.inputs, spec.outputs);
        node.attrs = spec.attrs;
        node.fused = spec.fused;
        node.pinned = spec.pinned;
        self.graph.push(node)
    }

    /// Graph input with a single output layout.
    pub fn input(&mut self, name: impl Into<String>, layout: Layout) -> NodeId {
        self.add(NodeSpec::new(name, OpKind::Input).output(layout))
    }

    pub fn constant(&mut self, name: impl Into<String>, layout: Layout) -> NodeId {
        self.add(NodeSpec::new(name, OpKind::Constant).output(layout))
    }

    /// Single-output node reading output 0 of each of `inputs`.
    pub fn op(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        inputs: &[NodeId],
        output: Layout,
    ) -> NodeId {
        self.add(
            NodeSpec::new(name, op)
                .inputs(inputs.iter().copied())
                .output(output),
        )
    }

    pub fn finish(self) -> Result<Graph, TopologyError> {
        let mut graph = self.graph;
        validate_topology(&graph)?;
        let ids = graph.processing_order().to_vec();
        for id in ids {
            graph.refresh_shape_class(id);
        }
        Ok(graph)
    }
}
