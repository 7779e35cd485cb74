//! Node arena the selection passes operate on.
//!
//! Nodes live in a flat arena addressed by stable [`NodeId`]s and are never
//! removed while compiling, so ids stay valid across edge edits. The
//! processing order is a separate topologically sorted id list; inserting a
//! reorder places it immediately before the consumer that required it.

mod builder;
mod op;
mod topology;

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::layout::{DType, Format, Layout, ShapeClass};
use crate::registry::{BackendKind, FormatPreference, ImplHandle};

pub use builder::{GraphBuilder, NodeSpec};
pub use op::{
    ConvAttrs, FusedOp, NormAttrs, OpAttrs, OpKind, PermuteAttrs, ReorderAttrs, ReorderReason,
    StateAttrs,
};
pub use topology::{validate_topology, TopologyError};

/// Stable index of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Producer side of a data edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub node: NodeId,
    pub port: usize,
}

impl Edge {
    pub fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

impl From<NodeId> for Edge {
    fn from(node: NodeId) -> Self {
        Edge::new(node, 0)
    }
}

/// One operation together with everything selection has decided about it.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    op: OpKind,
    attrs: OpAttrs,
    deps: Vec<Edge>,
    users: Vec<NodeId>,
    outputs: Vec<Layout>,
    preferred_inputs: Vec<Format>,
    preferred_input_types: Vec<Option<DType>>,
    preferred_outputs: Vec<Format>,
    fused: Vec<FusedOp>,
    pinned: Option<BackendKind>,
    selected: Option<BackendKind>,
    implementation: Option<ImplHandle>,
    shape_class: ShapeClass,
    eliminable: bool,
    layout_valid: bool,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Name given at construction; inserted reorders derive theirs from the
    /// producer they read.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn attrs(&self) -> &OpAttrs {
        &self.attrs
    }

    /// Input edges in slot order.
    pub fn deps(&self) -> &[Edge] {
        &self.deps
    }

    /// Nodes reading any output of this one, without duplicates.
    pub fn users(&self) -> &[NodeId] {
        &self.users
    }

    pub fn outputs(&self) -> &[Layout] {
        &self.outputs
    }

    /// Layout of output `port`. Panics when the port does not exist.
    pub fn output_layout(&self, port: usize) -> &Layout {
        &self.outputs[port]
    }

    /// Preferred format for an input slot, `Format::Any` when unset.
    pub fn preferred_input(&self, slot: usize) -> Format {
        self.preferred_inputs
            .get(slot)
            .copied()
            .unwrap_or(Format::Any)
    }

    /// Element type a descriptor asked to read on `slot`, if any.
    pub fn preferred_input_type(&self, slot: usize) -> Option<DType> {
        self.preferred_input_types.get(slot).copied().flatten()
    }

    /// Preferred format for an output port, `Format::Any` when unset.
    pub fn preferred_output(&self, port: usize) -> Format {
        self.preferred_outputs
            .get(port)
            .copied()
            .unwrap_or(Format::Any)
    }

    /// Operations folded into this node, in application order.
    pub fn fused(&self) -> &[FusedOp] {
        &self.fused
    }

    /// Backend kind explicitly requested for this node, if any.
    pub fn pinned_kind(&self) -> Option<BackendKind> {
        self.pinned
    }

    /// Backend kind of the candidate recorded by format propagation or the build.
    pub fn selected_kind(&self) -> Option<BackendKind> {
        self.selected
    }

    /// Built implementation; `None` until parallel compile stores one.
    pub fn implementation(&self) -> Option<&ImplHandle> {
        self.implementation.as_ref()
    }

    /// Shape classification cached by the last pass that refreshed it.
    pub fn shape_class(&self) -> ShapeClass {
        self.shape_class
    }

    /// Set on permutes that format propagation folded into their producer.
    pub fn is_eliminable(&self) -> bool {
        self.eliminable
    }

    pub fn is_constant(&self) -> bool {
        self.op == OpKind::Constant
    }

    pub fn is_reorder(&self) -> bool {
        self.op == OpKind::Reorder
    }

    /// Reorders that expose a shared memory surface are never repaired or
    /// reconciled; their consumers read the surface as is.
    pub fn is_shared_surface(&self) -> bool {
        matches!(&self.attrs, OpAttrs::Reorder(attrs) if attrs.shared_surface)
    }

    /// False once an input edge or preference changed since the output
    /// layout was last resolved.
    pub fn layout_valid(&self) -> bool {
        self.layout_valid
    }

    /// Restricts selection to one backend kind, or lifts the restriction.
    pub fn set_pinned_kind(&mut self, kind: Option<BackendKind>) {
        self.pinned = kind;
    }

    pub(crate) fn set_selected_kind(&mut self, kind: Option<BackendKind>) {
        self.selected = kind;
    }

    pub(crate) fn set_implementation(&mut self, handle: ImplHandle) {
        self.selected = Some(handle.kind());
        self.implementation = Some(handle);
    }

    pub(crate) fn set_eliminable(&mut self, eliminable: bool) {
        self.eliminable = eliminable;
    }

    pub(crate) fn set_preferred_input(&mut self, slot: usize, format: Format) {
        if self.preferred_inputs.len() <= slot {
            self.preferred_inputs.resize(slot + 1, Format::Any);
        }
        self.preferred_inputs[slot] = format;
    }

    pub(crate) fn set_preferred_output(&mut self, port: usize, format: Format) {
        if self.preferred_outputs.len() <= port {
            self.preferred_outputs.resize(port + 1, Format::Any);
        }
        self.preferred_outputs[port] = format;
    }

    /// Records a descriptor's opinion; unset slots keep their previous value.
    pub(crate) fn apply_preference(&mut self, preference: &FormatPreference) {
        for (slot, format) in preference.inputs.iter().enumerate() {
            if format.is_resolved() {
                self.set_preferred_input(slot, *format);
            }
        }
        for (slot, dtype) in preference.input_types.iter().enumerate() {
            if let Some(dtype) = dtype {
                if self.preferred_input_types.len() <= slot {
                    self.preferred_input_types.resize(slot + 1, None);
                }
                self.preferred_input_types[slot] = Some(*dtype);
            }
        }
        for (port, format) in preference.outputs.iter().enumerate() {
            if format.is_resolved() {
                self.set_preferred_output(port, *format);
            }
        }
    }

    pub(crate) fn preferred_formats(&self) -> (Vec<Format>, Vec<Format>) {
        (self.preferred_inputs.clone(), self.preferred_outputs.clone())
    }

    pub(crate) fn restore_preferred_formats(&mut self, inputs: Vec<Format>, outputs: Vec<Format>) {
        self.preferred_inputs = inputs;
        self.preferred_outputs = outputs;
    }

    pub(crate) fn set_output_format(&mut self, port: usize, format: Format) {
        self.outputs[port].format = format;
    }
}

/// Tensor-operation graph with stable node identities.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    order: Vec<NodeId>,
}

impl Graph {
    /// Number of nodes, including inserted reorders.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the node when `id` belongs to this graph.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Returns the node for an id handed out by this graph.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Mutable access for setting pins before compiling.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Topologically sorted node ids.
    pub fn processing_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes in processing order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order.iter().map(move |id| self.node(*id))
    }

    /// First node called `name`.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .map(|node| node.id)
    }

    /// Read-only view of the node for capability checks.
    pub fn view(&self, id: NodeId) -> NodeView<'_> {
        NodeView {
            graph: self,
            node: self.node(id),
            strip_padding: false,
        }
    }

    /// View of the node as it reads its inputs once reorder insertion has
    /// stripped batch and spatial padding for a vendor routine.
    pub fn stripped_view(&self, id: NodeId) -> NodeView<'_> {
        NodeView {
            graph: self,
            node: self.node(id),
            strip_padding: true,
        }
    }

    /// Node feeding input `slot` of `consumer`.
    pub fn producer(&self, consumer: NodeId, slot: usize) -> &Node {
        self.node(self.node(consumer).deps[slot].node)
    }

    /// Layout the producer side of `edge` emits.
    pub fn producer_layout(&self, edge: Edge) -> &Layout {
        self.node(edge.node).output_layout(edge.port)
    }

    /// Layout as produced on the edge feeding `slot` of `consumer`.
    pub fn input_layout(&self, consumer: NodeId, slot: usize) -> &Layout {
        self.producer_layout(self.node(consumer).deps[slot])
    }

    /// Input slots whose producer is not a constant.
    pub fn real_inputs(&self, id: NodeId) -> Vec<usize> {
        self.node(id)
            .deps
            .iter()
            .enumerate()
            .filter(|(_, edge)| !self.node(edge.node).is_constant())
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Classification from the node's current input and output layouts.
    pub fn shape_class_of(&self, id: NodeId) -> ShapeClass {
        let node = self.node(id);
        let inputs = node.deps.iter().map(|edge| self.producer_layout(*edge));
        ShapeClass::classify(inputs.chain(node.outputs.iter()))
    }

    /// Recomputes and caches the node's shape class.
    pub fn refresh_shape_class(&mut self, id: NodeId) -> ShapeClass {
        let class = self.shape_class_of(id);
        self.node_mut(id).shape_class = class;
        class
    }

    /// `#id (name)`, as used in logs and errors.
    pub fn describe(&self, id: NodeId) -> String {
        match self.get(id) {
            Some(node) => format!("{} ({})", id, node.name),
            None => id.to_string(),
        }
    }

    /// Marks the node's output layout stale along with its users.
    pub fn invalidate_layout(&mut self, id: NodeId) {
        self.node_mut(id).layout_valid = false;
        let users = self.node(id).users.clone();
        for user in users {
            self.node_mut(user).layout_valid = false;
        }
    }

    /// Recomputes the output formats of a stale node.
    ///
    /// Preferred output formats win; an already chosen format is kept;
    /// unresolved outputs inherit the first real input with a matching
    /// dimension class or fall back to the rank's default format. Users are
    /// invalidated when anything changed.
    pub fn resolve_output_layout(&mut self, id: NodeId) -> bool {
        if self.node(id).layout_valid {
            return false;
        }
        let mut changed = false;
        for port in 0..self.node(id).outputs.len() {
            let current = self.node(id).outputs[port].clone();
            let preferred = self.node(id).preferred_output(port);
            let format = if preferred.accepts_rank(current.rank()) {
                preferred
            } else if current.format.is_resolved() {
                current.format
            } else {
                self.inherited_format(id, current.rank())
                    .unwrap_or_else(|| Format::default_for_rank(current.rank()))
            };
            if format != current.format {
                self.node_mut(id).set_output_format(port, format);
                changed = true;
            }
        }
        self.node_mut(id).layout_valid = true;
        self.refresh_shape_class(id);
        if changed {
            log::trace!("resolved output layout of {}", self.describe(id));
            let users = self.node(id).users.clone();
            for user in users {
                self.node_mut(user).layout_valid = false;
            }
        }
        changed
    }

    fn inherited_format(&self, id: NodeId, rank: usize) -> Option<Format> {
        self.node(id)
            .deps
            .iter()
            .filter(|edge| !self.node(edge.node).is_constant())
            .map(|edge| self.producer_layout(*edge).format)
            .find(|format| format.accepts_rank(rank))
    }

    /// Forces an output format and its matching preference.
    pub(crate) fn force_output_format(&mut self, id: NodeId, port: usize, format: Format) {
        let node = self.node_mut(id);
        node.set_output_format(port, format);
        node.set_preferred_output(port, format);
        node.layout_valid = true;
        let users = node.users.clone();
        for user in users {
            self.node_mut(user).layout_valid = false;
        }
        self.refresh_shape_class(id);
    }

    /// Interposes a reorder producing `target` on the edge feeding
    /// `consumer`'s input `slot`, returning the reorder's id.
    pub(crate) fn insert_reorder(
        &mut self,
        consumer: NodeId,
        slot: usize,
        target: Layout,
        reason: ReorderReason,
    ) -> NodeId {
        let edge = self.node(consumer).deps[slot];
        let source = self.producer_layout(edge).clone();
        let id = NodeId(self.nodes.len() as u32);
        let name = format!("{}_{}_reorder{}", self.node(edge.node).name, reason_tag(reason), id.0);
        let mut node = Node::new(id, name, OpKind::Reorder, vec![edge], vec![target]);
        node.attrs = OpAttrs::Reorder(ReorderAttrs {
            source_format: source.format,
            source_dtype: source.dtype,
            reason,
            shared_surface: false,
        });
        node.layout_valid = true;
        self.nodes.push(node);
        self.refresh_shape_class(id);

        self.node_mut(edge.node).users.push(id);
        self.reroute_input(consumer, slot, id);

        let position = self
            .order
            .iter()
            .position(|candidate| *candidate == consumer)
            .unwrap_or(self.order.len());
        self.order.insert(position, id);
        id
    }

    /// Points `consumer`'s input `slot` at output 0 of `producer`.
    pub(crate) fn reroute_input(&mut self, consumer: NodeId, slot: usize, producer: NodeId) {
        self.reroute_edge(consumer, slot, Edge::new(producer, 0));
    }

    /// Points `consumer`'s input `slot` at `edge`, keeping user lists in step.
    pub(crate) fn reroute_edge(&mut self, consumer: NodeId, slot: usize, edge: Edge) {
        let previous = self.node(consumer).deps[slot].node;
        self.node_mut(consumer).deps[slot] = edge;
        let still_used = self.node(consumer).deps.iter().any(|dep| dep.node == previous);
        if !still_used {
            self.node_mut(previous).users.retain(|user| *user != consumer);
        }
        let users = &mut self.node_mut(edge.node).users;
        if !users.contains(&consumer) {
            users.push(consumer);
        }
        self.node_mut(consumer).layout_valid = false;
    }

    /// Replaces the layout an existing reorder produces. The reorder keeps
    /// reading the same edge; its users see the new layout.
    pub(crate) fn retarget_reorder(&mut self, id: NodeId, target: Layout) {
        self.node_mut(id).outputs[0] = target;
        self.refresh_shape_class(id);
        let users = self.node(id).users.clone();
        for user in users {
            self.node_mut(user).layout_valid = false;
        }
    }

    /// Reorder nodes in processing order.
    pub fn reorders(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes().filter(|node| node.is_reorder())
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = node.id;
        for edge in &node.deps {
            if let Some(producer) = self.nodes.get_mut(edge.node.index()) {
                if !producer.users.contains(&id) {
                    producer.users.push(id);
                }
            }
        }
        self.nodes.push(node);
        self.order.push(id);
        id
    }
}

fn reason_tag(reason: ReorderReason) -> &'static str {
    match reason {
        ReorderReason::FormatMismatch => "fmt",
        ReorderReason::TypeConversion => "cvt",
        ReorderReason::FusedDependency => "fused",
        ReorderReason::StripSpatialPadding | ReorderReason::StripPadding => "unpad",
        ReorderReason::SharedSurface => "surface",
    }
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        op: OpKind,
        deps: Vec<Edge>,
        outputs: Vec<Layout>,
    ) -> Self {
        Self {
            id,
            name,
            op,
            attrs: OpAttrs::None,
            deps,
            users: Vec::new(),
            outputs,
            preferred_inputs: Vec::new(),
            preferred_input_types: Vec::new(),
            preferred_outputs: Vec::new(),
            fused: Vec::new(),
            pinned: None,
            selected: None,
            implementation: None,
            shape_class: ShapeClass::Static,
            eliminable: false,
            layout_valid: false,
        }
    }
}

/// Read-only window on one node and the layouts feeding it, as handed to
/// capability descriptors.
#[derive(Clone, Copy)]
pub struct NodeView<'a> {
    graph: &'a Graph,
    node: &'a Node,
    strip_padding: bool,
}

impl<'a> NodeView<'a> {
    /// Graph the node lives in.
    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn op(&self) -> OpKind {
        self.node.op
    }

    pub fn attrs(&self) -> &'a OpAttrs {
        &self.node.attrs
    }

    pub fn fused(&self) -> &'a [FusedOp] {
        &self.node.fused
    }

    pub fn outputs(&self) -> &'a [Layout] {
        &self.node.outputs
    }

    pub fn output_layout(&self, port: usize) -> &'a Layout {
        &self.node.outputs[port]
    }

    /// Number of input slots, constants included.
    pub fn input_count(&self) -> usize {
        self.node.deps.len()
    }

    pub fn producer(&self, slot: usize) -> &'a Node {
        self.graph.node(self.node.deps[slot].node)
    }

    pub fn is_constant_input(&self, slot: usize) -> bool {
        self.producer(slot).is_constant()
    }

    /// Input slots fed by non-constant producers.
    pub fn real_inputs(&self) -> impl Iterator<Item = usize> + 'a {
        let graph = self.graph;
        self.node
            .deps
            .iter()
            .enumerate()
            .filter(move |(_, edge)| !graph.node(edge.node).is_constant())
            .map(|(slot, _)| slot)
    }

    /// Layout the node will read on `slot` once required reorders exist.
    ///
    /// The producer's layout is overridden by the node's preferred input
    /// format and element type. Convolution-like consumers never have their
    /// input type overridden. A stripped view also drops batch and spatial
    /// padding from real inputs that are not shared surfaces.
    pub fn input_layout(&self, slot: usize) -> Cow<'a, Layout> {
        let raw = self.graph.producer_layout(self.node.deps[slot]);
        let format = match self.node.preferred_input(slot) {
            Format::Any => raw.format,
            preferred => preferred,
        };
        let dtype = match self.node.preferred_input_type(slot) {
            Some(dtype) if !self.node.op.is_conv_like() => dtype,
            _ => raw.dtype,
        };
        let producer = self.producer(slot);
        let strip = self.strip_padding
            && !producer.is_constant()
            && !producer.is_shared_surface()
            && (raw.padding.has_batch_padding() || raw.padding.has_spatial_padding());
        if format == raw.format && dtype == raw.dtype && !strip {
            return Cow::Borrowed(raw);
        }
        let mut layout = raw.clone().with_format(format).with_dtype(dtype);
        if strip {
            layout = layout.with_padding(raw.padding.feature_only());
        }
        Cow::Owned(layout)
    }

    /// Shape class computed from the current layouts, not the cached one.
    pub fn shape_class(&self) -> ShapeClass {
        self.graph.shape_class_of(self.node.id)
    }

    pub fn describe(&self) -> String {
        self.graph.describe(self.node.id)
    }
}

impl fmt::Debug for NodeView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeView")
            .field("id", &self.node.id)
            .field("name", &self.node.name)
            .field("op", &self.node.op)
            .finish()
    }
}
