use std::collections::{HashMap, HashSet};

use crate::error::{CompileError, CompileResult};
use crate::graph::{Edge, Graph, NodeId, OpAttrs, OpKind, ReorderReason};
use crate::layout::{DType, Format, Layout};
use crate::registry::{BackendKind, KindMask};
use crate::trace::CompileEvent;

use super::{GraphPass, PassContext, PassResult};

/// Makes every edge agree on layout, inserting at most one reorder per edge.
///
/// Nodes are visited in processing order. For each node the pass first
/// applies the targeted repairs (state type conversion, fused constant
/// operands, normalization and vendor padding), then makes sure some
/// descriptor accepts the node, adopting a dependency's format or a default
/// format when none does, and finally reconciles every real input with the
/// format the node requires on that slot. A repair that lands on an edge
/// already holding a reorder from the same run changes that reorder's target
/// rather than adding another one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReorderInsertion;

impl ReorderInsertion {
    const NAME: &'static str = "reorder_insertion";
}

impl GraphPass for ReorderInsertion {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> CompileResult<PassResult> {
        let mut sweep = Sweep {
            cx: &*cx,
            reorders: HashMap::new(),
            created: HashSet::new(),
            result: PassResult::default(),
        };
        let order = graph.processing_order().to_vec();
        for id in order {
            let node = graph.node(id);
            if node.deps().is_empty() || node.is_reorder() {
                continue;
            }
            sweep.visit(graph, id)?;
        }

        let result = sweep.result;
        log::debug!(
            "{}: {} reorders, {} demotions",
            Self::NAME,
            result.reorders_inserted,
            result.demotions
        );
        cx.emit(CompileEvent::PassFinished {
            pass: Self::NAME.to_string(),
            changed: result.changed,
        });
        Ok(result)
    }
}

struct Sweep<'c, 'a> {
    cx: &'c PassContext<'a>,
    /// Reorders created during this run, keyed by source edge and target.
    reorders: HashMap<(Edge, Layout), NodeId>,
    created: HashSet<NodeId>,
    result: PassResult,
}

impl Sweep<'_, '_> {
    fn visit(&mut self, graph: &mut Graph, id: NodeId) -> CompileResult<()> {
        graph.resolve_output_layout(id);
        self.convert_state_write(graph, id);
        if self.cx.config().optimize_layout {
            self.reorder_fused_constants(graph, id);
        }
        self.unpad_normalization_input(graph, id);
        self.strip_vendor_padding(graph, id);
        self.ensure_legal_layout(graph, id)?;
        self.reconcile_inputs(graph, id);
        Ok(())
    }

    fn insert(
        &mut self,
        graph: &mut Graph,
        consumer: NodeId,
        slot: usize,
        target: Layout,
        reason: ReorderReason,
    ) -> NodeId {
        let current = graph.node(consumer).deps()[slot].node;
        if self.created.contains(&current)
            && self.retarget(graph, consumer, slot, current, &target)
        {
            return current;
        }

        let edge = graph.node(consumer).deps()[slot];
        let key = (edge, target.clone());
        if let Some(&existing) = self.reorders.get(&key) {
            log::trace!(
                "{} reuses reorder {} on {}",
                graph.describe(consumer),
                existing,
                edge.node
            );
            graph.reroute_input(consumer, slot, existing);
            self.result.changed = true;
            return existing;
        }

        let source = graph.producer_layout(edge).key();
        let target_key = target.key();
        let reorder = graph.insert_reorder(consumer, slot, target, reason);
        self.reorders.insert(key, reorder);
        self.created.insert(reorder);
        self.result.reorders_inserted += 1;
        self.result.changed = true;
        self.cx.emit(CompileEvent::ReorderInserted {
            reorder,
            producer: edge.node,
            consumer,
            slot,
            source,
            target: target_key,
            reason,
        });
        reorder
    }

    /// Folds a later repair on `slot` into the reorder this run already put
    /// there, so an edge never carries two reorders in a row. A reorder that
    /// also feeds other slots or consumers stays as it is; `slot` is pointed
    /// back at the reorder's source and `false` tells the caller to insert a
    /// fresh one there.
    fn retarget(
        &mut self,
        graph: &mut Graph,
        consumer: NodeId,
        slot: usize,
        reorder: NodeId,
        target: &Layout,
    ) -> bool {
        let source = graph.node(reorder).deps()[0];
        let shared = graph.node(reorder).users().iter().any(|user| *user != consumer)
            || graph
                .node(consumer)
                .deps()
                .iter()
                .enumerate()
                .any(|(other, edge)| other != slot && edge.node == reorder);
        if shared {
            graph.reroute_edge(consumer, slot, source);
            return false;
        }

        log::trace!(
            "{} retargets {} to {}",
            graph.describe(consumer),
            reorder,
            target.key()
        );
        self.reorders.retain(|_, existing| *existing != reorder);
        self.reorders.insert((source, target.clone()), reorder);
        graph.retarget_reorder(reorder, target.clone());
        self.result.changed = true;
        true
    }

    fn convert_state_write(&mut self, graph: &mut Graph, id: NodeId) {
        let OpAttrs::StateWrite(attrs) = graph.node(id).attrs() else {
            return;
        };
        let declared = attrs.declared;
        let source = graph.input_layout(id, 0);
        if source.dtype == declared {
            return;
        }
        let target = source
            .clone()
            .with_format(required_format(graph, id, 0))
            .with_dtype(declared);
        self.insert(graph, id, 0, target, ReorderReason::TypeConversion);
        graph.invalidate_layout(id);
        graph.resolve_output_layout(id);
    }

    fn reorder_fused_constants(&mut self, graph: &mut Graph, id: NodeId) {
        let node = graph.node(id);
        let slots: Vec<usize> = node
            .fused()
            .iter()
            .filter_map(|fused| fused.outer_dep)
            .filter(|slot| *slot < node.deps().len())
            .collect();
        if slots.is_empty() {
            return;
        }
        let output = node.output_layout(0).clone();
        for slot in slots {
            if !graph.producer(id, slot).is_constant() {
                continue;
            }
            let operand = graph.input_layout(id, slot).clone();
            let count = operand.element_count();
            let broadcast = count == Some(1) || (count.is_some() && count == output.feature_count());
            if broadcast {
                continue;
            }
            let format = output.format.adapt_to_rank(operand.rank());
            if operand.format == format {
                continue;
            }
            let target = operand.with_format(format);
            self.insert(graph, id, slot, target, ReorderReason::FusedDependency);
        }
    }

    fn unpad_normalization_input(&mut self, graph: &mut Graph, id: NodeId) {
        if graph.node(id).op() != OpKind::Normalization {
            return;
        }
        for slot in graph.real_inputs(id) {
            let source = graph.input_layout(id, slot).clone();
            if !source.padding.has_spatial_padding() {
                continue;
            }
            let format = match graph.node(id).preferred_input(slot) {
                Format::Any => graph.node(id).output_layout(0).format,
                preferred => preferred,
            }
            .adapt_to_rank(source.rank());
            if !format.forbids_spatial_padding() {
                continue;
            }
            let padding = source.padding.without_spatial();
            let target = source
                .with_format(format)
                .with_dtype(required_dtype(graph, id, slot))
                .with_padding(padding);
            self.insert(graph, id, slot, target, ReorderReason::StripSpatialPadding);
        }
    }

    fn strip_vendor_padding(&mut self, graph: &mut Graph, id: NodeId) {
        let node = graph.node(id);
        if node.selected_kind().or(node.pinned_kind()) != Some(BackendKind::Vendor) {
            return;
        }
        for slot in graph.real_inputs(id) {
            if graph.producer(id, slot).is_shared_surface() {
                continue;
            }
            let source = graph.input_layout(id, slot).clone();
            if !source.padding.has_batch_padding() && !source.padding.has_spatial_padding() {
                continue;
            }
            let padding = source.padding.feature_only();
            let target = source
                .with_format(required_format(graph, id, slot))
                .with_dtype(required_dtype(graph, id, slot))
                .with_padding(padding);
            self.insert(graph, id, slot, target, ReorderReason::StripPadding);
        }
    }

    fn ensure_legal_layout(&mut self, graph: &mut Graph, id: NodeId) -> CompileResult<()> {
        let selector = self.cx.selector();
        let mut mask = KindMask::from_pin(graph.node(id).pinned_kind());
        let shape = graph.shape_class_of(id);
        if selector.is_node_supported(graph, id, mask, shape) {
            return Ok(());
        }

        let saved = Snapshot::take(graph, id);
        let rank = graph.node(id).output_layout(0).rank();
        let mut attempted = Vec::new();

        let mut dependency_formats: Vec<Format> = Vec::new();
        for slot in graph.real_inputs(id) {
            let format = graph.input_layout(id, slot).format;
            if format.accepts_rank(rank) && !dependency_formats.contains(&format) {
                dependency_formats.push(format);
            }
        }
        for format in dependency_formats {
            attempted.push(format);
            if self.try_format(graph, id, format, mask) {
                log::debug!("{} adopts dependency format {format}", graph.describe(id));
                return Ok(());
            }
            saved.restore(graph, id);
        }

        let op = graph.node(id).op();
        if shape.is_dynamic() && self.cx.registry().has_dynamic_support(op) {
            log::debug!(
                "{} keeps its layout; {op} has dynamic-shape implementations",
                graph.describe(id)
            );
            return Ok(());
        }

        if graph.node(id).pinned_kind() == Some(BackendKind::Vendor)
            && self.cx.config().allow_vendor_demotion
        {
            self.demote(graph, id, "no legal vendor layout");
            mask = KindMask::only(BackendKind::Generic);
            if selector.is_node_supported(graph, id, mask, graph.shape_class_of(id)) {
                return Ok(());
            }
        }

        for &format in Format::fallbacks_for_rank(rank) {
            if !attempted.contains(&format) {
                attempted.push(format);
            }
            if self.try_format(graph, id, format, mask) {
                log::debug!("{} falls back to {format}", graph.describe(id));
                return Ok(());
            }
            saved.restore(graph, id);
        }

        let dtype = graph.node(id).output_layout(0).dtype;
        let blamed = graph
            .real_inputs(id)
            .first()
            .map(|slot| graph.describe(graph.node(id).deps()[*slot].node))
            .unwrap_or_else(|| "none".to_string());
        let error = CompileError::LayoutUnresolved {
            node: graph.describe(id),
            kind: mask,
            attempted: describe_attempts(dtype, &attempted),
            blamed,
        };
        log::error!("{error}");
        Err(error)
    }

    /// Runs the node and its same-class real inputs in `format`, reporting
    /// whether a descriptor in `mask` then accepts it.
    fn try_format(&mut self, graph: &mut Graph, id: NodeId, format: Format, mask: KindMask) -> bool {
        for port in 0..graph.node(id).outputs().len() {
            let rank = graph.node(id).output_layout(port).rank();
            graph.force_output_format(id, port, format.adapt_to_rank(rank));
        }
        for slot in graph.real_inputs(id) {
            if format.accepts_rank(graph.input_layout(id, slot).rank()) {
                graph.node_mut(id).set_preferred_input(slot, format);
            }
        }
        let shape = graph.refresh_shape_class(id);
        let supported = self
            .cx
            .selector()
            .is_node_supported(graph, id, mask, shape);
        if supported {
            self.result.changed = true;
        }
        supported
    }

    fn demote(&mut self, graph: &mut Graph, id: NodeId, reason: &str) {
        let node = graph.node_mut(id);
        node.set_pinned_kind(Some(BackendKind::Generic));
        node.set_selected_kind(Some(BackendKind::Generic));
        log::warn!(
            "demoting {} from {} to {}: {reason}",
            graph.describe(id),
            BackendKind::Vendor,
            BackendKind::Generic
        );
        self.result.demotions += 1;
        self.result.changed = true;
        self.cx.emit(CompileEvent::KindDemoted {
            node: id,
            from: BackendKind::Vendor,
            to: BackendKind::Generic,
            reason: reason.to_string(),
        });
    }

    fn reconcile_inputs(&mut self, graph: &mut Graph, id: NodeId) {
        for slot in graph.real_inputs(id) {
            if graph.producer(id, slot).is_shared_surface() {
                continue;
            }
            let source = graph.input_layout(id, slot).clone();
            let format = required_format(graph, id, slot);
            let dtype = required_dtype(graph, id, slot);
            if format == source.format && dtype == source.dtype {
                continue;
            }
            let reason = if format != source.format {
                ReorderReason::FormatMismatch
            } else {
                ReorderReason::TypeConversion
            };
            let target = if self.created.contains(&graph.producer(id, slot).id()) {
                source.with_format(format).with_dtype(dtype)
            } else {
                Layout::new(source.shape, dtype, format)
            };
            self.insert(graph, id, slot, target, reason);
        }
    }
}

/// Format `id` reads on `slot`: its preference when set, else whatever the
/// producer emits.
fn required_format(graph: &Graph, id: NodeId, slot: usize) -> Format {
    let source = graph.input_layout(id, slot);
    match graph.node(id).preferred_input(slot) {
        Format::Any => source.format,
        preferred => preferred.adapt_to_rank(source.rank()),
    }
}

/// Convolution-like consumers always read the producer's element type.
fn required_dtype(graph: &Graph, id: NodeId, slot: usize) -> DType {
    let node = graph.node(id);
    let source = graph.input_layout(id, slot).dtype;
    if node.op().is_conv_like() {
        source
    } else {
        node.preferred_input_type(slot).unwrap_or(source)
    }
}

fn describe_attempts(dtype: DType, formats: &[Format]) -> String {
    formats
        .iter()
        .map(|format| format!("{dtype}:{format}"))
        .collect::<Vec<_>>()
        .join(", ")
}

struct Snapshot {
    outputs: Vec<Format>,
    preferred_inputs: Vec<Format>,
    preferred_outputs: Vec<Format>,
}

impl Snapshot {
    fn take(graph: &Graph, id: NodeId) -> Self {
        let node = graph.node(id);
        let (preferred_inputs, preferred_outputs) = node.preferred_formats();
        Self {
            outputs: node.outputs().iter().map(|layout| layout.format).collect(),
            preferred_inputs,
            preferred_outputs,
        }
    }

    fn restore(&self, graph: &mut Graph, id: NodeId) {
        let node = graph.node_mut(id);
        node.restore_preferred_formats(self.preferred_inputs.clone(), self.preferred_outputs.clone());
        for (port, format) in self.outputs.iter().enumerate() {
            node.set_output_format(port, *format);
        }
        graph.refresh_shape_class(id);
    }
}
