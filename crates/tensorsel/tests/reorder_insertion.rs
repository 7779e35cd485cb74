mod common;

use common::{
    accept, assert_edges_agree, assert_single_reorder_per_edge, base_registry, dynamic, f32,
    init_logging, mock_build, no_batch_or_spatial_padding, reorder_count, reorders_on_edge,
    run_pass,
};
use tensorsel::graph::{
    ConvAttrs, FusedOp, Graph, NodeSpec, NodeView, OpAttrs, ReorderAttrs, ReorderReason,
    StateAttrs,
};
use tensorsel::layout::{DType, Padding};
use tensorsel::passes::{FormatPropagation, PassResult, ReorderInsertion};
use tensorsel::registry::{FormatPreference, KeySet};
use tensorsel::trace::{CompileEvent, RecordingSink};
use tensorsel::{
    BackendKind, CompileConfig, CompileError, CompileResult, Descriptor, Format, GraphBuilder,
    ImplRegistry, OpKind,
};

fn prepare(
    graph: &mut Graph,
    registry: &ImplRegistry,
    config: CompileConfig,
) -> (CompileResult<PassResult>, RecordingSink) {
    let (propagated, _) = run_pass(FormatPropagation, graph, registry, config.clone());
    propagated.expect("format propagation succeeds");
    run_pass(ReorderInsertion, graph, registry, config)
}

fn with_f16_inputs(node: &NodeView<'_>) -> Option<FormatPreference> {
    Some(FormatPreference::uniform(node, Format::BFsYxFsv16).with_input_type(0, DType::F16))
}

fn blocked(op: OpKind, name: &str) -> Descriptor {
    accept(name, BackendKind::Vendor)
        .with_formats(|node| Some(FormatPreference::uniform(node, Format::BFsYxFsv16)))
        .with_attr_check(move |node| node.op() == op)
}

#[test]
fn mismatched_edge_gets_exactly_one_reorder() {
    init_logging();
    let mut registry = base_registry();
    registry.register(OpKind::Eltwise, blocked(OpKind::Eltwise, "vendor_eltwise"));
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", f32(&[1, 16, 8, 8], Format::Bfyx));
    let add = builder.op("add", OpKind::Eltwise, &[input], f32(&[1, 16, 8, 8], Format::Any));
    let mut graph = builder.finish().expect("valid graph");

    let (result, sink) = prepare(&mut graph, &registry, CompileConfig::default());
    let result = result.expect("reorder insertion succeeds");
    assert_eq!(result.reorders_inserted, 1);
    assert_eq!(sink.reorders(), 1);

    let edge = graph.node(add).deps()[0];
    let reorder = graph.node(edge.node);
    assert!(reorder.is_reorder());
    assert_eq!(reorder.deps()[0].node, input);
    assert_eq!(reorder.output_layout(0).format, Format::BFsYxFsv16);
    assert_eq!(reorder.output_layout(0).dtype, DType::F32);
    assert!(reorder.output_layout(0).padding.is_zero());

    let order = graph.processing_order();
    let reorder_at = order.iter().position(|id| *id == edge.node);
    let add_at = order.iter().position(|id| *id == add);
    assert_eq!(reorder_at.map(|at| at + 1), add_at);
    assert_edges_agree(&graph);

    match &sink.events()[0] {
        CompileEvent::ReorderInserted {
            producer,
            consumer,
            slot,
            reason,
            ..
        } => {
            assert_eq!((*producer, *consumer, *slot), (input, add, 0));
            assert_eq!(*reason, ReorderReason::FormatMismatch);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn insertion_is_idempotent() {
    let mut registry = base_registry();
    registry
        .register(OpKind::Eltwise, blocked(OpKind::Eltwise, "vendor_eltwise"))
        .register(OpKind::Softmax, accept("generic_softmax", BackendKind::Generic));
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", f32(&[1, 16, 8, 8], Format::Bfyx));
    let add = builder.op("add", OpKind::Eltwise, &[input], f32(&[1, 16, 8, 8], Format::Any));
    builder.op("probs", OpKind::Softmax, &[add], f32(&[1, 16, 8, 8], Format::Any));
    let mut graph = builder.finish().expect("valid graph");

    let (first, _) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(first.expect("first run").reorders_inserted, 1);
    let nodes_after_first = graph.len();

    let (second, sink) = run_pass(ReorderInsertion, &mut graph, &registry, CompileConfig::default());
    let second = second.expect("second run");
    assert_eq!(second.reorders_inserted, 0);
    assert_eq!(sink.reorders(), 0);
    assert_eq!(graph.len(), nodes_after_first);
    assert_edges_agree(&graph);
}

#[test]
fn consumers_share_one_reorder_per_conversion() {
    let mut registry = base_registry();
    registry.register(OpKind::Eltwise, blocked(OpKind::Eltwise, "vendor_eltwise"));
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", f32(&[1, 16, 8, 8], Format::Bfyx));
    let left = builder.op("left", OpKind::Eltwise, &[input], f32(&[1, 16, 8, 8], Format::Any));
    let right = builder.op("right", OpKind::Eltwise, &[input], f32(&[1, 16, 8, 8], Format::Any));
    let mut graph = builder.finish().expect("valid graph");

    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(result.expect("pass succeeds").reorders_inserted, 1);

    let shared = graph.node(left).deps()[0].node;
    assert_eq!(graph.node(right).deps()[0].node, shared);
    let mut users = graph.node(shared).users().to_vec();
    users.sort();
    assert_eq!(users, vec![left, right]);
    assert_eq!(graph.node(input).users(), [shared]);
}

#[test]
fn conv_like_consumers_keep_the_producer_type() {
    let mut registry = base_registry();
    registry
        .register(
            OpKind::Convolution,
            accept("vendor_conv", BackendKind::Vendor).with_formats(with_f16_inputs),
        )
        .register(
            OpKind::Eltwise,
            accept("vendor_eltwise", BackendKind::Vendor).with_formats(with_f16_inputs),
        );
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", f32(&[1, 16, 8, 8], Format::Bfyx));
    let weights = builder.constant("w", f32(&[16, 16, 3, 3], Format::Bfyx));
    let conv = builder.add(
        NodeSpec::new("conv", OpKind::Convolution)
            .inputs([input, weights])
            .output(f32(&[1, 16, 8, 8], Format::Any))
            .attrs(OpAttrs::Convolution(ConvAttrs::new(&[3, 3]))),
    );
    let scale = builder.op("scale", OpKind::Eltwise, &[input], f32(&[1, 16, 8, 8], Format::Any));
    let mut graph = builder.finish().expect("valid graph");

    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(result.expect("pass succeeds").reorders_inserted, 2);

    let conv_input = graph.producer(conv, 0).output_layout(0).clone();
    assert_eq!(conv_input.format, Format::BFsYxFsv16);
    assert_eq!(conv_input.dtype, DType::F32);
    // Weights are constants and never reordered here.
    assert_eq!(graph.node(conv).deps()[1].node, weights);

    let scale_input = graph.producer(scale, 0).output_layout(0).clone();
    assert_eq!(scale_input.format, Format::BFsYxFsv16);
    assert_eq!(scale_input.dtype, DType::F16);
}

#[test]
fn state_write_converts_to_declared_type() {
    let mut registry = base_registry();
    registry.register(OpKind::StateWrite, accept("generic_assign", BackendKind::Generic));
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", f32(&[1, 64], Format::Bfyx));
    let assign = builder.add(
        NodeSpec::new("assign", OpKind::StateWrite)
            .input(input)
            .output(tensorsel::Layout::of(&[1, 64], DType::F16, Format::Any))
            .attrs(OpAttrs::StateWrite(StateAttrs {
                variable: "kv_cache".to_string(),
                declared: DType::F16,
            })),
    );
    let mut graph = builder.finish().expect("valid graph");

    let (result, sink) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(result.expect("pass succeeds").reorders_inserted, 1);
    assert_eq!(reorder_count(&graph, ReorderReason::TypeConversion), 1);
    let converted = graph.producer(assign, 0).output_layout(0);
    assert_eq!(converted.dtype, DType::F16);
    assert_eq!(converted.format, Format::Bfyx);
    assert_eq!(sink.reorders(), 1);
}

fn reads_byxf(node: &NodeView<'_>) -> bool {
    node.input_layout(0).format == Format::Byxf
}

fn wide_reads_byxf(node: &NodeView<'_>) -> bool {
    node.node().name() != "wide" || reads_byxf(node)
}

fn state_write(
    builder: &mut GraphBuilder,
    name: &str,
    input: tensorsel::NodeId,
) -> tensorsel::NodeId {
    builder.add(
        NodeSpec::new(name, OpKind::StateWrite)
            .input(input)
            .output(f32(&[1, 64], Format::Any))
            .attrs(OpAttrs::StateWrite(StateAttrs {
                variable: format!("{name}_state"),
                declared: DType::F32,
            })),
    )
}

#[test]
fn late_format_choice_retargets_the_conversion_reorder() {
    init_logging();
    let mut registry = base_registry();
    registry.register(
        OpKind::StateWrite,
        accept("generic_assign", BackendKind::Generic).with_predicate(reads_byxf),
    );
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", tensorsel::Layout::of(&[1, 64], DType::F16, Format::Bfyx));
    let write = state_write(&mut builder, "write", input);
    let mut graph = builder.finish().expect("valid graph");

    let (result, sink) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(result.expect("pass succeeds").reorders_inserted, 1);
    assert_eq!(sink.reorders(), 1);
    assert_eq!(graph.reorders().count(), 1);
    assert_eq!(reorders_on_edge(&graph, write, 0), 1);
    assert_single_reorder_per_edge(&graph);

    let reorder = graph.producer(write, 0);
    assert_eq!(reorder.deps()[0].node, input);
    assert_eq!(reorder.output_layout(0).format, Format::Byxf);
    assert_eq!(reorder.output_layout(0).dtype, DType::F32);
    assert_eq!(graph.node(write).output_layout(0).format, Format::Byxf);
    assert_edges_agree(&graph);
}

#[test]
fn shared_conversion_is_left_alone_when_one_consumer_moves() {
    let mut registry = base_registry();
    registry.register(
        OpKind::StateWrite,
        accept("generic_assign", BackendKind::Generic).with_predicate(wide_reads_byxf),
    );
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", tensorsel::Layout::of(&[1, 64], DType::F16, Format::Bfyx));
    let keep = state_write(&mut builder, "keep", input);
    let wide = state_write(&mut builder, "wide", input);
    let mut graph = builder.finish().expect("valid graph");

    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(result.expect("pass succeeds").reorders_inserted, 2);
    assert_single_reorder_per_edge(&graph);

    let kept = graph.producer(keep, 0);
    assert_eq!(kept.output_layout(0).format, Format::Bfyx);
    assert_eq!(kept.output_layout(0).dtype, DType::F32);
    assert_eq!(kept.users(), [keep]);

    let moved = graph.producer(wide, 0);
    assert_ne!(moved.id(), kept.id());
    assert_eq!(moved.deps()[0].node, input);
    assert_eq!(moved.output_layout(0).format, Format::Byxf);
    assert_eq!(moved.output_layout(0).dtype, DType::F32);
    assert!(!graph.node(input).users().contains(&wide));
}

#[test]
fn vendor_padding_strip_folds_into_the_state_conversion() {
    let mut registry = base_registry();
    registry.register(
        OpKind::StateWrite,
        accept("vendor_assign", BackendKind::Vendor).with_predicate(no_batch_or_spatial_padding),
    );
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let padded = tensorsel::Layout::of(&[1, 16, 8, 8], DType::F16, Format::Bfyx)
        .with_padding(Padding::spatial(4, 1));
    let input = builder.input("x", padded);
    let write = builder.add(
        NodeSpec::new("write", OpKind::StateWrite)
            .input(input)
            .output(f32(&[1, 16, 8, 8], Format::Any))
            .attrs(OpAttrs::StateWrite(StateAttrs {
                variable: "cache".to_string(),
                declared: DType::F32,
            })),
    );
    let mut graph = builder.finish().expect("valid graph");

    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    let result = result.expect("pass succeeds");
    assert_eq!(result.reorders_inserted, 1);
    assert_eq!(result.demotions, 0);
    assert_eq!(graph.node(write).selected_kind(), Some(BackendKind::Vendor));
    assert_single_reorder_per_edge(&graph);

    let reorder = graph.producer(write, 0);
    assert_eq!(reorder.deps()[0].node, input);
    assert_eq!(reorder.output_layout(0).dtype, DType::F32);
    assert!(reorder.output_layout(0).padding.is_zero());
}

fn fused_graph() -> (Graph, ImplRegistry) {
    let mut registry = base_registry();
    registry.register(OpKind::Eltwise, blocked(OpKind::Eltwise, "vendor_eltwise"));
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", f32(&[1, 16, 8, 8], Format::Bfyx));
    let full = builder.constant("full", f32(&[1, 16, 8, 8], Format::Bfyx));
    let per_channel = builder.constant("per_channel", f32(&[1, 16, 1, 1], Format::Bfyx));
    let scalar = builder.constant("scalar", f32(&[1], Format::Bfyx));
    builder.add(
        NodeSpec::new("fused", OpKind::Eltwise)
            .inputs([input, full, per_channel, scalar])
            .output(f32(&[1, 16, 8, 8], Format::Any))
            .fuse(FusedOp::new(OpKind::Eltwise).with_outer_dep(1))
            .fuse(FusedOp::new(OpKind::Eltwise).with_outer_dep(2))
            .fuse(FusedOp::new(OpKind::Activation).with_outer_dep(3)),
    );
    (builder.finish().expect("valid graph"), registry)
}

#[test]
fn fused_constant_operands_follow_the_node_format() {
    let (mut graph, registry) = fused_graph();
    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    result.expect("pass succeeds");

    assert_eq!(reorder_count(&graph, ReorderReason::FusedDependency), 1);
    let fused = graph.find("fused").expect("fused node");
    let reordered = graph.producer(fused, 1);
    assert!(reordered.is_reorder());
    assert_eq!(reordered.output_layout(0).format, Format::BFsYxFsv16);
    // Broadcast operands stay as they are.
    assert!(graph.producer(fused, 2).is_constant());
    assert!(graph.producer(fused, 3).is_constant());
}

#[test]
fn fused_constants_are_left_alone_without_layout_optimization() {
    let (mut graph, registry) = fused_graph();
    let config = CompileConfig::default().with_optimize_layout(false);
    let (result, _) = prepare(&mut graph, &registry, config);
    result.expect("pass succeeds");
    assert_eq!(reorder_count(&graph, ReorderReason::FusedDependency), 0);
}

#[test]
fn normalization_reads_unpadded_copy_in_blocked_format() {
    let mut registry = base_registry();
    registry.register(
        OpKind::Normalization,
        blocked(OpKind::Normalization, "vendor_norm"),
    );
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let padded = f32(&[1, 16, 8, 8], Format::Bfyx).with_padding(Padding::spatial(4, 1));
    let input = builder.input("x", padded);
    let norm = builder.op("norm", OpKind::Normalization, &[input], f32(&[1, 16, 8, 8], Format::Any));
    let mut graph = builder.finish().expect("valid graph");

    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(result.expect("pass succeeds").reorders_inserted, 1);
    assert_eq!(reorder_count(&graph, ReorderReason::StripSpatialPadding), 1);

    let copy = graph.producer(norm, 0).output_layout(0);
    assert_eq!(copy.format, Format::BFsYxFsv16);
    assert!(!copy.padding.has_spatial_padding());
    assert_edges_agree(&graph);
}

fn vendor_conv_graph(padding: Padding) -> (Graph, tensorsel::NodeId) {
    let mut builder = GraphBuilder::new();
    let input = builder.input(
        "x",
        f32(&[1, 16, 8, 8], Format::Bfyx).with_padding(padding),
    );
    let weights = builder.constant("w", f32(&[16, 16, 3, 3], Format::Bfyx));
    let conv = builder.add(
        NodeSpec::new("conv", OpKind::Convolution)
            .inputs([input, weights])
            .output(f32(&[1, 16, 8, 8], Format::Any))
            .attrs(OpAttrs::Convolution(ConvAttrs::new(&[3, 3])))
            .pin(BackendKind::Vendor),
    );
    (builder.finish().expect("valid graph"), conv)
}

#[test]
fn vendor_conv_with_padded_input_gets_stripping_reorder() {
    let mut registry = base_registry();
    registry
        .register(
            OpKind::Convolution,
            accept("vendor_conv", BackendKind::Vendor).with_predicate(no_batch_or_spatial_padding),
        )
        .register(OpKind::Convolution, accept("generic_conv", BackendKind::Generic));
    let registry = registry.freeze();

    let (mut graph, conv) = vendor_conv_graph(Padding::new(&[0, 2, 1, 1], &[0, 2, 1, 1]));
    let (result, sink) = prepare(&mut graph, &registry, CompileConfig::default());
    let result = result.expect("pass succeeds");

    assert_eq!(result.demotions, 0);
    assert_eq!(graph.node(conv).pinned_kind(), Some(BackendKind::Vendor));
    assert_eq!(reorder_count(&graph, ReorderReason::StripPadding), 1);
    let stripped = graph.producer(conv, 0).output_layout(0);
    assert!(!stripped.padding.has_spatial_padding());
    assert!(stripped.padding.has_feature_padding());
    assert_eq!(sink.demotions(), 0);
}

#[test]
fn vendor_conv_without_legal_layout_is_demoted() {
    let mut registry = base_registry();
    registry
        .register(
            OpKind::Convolution,
            Descriptor::new("vendor_conv_f16", BackendKind::Vendor, mock_build)
                .with_keys(KeySet::new().with(DType::F16, &[Format::Bfyx, Format::BFsYxFsv16])),
        )
        .register(OpKind::Convolution, accept("generic_conv", BackendKind::Generic));
    let registry = registry.freeze();

    let (mut graph, conv) = vendor_conv_graph(Padding::default());
    let (result, sink) = prepare(&mut graph, &registry, CompileConfig::default());
    let result = result.expect("pass succeeds");

    assert_eq!(result.demotions, 1);
    assert_eq!(graph.node(conv).pinned_kind(), Some(BackendKind::Generic));
    assert_eq!(graph.node(conv).selected_kind(), Some(BackendKind::Generic));
    assert_eq!(sink.demotions(), 1);
    let demoted = sink
        .events()
        .into_iter()
        .find(|event| matches!(event, CompileEvent::KindDemoted { .. }));
    assert_eq!(
        demoted,
        Some(CompileEvent::KindDemoted {
            node: conv,
            from: BackendKind::Vendor,
            to: BackendKind::Generic,
            reason: "no legal vendor layout".to_string(),
        })
    );
}

#[test]
fn exhausted_layouts_fail_with_diagnostics() {
    let mut registry = base_registry();
    registry.register(
        OpKind::Convolution,
        Descriptor::new("vendor_conv_f16", BackendKind::Vendor, mock_build)
            .with_keys(KeySet::new().with(DType::F16, &[Format::Bfyx])),
    );
    let registry = registry.freeze();

    let (mut graph, _) = vendor_conv_graph(Padding::default());
    let config = CompileConfig::default().with_vendor_demotion(false);
    let (result, _) = prepare(&mut graph, &registry, config);
    let err = result.expect_err("no layout satisfies the vendor descriptor");
    match &err {
        CompileError::LayoutUnresolved {
            node,
            kind,
            attempted,
            blamed,
        } => {
            assert!(node.contains("conv"));
            assert_eq!(kind.to_string(), "vendor");
            assert!(attempted.contains("f32:bfyx"));
            assert!(attempted.contains("f32:yxfb"));
            assert!(blamed.contains("(x)"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.node().is_some());
}

#[test]
fn rank_default_formats_are_tried_in_order() {
    let mut registry = base_registry();
    registry.register(
        OpKind::Softmax,
        accept("yxfb_softmax", BackendKind::Generic)
            .with_predicate(|node| node.output_layout(0).format == Format::Yxfb),
    );
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", f32(&[2, 16, 4, 4], Format::Bfyx));
    let softmax = builder.op("probs", OpKind::Softmax, &[input], f32(&[2, 16, 4, 4], Format::Any));
    let mut graph = builder.finish().expect("valid graph");

    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    result.expect("pass succeeds");
    assert_eq!(graph.node(softmax).output_layout(0).format, Format::Yxfb);
    assert_eq!(graph.node(softmax).preferred_input(0), Format::Yxfb);
    assert_eq!(reorder_count(&graph, ReorderReason::FormatMismatch), 1);
    assert_edges_agree(&graph);
}

#[test]
fn dynamic_nodes_with_dynamic_backends_keep_their_layout() {
    let mut registry = base_registry();
    registry.register(
        OpKind::Softmax,
        accept("yxfb_softmax", BackendKind::Generic)
            .with_predicate(|node| node.output_layout(0).format == Format::Yxfb),
    );
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", dynamic(&[None, Some(16), Some(4), Some(4)], Format::Bfyx));
    let softmax = builder.op(
        "probs",
        OpKind::Softmax,
        &[input],
        dynamic(&[None, Some(16), Some(4), Some(4)], Format::Any),
    );
    let mut graph = builder.finish().expect("valid graph");

    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(result.expect("pass succeeds").reorders_inserted, 0);
    assert_eq!(graph.node(softmax).output_layout(0).format, Format::Bfyx);
}

#[test]
fn shared_surface_consumers_are_exempt() {
    let mut registry = base_registry();
    registry.register(OpKind::Eltwise, blocked(OpKind::Eltwise, "vendor_eltwise"));
    let registry = registry.freeze();

    let mut builder = GraphBuilder::new();
    let input = builder.input("x", f32(&[1, 16, 8, 8], Format::Bfyx));
    let surface = builder.add(
        NodeSpec::new("surface", OpKind::Reorder)
            .input(input)
            .output(f32(&[1, 16, 8, 8], Format::Bfyx))
            .attrs(OpAttrs::Reorder(ReorderAttrs {
                source_format: Format::Bfyx,
                source_dtype: DType::F32,
                reason: ReorderReason::SharedSurface,
                shared_surface: true,
            })),
    );
    let add = builder.op("add", OpKind::Eltwise, &[surface], f32(&[1, 16, 8, 8], Format::Any));
    let mut graph = builder.finish().expect("valid graph");

    let (result, _) = prepare(&mut graph, &registry, CompileConfig::default());
    assert_eq!(result.expect("pass succeeds").reorders_inserted, 0);
    assert_eq!(graph.node(add).deps()[0].node, surface);
}
