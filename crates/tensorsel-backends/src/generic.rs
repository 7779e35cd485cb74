//! Generated device kernels.
//!
//! Generic kernels cover every operation kind and both shape classes; they
//! read plain formats and the 16-wide feature-blocked formats.

use tensorsel::graph::NodeView;
use tensorsel::layout::{Format, Layout};
use tensorsel::{BackendKind, Descriptor, OpKind, RegistryBuilder};

use crate::kernel;

const OPS: &[OpKind] = &[
    OpKind::Input,
    OpKind::MutableBuffer,
    OpKind::Convolution,
    OpKind::Deconvolution,
    OpKind::FullyConnected,
    OpKind::Gemm,
    OpKind::Pooling,
    OpKind::Eltwise,
    OpKind::Activation,
    OpKind::Normalization,
    OpKind::Softmax,
    OpKind::Permute,
    OpKind::Reshape,
    OpKind::Concatenation,
    OpKind::StateRead,
    OpKind::StateWrite,
];

pub(crate) fn register(builder: &mut RegistryBuilder) {
    for &op in OPS {
        let name = format!("generic_{}", op.as_str());
        builder.register(
            op,
            Descriptor::new(name, BackendKind::Generic, kernel::plan).with_predicate(kernel_layouts),
        );
    }
    builder.register(
        OpKind::Reorder,
        Descriptor::new("generic_reorder", BackendKind::Generic, kernel::plan)
            .with_predicate(resolved_layouts),
    );
}

fn supported_format(layout: &Layout) -> bool {
    layout.format.accepts_rank(layout.rank())
        && !matches!(
            layout.format,
            Format::BFsYxFsv32 | Format::BsFsYxBsv32Fsv16
        )
}

fn kernel_layouts(node: &NodeView<'_>) -> bool {
    node.real_inputs()
        .all(|slot| supported_format(&node.input_layout(slot)))
        && node.outputs().iter().all(supported_format)
}

/// Reorder kernels convert between any pair of formats of the right rank.
fn resolved_layouts(node: &NodeView<'_>) -> bool {
    node.real_inputs().all(|slot| {
        let layout = node.input_layout(slot);
        layout.format.accepts_rank(layout.rank())
    }) && node
        .outputs()
        .iter()
        .all(|layout| layout.format.accepts_rank(layout.rank()))
}
