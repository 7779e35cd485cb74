use tensorsel::graph::NodeView;
use tensorsel::layout::{DType, Format};
use tensorsel::registry::KeySet;
use tensorsel::{BackendKind, Descriptor, OpKind, RegistryBuilder};

use crate::kernel;

const OPS: &[OpKind] = &[
    OpKind::Input,
    OpKind::MutableBuffer,
    OpKind::Gemm,
    OpKind::Eltwise,
    OpKind::Activation,
    OpKind::Softmax,
    OpKind::Permute,
    OpKind::Reshape,
    OpKind::Concatenation,
    OpKind::StateRead,
    OpKind::StateWrite,
    OpKind::Reorder,
];

const HOST_FORMATS: &[Format] = &[Format::Bfyx, Format::Bfzyx, Format::Bfwzyx];

const HOST_TYPES: &[DType] = &[
    DType::I1,
    DType::Si8,
    DType::Ui8,
    DType::Si32,
    DType::Si64,
    DType::F16,
    DType::F32,
];

// Host code reads plain, unpadded buffers only.
pub(crate) fn register(builder: &mut RegistryBuilder) {
    let keys = HOST_TYPES
        .iter()
        .fold(KeySet::new(), |keys, dtype| keys.with(*dtype, HOST_FORMATS));
    for &op in OPS {
        builder.register(
            op,
            Descriptor::new(format!("host_{}", op.as_str()), BackendKind::Host, kernel::plan)
                .with_keys(keys.clone())
                .with_predicate(unpadded),
        );
    }
}

fn unpadded(node: &NodeView<'_>) -> bool {
    node.real_inputs()
        .all(|slot| node.input_layout(slot).padding.is_zero())
        && node.outputs().iter().all(|layout| layout.padding.is_zero())
}
