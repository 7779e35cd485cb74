//! Vendor math-library routines.
//!
//! The library only handles static shapes (gemm opts into dynamic ones),
//! unpadded batch and spatial axes and buffers addressable with 32-bit
//! offsets. It prefers blocked feature layouts for convolutions. Padded
//! inputs are stripped by reorder insertion before the library reads them.

use std::sync::Arc;

use anyhow::bail;
use tensorsel::graph::{NodeView, OpAttrs};
use tensorsel::layout::{DType, Format, Layout};
use tensorsel::registry::{FormatPreference, ImplDescriptor, KeySet};
use tensorsel::{BackendKind, Descriptor, ImplHandle, OpKind, RegistryBuilder, ShapeSupport};

use crate::kernel::{self, KernelPlan};

const CONV_FORMATS: &[Format] = &[
    Format::Bfyx,
    Format::BFsYxFsv16,
    Format::BFsYxFsv32,
    Format::BsFsYxBsv32Fsv16,
    Format::Bfzyx,
    Format::BFsZyxFsv16,
];

const PLAIN_FORMATS: &[Format] = &[Format::Bfyx, Format::Bfzyx, Format::Bfwzyx];

const MAX_KERNEL_EXTENT: usize = 11;
const MAX_STRIDE: usize = 4;

/// Largest buffer the library can address with 32-bit offsets.
const MAX_TENSOR_BYTES: usize = u32::MAX as usize;

pub(crate) fn register(builder: &mut RegistryBuilder) {
    builder
        .register(OpKind::Convolution, convolution())
        .register(OpKind::Deconvolution, deconvolution())
        .register(OpKind::FullyConnected, fully_connected())
        .register(OpKind::Gemm, gemm())
        .register(OpKind::Pooling, pooling())
        .register(OpKind::Concatenation, plain("vendor_concat"))
        .register(OpKind::Reorder, reorder());
}

fn conv_keys() -> KeySet {
    KeySet::new()
        .with(DType::F16, CONV_FORMATS)
        .with(DType::F32, CONV_FORMATS)
        .with(DType::Si8, CONV_FORMATS)
        .with(DType::Ui8, CONV_FORMATS)
}

fn float_keys(formats: &[Format]) -> KeySet {
    KeySet::new()
        .with(DType::F16, formats)
        .with(DType::F32, formats)
}

/// Only feature padding is understood by the library.
fn unpadded_inputs(node: &NodeView<'_>) -> bool {
    node.real_inputs().all(|slot| {
        let layout = node.input_layout(slot);
        !layout.padding.has_batch_padding() && !layout.padding.has_spatial_padding()
    })
}

/// Every static input and output fits the 32-bit offset range. Dynamic
/// layouts pass; their size is unknown until run time.
fn addressable(node: &NodeView<'_>) -> bool {
    let fits = |layout: &Layout| {
        layout.is_dynamic() || layout.byte_size().is_some_and(|bytes| bytes <= MAX_TENSOR_BYTES)
    };
    (0..node.input_count()).all(|slot| fits(&*node.input_layout(slot)))
        && node.outputs().iter().all(fits)
}

fn conv_attrs_supported(node: &NodeView<'_>) -> bool {
    let extents = match node.attrs() {
        OpAttrs::Convolution(attrs) => {
            attrs.max_kernel_extent() <= MAX_KERNEL_EXTENT
                && attrs.strides.iter().all(|stride| *stride <= MAX_STRIDE)
        }
        _ => true,
    };
    extents && addressable(node)
}

/// Blocked layout the library runs fastest in for this output.
fn blocked_format(output: &Layout) -> Option<Format> {
    match (Format::class_of_rank(output.rank()), output.dtype) {
        (4, DType::Si8 | DType::Ui8) => Some(Format::BFsYxFsv32),
        (4, DType::F16) if batch_at_least(output, 32) => Some(Format::BsFsYxBsv32Fsv16),
        (4, DType::F16 | DType::F32) => Some(Format::BFsYxFsv16),
        (5, DType::F16 | DType::F32) => Some(Format::BFsZyxFsv16),
        _ => None,
    }
}

fn batch_at_least(layout: &Layout, batch: usize) -> bool {
    layout
        .shape
        .static_dims()
        .and_then(|dims| dims.first().copied())
        .is_some_and(|extent| extent >= batch)
}

fn conv_formats(node: &NodeView<'_>) -> Option<FormatPreference> {
    let format = blocked_format(node.output_layout(0))?;
    let inputs = (0..node.input_count())
        .map(|slot| {
            if node.is_constant_input(slot) {
                Format::Any
            } else {
                format
            }
        })
        .collect();
    Some(FormatPreference::new(inputs, vec![format]))
}

fn build_static(descriptor: &Descriptor, node: &NodeView<'_>) -> anyhow::Result<ImplHandle> {
    let plan = KernelPlan::for_node(descriptor, node);
    if plan.footprint().is_none() {
        bail!("{} requires static shapes", descriptor.name());
    }
    Ok(Arc::new(plan))
}

fn convolution() -> Descriptor {
    Descriptor::new("vendor_conv", BackendKind::Vendor, build_static)
        .with_keys(conv_keys())
        .with_predicate(unpadded_inputs)
        .with_attr_check(conv_attrs_supported)
        .with_formats(conv_formats)
}

fn deconvolution() -> Descriptor {
    Descriptor::new("vendor_deconv", BackendKind::Vendor, build_static)
        .with_keys(float_keys(&[Format::Bfyx, Format::BFsYxFsv16, Format::Bfzyx]))
        .with_predicate(unpadded_inputs)
        .with_attr_check(conv_attrs_supported)
}

fn fully_connected() -> Descriptor {
    Descriptor::new("vendor_fc", BackendKind::Vendor, build_static)
        .with_keys(float_keys(PLAIN_FORMATS).with(DType::Si8, PLAIN_FORMATS))
        .with_predicate(unpadded_inputs)
        .with_attr_check(addressable)
}

fn gemm() -> Descriptor {
    Descriptor::new("vendor_gemm", BackendKind::Vendor, kernel::plan)
        .with_shapes(ShapeSupport::Both)
        .with_keys(float_keys(PLAIN_FORMATS))
        .with_predicate(unpadded_inputs)
        .with_attr_check(addressable)
}

fn pooling() -> Descriptor {
    Descriptor::new("vendor_pool", BackendKind::Vendor, build_static)
        .with_keys(float_keys(&[Format::Bfyx, Format::BFsYxFsv16, Format::Bfzyx]))
        .with_predicate(unpadded_inputs)
        .with_attr_check(addressable)
}

fn plain(name: &str) -> Descriptor {
    Descriptor::new(name, BackendKind::Vendor, build_static)
        .with_keys(float_keys(PLAIN_FORMATS))
        .with_predicate(unpadded_inputs)
        .with_attr_check(addressable)
}

fn reorder() -> Descriptor {
    Descriptor::new("vendor_reorder", BackendKind::Vendor, build_static)
        .with_keys(KeySet::new().any_format(&[DType::F16, DType::F32, DType::Si8, DType::Ui8]))
        .with_attr_check(addressable)
}
