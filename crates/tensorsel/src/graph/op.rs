use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::layout::{DType, Format};

/// Operation kinds the registry is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Input,
    Constant,
    MutableBuffer,
    Convolution,
    Deconvolution,
    FullyConnected,
    Gemm,
    Pooling,
    Eltwise,
    Activation,
    Normalization,
    Softmax,
    Permute,
    Reshape,
    Concatenation,
    Reorder,
    StateRead,
    StateWrite,
}

impl OpKind {
    /// Constants only carry data; every other kind takes part in data flow.
    pub fn is_data_flow(self) -> bool {
        self != OpKind::Constant
    }

    /// Kinds whose feeding reorders may change layout but never element type.
    pub fn is_conv_like(self) -> bool {
        matches!(self, OpKind::Convolution | OpKind::Deconvolution)
    }

    /// Heavy compute kinds eligible for the trailing-permute fold.
    pub fn is_compute(self) -> bool {
        matches!(
            self,
            OpKind::Convolution | OpKind::Deconvolution | OpKind::FullyConnected | OpKind::Gemm
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Input => "input",
            OpKind::Constant => "constant",
            OpKind::MutableBuffer => "mutable_buffer",
            OpKind::Convolution => "convolution",
            OpKind::Deconvolution => "deconvolution",
            OpKind::FullyConnected => "fully_connected",
            OpKind::Gemm => "gemm",
            OpKind::Pooling => "pooling",
            OpKind::Eltwise => "eltwise",
            OpKind::Activation => "activation",
            OpKind::Normalization => "normalization",
            OpKind::Softmax => "softmax",
            OpKind::Permute => "permute",
            OpKind::Reshape => "reshape",
            OpKind::Concatenation => "concatenation",
            OpKind::Reorder => "reorder",
            OpKind::StateRead => "state_read",
            OpKind::StateWrite => "state_write",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvAttrs {
    pub groups: usize,
    pub kernel: SmallVec<[usize; 3]>,
    pub strides: SmallVec<[usize; 3]>,
}

impl ConvAttrs {
    pub fn new(kernel: &[usize]) -> Self {
        Self {
            groups: 1,
            kernel: SmallVec::from_slice(kernel),
            strides: SmallVec::from_elem(1, kernel.len()),
        }
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups.max(1);
        self
    }

    pub fn with_strides(mut self, strides: &[usize]) -> Self {
        self.strides = SmallVec::from_slice(strides);
        self
    }

    pub fn max_kernel_extent(&self) -> usize {
        self.kernel.iter().copied().max().unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermuteAttrs {
    pub order: Vec<usize>,
}

impl PermuteAttrs {
    /// True when only axes past the first two move.
    pub fn keeps_leading_axes(&self) -> bool {
        self.order.len() >= 2 && self.order[0] == 0 && self.order[1] == 1
    }
}

/// Attributes of a state-persisting write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateAttrs {
    pub variable: String,
    pub declared: DType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormAttrs {
    pub across_channels: bool,
}

/// Why a reorder was placed on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderReason {
    FormatMismatch,
    TypeConversion,
    FusedDependency,
    StripSpatialPadding,
    StripPadding,
    SharedSurface,
}

impl fmt::Display for ReorderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReorderReason::FormatMismatch => "format mismatch",
            ReorderReason::TypeConversion => "type conversion",
            ReorderReason::FusedDependency => "fused dependency",
            ReorderReason::StripSpatialPadding => "strip spatial padding",
            ReorderReason::StripPadding => "strip padding",
            ReorderReason::SharedSurface => "shared surface",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderAttrs {
    pub source_format: Format,
    pub source_dtype: DType,
    pub reason: ReorderReason,
    /// Reads a surface shared with another device API; consumers take it as is.
    pub shared_surface: bool,
}

/// Kind-specific attributes consulted by descriptor predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OpAttrs {
    #[default]
    None,
    Convolution(ConvAttrs),
    Permute(PermuteAttrs),
    StateWrite(StateAttrs),
    Normalization(NormAttrs),
    Reorder(ReorderAttrs),
}

/// Post-operation fused into a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedOp {
    pub op: OpKind,
    /// Input slot of the owning node that feeds this fused op.
    pub outer_dep: Option<usize>,
}

impl FusedOp {
    pub fn new(op: OpKind) -> Self {
        Self {
            op,
            outer_dep: None,
        }
    }

    pub fn with_outer_dep(mut self, slot: usize) -> Self {
        self.outer_dep = Some(slot);
        self
    }
}
