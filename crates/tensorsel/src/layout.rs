//! Tensor layout model.
//!
//! A [`Layout`] couples the logical shape reported by shape inference with the
//! physical placement chosen during compilation: element type, format tag and
//! per-axis padding. Axis 0 is batch, axis 1 is feature and every remaining
//! axis is spatial.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Enumerates scalar element types understood by the selection passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si32,
    Si64,
    F16,
    Bf16,
    F32,
}

impl DType {
    /// Returns `true` when the dtype is any signed or unsigned integer.
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si8 | DType::Ui8 | DType::Si32 | DType::Si64)
    }

    /// Returns `true` for 8-bit quantized storage types.
    pub fn is_quantized(self) -> bool {
        matches!(self, DType::Si8 | DType::Ui8)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::Si8 | DType::Ui8 => 1,
            DType::F16 | DType::Bf16 => 2,
            DType::Si32 | DType::F32 => 4,
            DType::Si64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::I1 => "i1",
            DType::Si8 => "si8",
            DType::Ui8 => "ui8",
            DType::Si32 => "si32",
            DType::Si64 => "si64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names a symbolic dynamic dimension (e.g. `?B`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dimension {
    pub fn dynamic(name: impl Into<String>) -> Self {
        Self::Dynamic(DimSymbol::new(name))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dimension::Dynamic(_))
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self::Static(value)
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(Dimension::is_dynamic)
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|dim| match dim {
                Dimension::Static(value) => Some(*value),
                Dimension::Dynamic(_) => None,
            })
            .collect()
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        dims.into_iter()
            .try_fold(1usize, |count, dim| count.checked_mul(dim))
    }

    /// Extent of the feature axis when it is statically known.
    pub fn feature_count(&self) -> Option<usize> {
        match self.dims.get(1) {
            Some(Dimension::Static(value)) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str("x")?;
            }
            match dim {
                Dimension::Static(value) => write!(f, "{value}")?,
                Dimension::Dynamic(sym) => write!(f, "?{}", sym.as_str())?,
            }
        }
        Ok(())
    }
}

/// Static vs. dynamic classification of a node's shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeClass {
    Static,
    Dynamic,
}

impl ShapeClass {
    /// Dynamic iff any of the layouts has a dynamic axis.
    pub fn classify<'a>(layouts: impl IntoIterator<Item = &'a Layout>) -> Self {
        if layouts.into_iter().any(Layout::is_dynamic) {
            ShapeClass::Dynamic
        } else {
            ShapeClass::Static
        }
    }

    pub fn is_dynamic(self) -> bool {
        self == ShapeClass::Dynamic
    }
}

impl fmt::Display for ShapeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeClass::Static => f.write_str("static"),
            ShapeClass::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Shape classifications a descriptor declares it can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeSupport {
    StaticOnly,
    DynamicOnly,
    Both,
}

impl ShapeSupport {
    pub fn supports(self, class: ShapeClass) -> bool {
        match (self, class) {
            (ShapeSupport::Both, _) => true,
            (ShapeSupport::StaticOnly, ShapeClass::Static) => true,
            (ShapeSupport::DynamicOnly, ShapeClass::Dynamic) => true,
            _ => false,
        }
    }
}

/// Physical memory format tags.
///
/// `Any` marks a layout whose format has not been chosen yet. Plain formats
/// name their axis order; blocked formats split the feature (and optionally
/// batch) axis into fixed-size inner blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Any,
    Bfyx,
    Yxfb,
    Byxf,
    Bfzyx,
    Bfwzyx,
    BFsYxFsv16,
    BFsYxFsv32,
    BsFsYxBsv32Fsv16,
    BFsZyxFsv16,
}

const FALLBACKS_4D: &[Format] = &[Format::Bfyx, Format::Yxfb, Format::Byxf];
const FALLBACKS_5D: &[Format] = &[Format::Bfzyx];
const FALLBACKS_6D: &[Format] = &[Format::Bfwzyx];

impl Format {
    /// Dimensionality class (4, 5 or 6 axes); `None` while unresolved.
    pub fn dim_class(self) -> Option<usize> {
        match self {
            Format::Any => None,
            Format::Bfyx
            | Format::Yxfb
            | Format::Byxf
            | Format::BFsYxFsv16
            | Format::BFsYxFsv32
            | Format::BsFsYxBsv32Fsv16 => Some(4),
            Format::Bfzyx | Format::BFsZyxFsv16 => Some(5),
            Format::Bfwzyx => Some(6),
        }
    }

    /// Dimensionality class used for a logical rank. Ranks below four are
    /// stored in four-axis formats.
    pub fn class_of_rank(rank: usize) -> usize {
        rank.max(4)
    }

    pub fn accepts_rank(self, rank: usize) -> bool {
        self.dim_class() == Some(Self::class_of_rank(rank))
    }

    pub fn is_resolved(self) -> bool {
        self != Format::Any
    }

    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            Format::BFsYxFsv16
                | Format::BFsYxFsv32
                | Format::BsFsYxBsv32Fsv16
                | Format::BFsZyxFsv16
        )
    }

    /// Blocked formats whose kernels index spatial axes without padding.
    pub fn forbids_spatial_padding(self) -> bool {
        matches!(
            self,
            Format::BFsYxFsv16 | Format::BsFsYxBsv32Fsv16 | Format::BFsZyxFsv16
        )
    }

    /// Canonical plain format for a logical rank.
    pub fn default_for_rank(rank: usize) -> Format {
        match Self::class_of_rank(rank) {
            5 => Format::Bfzyx,
            6 => Format::Bfwzyx,
            _ => Format::Bfyx,
        }
    }

    /// Plain formats tried, in order, when a node has no legal layout.
    pub fn fallbacks_for_rank(rank: usize) -> &'static [Format] {
        match Self::class_of_rank(rank) {
            5 => FALLBACKS_5D,
            6 => FALLBACKS_6D,
            _ => FALLBACKS_4D,
        }
    }

    /// Keeps `self` when it fits `rank`, otherwise the rank's default format.
    pub fn adapt_to_rank(self, rank: usize) -> Format {
        if self.accepts_rank(rank) {
            self
        } else {
            Format::default_for_rank(rank)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Any => "any",
            Format::Bfyx => "bfyx",
            Format::Yxfb => "yxfb",
            Format::Byxf => "byxf",
            Format::Bfzyx => "bfzyx",
            Format::Bfwzyx => "bfwzyx",
            Format::BFsYxFsv16 => "b_fs_yx_fsv16",
            Format::BFsYxFsv32 => "b_fs_yx_fsv32",
            Format::BsFsYxBsv32Fsv16 => "bs_fs_yx_bsv32_fsv16",
            Format::BFsZyxFsv16 => "b_fs_zyx_fsv16",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-axis lower/upper padding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Padding {
    lower: SmallVec<[usize; 6]>,
    upper: SmallVec<[usize; 6]>,
}

impl Padding {
    pub fn new(lower: &[usize], upper: &[usize]) -> Self {
        let mut padding = Self {
            lower: SmallVec::from_slice(lower),
            upper: SmallVec::from_slice(upper),
        };
        padding.normalize();
        padding
    }

    /// Symmetric padding on the spatial axes of a `rank`-dimensional tensor.
    pub fn spatial(rank: usize, amount: usize) -> Self {
        let mut lower: SmallVec<[usize; 6]> = SmallVec::from_elem(0, rank);
        for value in lower.iter_mut().skip(2) {
            *value = amount;
        }
        let upper = lower.clone();
        let mut padding = Self { lower, upper };
        padding.normalize();
        padding
    }

    pub fn lower(&self, axis: usize) -> usize {
        self.lower.get(axis).copied().unwrap_or(0)
    }

    pub fn upper(&self, axis: usize) -> usize {
        self.upper.get(axis).copied().unwrap_or(0)
    }

    fn axis_padded(&self, axis: usize) -> bool {
        self.lower(axis) != 0 || self.upper(axis) != 0
    }

    fn axes(&self) -> usize {
        self.lower.len().max(self.upper.len())
    }

    pub fn is_zero(&self) -> bool {
        self.lower.is_empty() && self.upper.is_empty()
    }

    pub fn has_batch_padding(&self) -> bool {
        self.axis_padded(0)
    }

    pub fn has_feature_padding(&self) -> bool {
        self.axis_padded(1)
    }

    pub fn has_spatial_padding(&self) -> bool {
        (2..self.axes()).any(|axis| self.axis_padded(axis))
    }

    /// Copy of this padding with every spatial axis cleared.
    pub fn without_spatial(&self) -> Padding {
        self.keep_axes(|axis| axis < 2)
    }

    /// Copy of this padding keeping only the feature axis.
    pub fn feature_only(&self) -> Padding {
        self.keep_axes(|axis| axis == 1)
    }

    fn keep_axes(&self, keep: impl Fn(usize) -> bool) -> Padding {
        let pick = |values: &SmallVec<[usize; 6]>| -> SmallVec<[usize; 6]> {
            values
                .iter()
                .enumerate()
                .map(|(axis, value)| if keep(axis) { *value } else { 0 })
                .collect()
        };
        let mut padding = Padding {
            lower: pick(&self.lower),
            upper: pick(&self.upper),
        };
        padding.normalize();
        padding
    }

    // Trailing zeros are dropped so equal paddings compare and hash equal.
    fn normalize(&mut self) {
        while self.lower.last() == Some(&0) {
            self.lower.pop();
        }
        while self.upper.last() == Some(&0) {
            self.upper.pop();
        }
    }
}

/// Full physical description of one tensor slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub shape: Shape,
    pub dtype: DType,
    pub format: Format,
    #[serde(default, skip_serializing_if = "Padding::is_zero")]
    pub padding: Padding,
}

impl Layout {
    pub fn new(shape: Shape, dtype: DType, format: Format) -> Self {
        Self {
            shape,
            dtype,
            format,
            padding: Padding::default(),
        }
    }

    /// Static layout shorthand used heavily by graph construction code.
    pub fn of(dims: &[usize], dtype: DType, format: Format) -> Self {
        Self::new(Shape::from_static(dims), dtype, format)
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.is_dynamic()
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    pub fn feature_count(&self) -> Option<usize> {
        self.shape.feature_count()
    }

    /// Unpadded size in bytes; `None` for dynamic shapes or on overflow.
    pub fn byte_size(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_in_bytes())
    }

    /// (format, dtype) pair used by capability key sets and diagnostics.
    pub fn key(&self) -> LayoutKey {
        LayoutKey {
            format: self.format,
            dtype: self.dtype,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}[{}]", self.dtype, self.format, self.shape)?;
        if !self.padding.is_zero() {
            f.write_str("+pad")?;
        }
        Ok(())
    }
}

/// Format and element type of a tensor slot, without its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutKey {
    pub format: Format,
    pub dtype: DType,
}

impl fmt::Display for LayoutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dtype, self.format)
    }
}
