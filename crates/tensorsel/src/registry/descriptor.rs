use std::fmt;
use std::sync::Arc;

use crate::graph::NodeView;
use crate::layout::{DType, Format, Layout, LayoutKey, ShapeClass, ShapeSupport};

use super::{BackendKind, ImplHandle};

/// Per-slot layout opinion reported by a descriptor. `Format::Any` and
/// `None` entries mean "no opinion" for that slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatPreference {
    pub inputs: Vec<Format>,
    pub outputs: Vec<Format>,
    pub input_types: Vec<Option<DType>>,
}

impl FormatPreference {
    pub fn new(inputs: Vec<Format>, outputs: Vec<Format>) -> Self {
        Self {
            inputs,
            outputs,
            input_types: Vec::new(),
        }
    }

    /// Same format on every input and output slot of `node`.
    pub fn uniform(node: &NodeView<'_>, format: Format) -> Self {
        Self::new(
            vec![format; node.input_count()],
            vec![format; node.outputs().len()],
        )
    }

    pub fn with_input_type(mut self, slot: usize, dtype: DType) -> Self {
        if self.input_types.len() <= slot {
            self.input_types.resize(slot + 1, None);
        }
        self.input_types[slot] = Some(dtype);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.iter().all(|format| !format.is_resolved())
            && self.outputs.iter().all(|format| !format.is_resolved())
            && self.input_types.iter().all(Option::is_none)
    }
}

/// Declares whether and how one backend kind can execute a node.
///
/// `build` is only called after `validate` returned `true` for the same node
/// state; a build error is fatal for the whole compilation.
pub trait ImplDescriptor: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn shape_support(&self) -> ShapeSupport;

    /// Cheap pre-filter on the node's shape classification.
    fn support_shapes(&self, class: ShapeClass) -> bool {
        self.shape_support().supports(class)
    }

    fn validate(&self, node: &NodeView<'_>) -> bool;

    /// Preferred per-slot formats, if this descriptor has an opinion.
    fn query_formats(&self, _node: &NodeView<'_>) -> Option<FormatPreference> {
        None
    }

    fn build(&self, node: &NodeView<'_>) -> anyhow::Result<ImplHandle>;
}

pub type DescriptorRef = Arc<dyn ImplDescriptor>;

/// Accepted (format, dtype) pairs. A key whose format is `Format::Any`
/// accepts every format of that dtype.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    keys: Vec<LayoutKey>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dtype: DType, formats: &[Format]) -> Self {
        for format in formats {
            let key = LayoutKey {
                format: *format,
                dtype,
            };
            if !self.keys.contains(&key) {
                self.keys.push(key);
            }
        }
        self
    }

    /// Every format for each of `dtypes`.
    pub fn any_format(self, dtypes: &[DType]) -> Self {
        dtypes
            .iter()
            .fold(self, |set, dtype| set.with(*dtype, &[Format::Any]))
    }

    pub fn accepts(&self, layout: &Layout) -> bool {
        self.keys.iter().any(|key| {
            key.dtype == layout.dtype && (key.format == Format::Any || key.format == layout.format)
        })
    }

    pub fn keys(&self) -> &[LayoutKey] {
        &self.keys
    }
}

type NodePredicate = Arc<dyn Fn(&NodeView<'_>) -> bool + Send + Sync>;
type FormatQuery = Arc<dyn Fn(&NodeView<'_>) -> Option<FormatPreference> + Send + Sync>;
type BuildFn = Arc<dyn Fn(&Descriptor, &NodeView<'_>) -> anyhow::Result<ImplHandle> + Send + Sync>;

/// Composable descriptor assembled from independent checks.
///
/// Validation runs, in order: shape membership, the key set (applied to every
/// real input and every output) and the custom predicate, then the attribute
/// check.
#[derive(Clone)]
pub struct Descriptor {
    name: String,
    kind: BackendKind,
    shapes: ShapeSupport,
    keys: Option<KeySet>,
    predicate: Option<NodePredicate>,
    attr_check: Option<NodePredicate>,
    formats: Option<FormatQuery>,
    build: BuildFn,
}

impl Descriptor {
    pub fn new<F>(name: impl Into<String>, kind: BackendKind, build: F) -> Self
    where
        F: Fn(&Descriptor, &NodeView<'_>) -> anyhow::Result<ImplHandle> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind,
            shapes: default_shape_support(kind),
            keys: None,
            predicate: None,
            attr_check: None,
            formats: None,
            build: Arc::new(build),
        }
    }

    pub fn with_shapes(mut self, shapes: ShapeSupport) -> Self {
        self.shapes = shapes;
        self
    }

    pub fn with_keys(mut self, keys: KeySet) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&NodeView<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_attr_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&NodeView<'_>) -> bool + Send + Sync + 'static,
    {
        self.attr_check = Some(Arc::new(check));
        self
    }

    pub fn with_formats<F>(mut self, query: F) -> Self
    where
        F: Fn(&NodeView<'_>) -> Option<FormatPreference> + Send + Sync + 'static,
    {
        self.formats = Some(Arc::new(query));
        self
    }

    pub fn into_ref(self) -> DescriptorRef {
        Arc::new(self)
    }

    fn keys_accept(&self, keys: &KeySet, node: &NodeView<'_>) -> bool {
        let inputs_ok = node
            .real_inputs()
            .all(|slot| keys.accepts(&node.input_layout(slot)));
        inputs_ok && node.outputs().iter().all(|layout| keys.accepts(layout))
    }
}

/// Vendor routines only serve static shapes unless they opt in.
fn default_shape_support(kind: BackendKind) -> ShapeSupport {
    match kind {
        BackendKind::Vendor => ShapeSupport::StaticOnly,
        _ => ShapeSupport::Both,
    }
}

impl ImplDescriptor for Descriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn shape_support(&self) -> ShapeSupport {
        self.shapes
    }

    fn validate(&self, node: &NodeView<'_>) -> bool {
        if !self.support_shapes(node.shape_class()) {
            return false;
        }
        if let Some(keys) = &self.keys {
            if !self.keys_accept(keys, node) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(node) {
                return false;
            }
        }
        match &self.attr_check {
            Some(check) => check(node),
            None => true,
        }
    }

    fn query_formats(&self, node: &NodeView<'_>) -> Option<FormatPreference> {
        let query = self.formats.as_ref()?;
        query(node).filter(|preference| !preference.is_empty())
    }

    fn build(&self, node: &NodeView<'_>) -> anyhow::Result<ImplHandle> {
        (self.build)(self, node)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("shapes", &self.shapes)
            .field("keys", &self.keys)
            .field("predicate", &self.predicate.is_some())
            .field("attr_check", &self.attr_check.is_some())
            .field("formats", &self.formats.is_some())
            .finish()
    }
}
