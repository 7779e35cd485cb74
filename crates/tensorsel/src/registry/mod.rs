//! Per-operation catalog of capability descriptors.
//!
//! Backends contribute descriptors through a [`RegistryBuilder`] in an
//! explicit, ordered registration routine. Registration order is priority
//! order: for a given operation kind, earlier entries always win over later
//! ones. Once frozen, an [`ImplRegistry`] is immutable and can be shared
//! freely between threads.

mod descriptor;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize, Serializer};

use crate::graph::OpKind;
use crate::layout::ShapeClass;

pub use descriptor::{Descriptor, DescriptorRef, FormatPreference, ImplDescriptor, KeySet};

/// Execution strategy families competing for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Vendor math-library routines.
    Vendor,
    /// Generated device kernels.
    Generic,
    /// Host CPU fallback.
    Host,
    /// Specialized accelerator paths.
    Accelerator,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Vendor,
        BackendKind::Generic,
        BackendKind::Host,
        BackendKind::Accelerator,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Lowercase name used in logs, diagnostics and serialized events.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Vendor => "vendor",
            BackendKind::Generic => "generic",
            BackendKind::Host => "host",
            BackendKind::Accelerator => "accelerator",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of backend kinds a lookup is restricted to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KindMask(u8);

impl KindMask {
    pub const NONE: KindMask = KindMask(0);
    pub const ANY: KindMask = KindMask(0b1111);

    /// Mask holding just `kind`.
    pub fn only(kind: BackendKind) -> Self {
        KindMask(kind.bit())
    }

    /// Mask for an optional pin: the pinned kind alone, or every kind.
    pub fn from_pin(pin: Option<BackendKind>) -> Self {
        pin.map_or(KindMask::ANY, KindMask::only)
    }

    pub fn contains(self, kind: BackendKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: BackendKind) {
        self.0 |= kind.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_any(self) -> bool {
        self == KindMask::ANY
    }

    /// Members in priority order.
    pub fn iter(self) -> impl Iterator<Item = BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<BackendKind> for KindMask {
    fn from_iter<I: IntoIterator<Item = BackendKind>>(iter: I) -> Self {
        let mut mask = KindMask::NONE;
        for kind in iter {
            mask.insert(kind);
        }
        mask
    }
}

impl fmt::Display for KindMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return f.write_str("any");
        }
        if self.is_empty() {
            return f.write_str("none");
        }
        for (idx, kind) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str("|")?;
            }
            f.write_str(kind.as_str())?;
        }
        Ok(())
    }
}

impl fmt::Debug for KindMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KindMask({self})")
    }
}

impl Serialize for KindMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Opaque result of building a descriptor for one node.
pub trait Implementation: fmt::Debug + Send + Sync {
    /// Backend family that produced this implementation.
    fn kind(&self) -> BackendKind;

    /// Name of the descriptor that produced this implementation.
    fn name(&self) -> &str;

    /// Lets backends recover their concrete implementation type.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle stored on graph nodes once built.
pub type ImplHandle = Arc<dyn Implementation>;

/// Collects descriptors in registration order.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<OpKind, Vec<DescriptorRef>>,
}

impl RegistryBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `descriptor` to the entries for `op`.
    ///
    /// Entries registered earlier for the same operation kind take priority
    /// over this one.
    pub fn register<D>(&mut self, op: OpKind, descriptor: D) -> &mut Self
    where
        D: ImplDescriptor + 'static,
    {
        self.register_ref(op, Arc::new(descriptor))
    }

    /// Same as [`RegistryBuilder::register`] for a descriptor that is
    /// already shared, e.g. one entry serving several operation kinds.
    pub fn register_ref(&mut self, op: OpKind, descriptor: DescriptorRef) -> &mut Self {
        log::trace!(
            "registering {} descriptor {} for {}",
            descriptor.kind(),
            descriptor.name(),
            op
        );
        self.entries.entry(op).or_default().push(descriptor);
        self
    }

    /// Ends registration. The resulting registry cannot change.
    pub fn freeze(self) -> ImplRegistry {
        ImplRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable, priority-ordered descriptor lists keyed by operation kind.
#[derive(Default)]
pub struct ImplRegistry {
    entries: BTreeMap<OpKind, Vec<DescriptorRef>>,
}

impl ImplRegistry {
    /// Shorthand for [`RegistryBuilder::new`].
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Descriptors for `op` in priority order.
    pub fn entries(&self, op: OpKind) -> &[DescriptorRef] {
        self.entries.get(&op).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First descriptor for `op` whose kind is in `mask` and whose declared
    /// shape support covers `shape`.
    pub fn lookup(&self, op: OpKind, mask: KindMask, shape: ShapeClass) -> Option<&DescriptorRef> {
        self.entries(op)
            .iter()
            .find(|entry| mask.contains(entry.kind()) && entry.support_shapes(shape))
    }

    /// Backend kinds with at least one entry for `op` supporting `shape`.
    pub fn available_kinds(&self, op: OpKind, shape: ShapeClass) -> KindMask {
        self.entries(op)
            .iter()
            .filter(|entry| entry.support_shapes(shape))
            .map(|entry| entry.kind())
            .collect()
    }

    /// Whether any entry for `op` accepts dynamic shapes. Reorder insertion
    /// leaves such nodes in their current layout instead of forcing a
    /// fallback format.
    pub fn has_dynamic_support(&self, op: OpKind) -> bool {
        self.entries(op)
            .iter()
            .any(|entry| entry.support_shapes(ShapeClass::Dynamic))
    }

    /// Operation kinds with at least one registered entry.
    pub fn op_kinds(&self) -> impl Iterator<Item = OpKind> + '_ {
        self.entries.keys().copied()
    }

    /// Total number of entries across all operation kinds.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ImplRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (op, entries) in &self.entries {
            let names: Vec<String> = entries
                .iter()
                .map(|entry| format!("{}:{}", entry.kind(), entry.name()))
                .collect();
            map.entry(op, &names);
        }
        map.finish()
    }
}

static GLOBAL_REGISTRY: OnceLock<ImplRegistry> = OnceLock::new();

/// Installs the process-wide registry.
///
/// Only the first call succeeds; later calls hand their registry back.
pub fn install(registry: ImplRegistry) -> Result<&'static ImplRegistry, ImplRegistry> {
    let mut pending = Some(registry);
    let installed = GLOBAL_REGISTRY.get_or_init(|| pending.take().unwrap_or_default());
    match pending {
        Some(rejected) => Err(rejected),
        None => Ok(installed),
    }
}

/// Installs the registry built by `init` unless one already exists.
pub fn install_with(init: impl FnOnce(&mut RegistryBuilder)) -> &'static ImplRegistry {
    GLOBAL_REGISTRY.get_or_init(|| {
        let mut builder = RegistryBuilder::new();
        init(&mut builder);
        builder.freeze()
    })
}

/// The process-wide registry, if one has been installed.
pub fn global() -> Option<&'static ImplRegistry> {
    GLOBAL_REGISTRY.get()
}
