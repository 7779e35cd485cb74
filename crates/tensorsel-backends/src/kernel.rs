use std::any::Any;

use anyhow::Context;
use serde::Serialize;
use tensorsel::graph::NodeView;
use tensorsel::layout::{Layout, LayoutKey};
use tensorsel::registry::ImplDescriptor;
use tensorsel::{BackendKind, Descriptor, ImplHandle, Implementation};

/// Launch plan produced by the built-in descriptors.
///
/// Kernel source generation happens downstream; the plan only records which
/// entry point runs the node and the layouts it was specialised for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelPlan {
    kind: BackendKind,
    descriptor: String,
    entry: String,
    inputs: Vec<LayoutKey>,
    outputs: Vec<LayoutKey>,
    /// Bytes touched by one invocation; `None` for dynamic shapes.
    footprint: Option<usize>,
}

impl KernelPlan {
    pub fn for_node(descriptor: &Descriptor, node: &NodeView<'_>) -> Self {
        let inputs: Vec<LayoutKey> = (0..node.input_count())
            .map(|slot| node.input_layout(slot).key())
            .collect();
        let outputs: Vec<LayoutKey> = node.outputs().iter().map(Layout::key).collect();
        let entry = match outputs.first() {
            Some(key) => format!("{}_{}_{}", descriptor.name(), key.format, key.dtype),
            None => descriptor.name().to_string(),
        };
        let footprint = (0..node.input_count())
            .map(|slot| node.input_layout(slot).byte_size())
            .chain(node.outputs().iter().map(Layout::byte_size))
            .try_fold(0usize, |total, bytes| total.checked_add(bytes?));
        Self {
            kind: descriptor.kind(),
            descriptor: descriptor.name().to_string(),
            entry,
            inputs,
            outputs,
            footprint,
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn inputs(&self) -> &[LayoutKey] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[LayoutKey] {
        &self.outputs
    }

    pub fn footprint(&self) -> Option<usize> {
        self.footprint
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("failed to serialize kernel plan")
    }
}

impl Implementation for KernelPlan {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.descriptor
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Build function shared by descriptors that need no extra checks.
pub(crate) fn plan(descriptor: &Descriptor, node: &NodeView<'_>) -> anyhow::Result<ImplHandle> {
    let plan = KernelPlan::for_node(descriptor, node);
    log::trace!("planned {} for {}", plan.entry, node.describe());
    Ok(std::sync::Arc::new(plan))
}
