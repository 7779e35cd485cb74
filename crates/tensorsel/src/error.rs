use thiserror::Error;

use crate::graph::{NodeId, OpKind, TopologyError};
use crate::layout::ShapeClass;
use crate::registry::{BackendKind, KindMask};

/// Fatal outcomes of the selection passes.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(
        "no implementation for node {node} ({op}): requested {requested}, {shape} shapes, formats [{formats}]"
    )]
    NoImplementation {
        node: String,
        op: OpKind,
        requested: KindMask,
        shape: ShapeClass,
        formats: String,
    },
    #[error("building {descriptor} ({kind}) for node {node} failed: {source:#}")]
    Build {
        node: String,
        kind: BackendKind,
        descriptor: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(
        "no legal layout for node {node} ({kind}): tried [{attempted}], blamed dependency {blamed}"
    )]
    LayoutUnresolved {
        node: String,
        kind: KindMask,
        attempted: String,
        blamed: String,
    },
    #[error("build task for node {node} panicked: {message}")]
    TaskPanicked { node: NodeId, message: String },
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl CompileError {
    /// Id-qualified name of the node the error is about, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            CompileError::NoImplementation { node, .. }
            | CompileError::Build { node, .. }
            | CompileError::LayoutUnresolved { node, .. } => Some(node),
            CompileError::TaskPanicked { .. } | CompileError::Topology(_) => None,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
