//! Backend implementation selection and layout agreement for tensor graphs.
//!
//! Given a graph whose shapes are already inferred, the passes in this crate
//! pick a backend kind and implementation for every node, settle physical
//! memory formats across the graph, insert reorder nodes on edges that still
//! disagree, and build every chosen implementation before first execution.

pub mod config;
mod env;
pub mod error;
pub mod exec;
pub mod graph;
pub mod layout;
pub mod passes;
pub mod pipeline;
pub mod registry;
pub mod select;
pub mod trace;

pub use config::CompileConfig;
pub use error::{CompileError, CompileResult};
pub use graph::{Graph, GraphBuilder, NodeId, NodeSpec, OpKind};
pub use layout::{DType, Format, Layout, Padding, Shape, ShapeClass, ShapeSupport};
pub use pipeline::{compile, compile_graph, compile_with_sink, CompilePipeline};
pub use registry::{
    BackendKind, Descriptor, ImplDescriptor, ImplHandle, ImplRegistry, Implementation, KindMask,
    RegistryBuilder,
};
pub use select::{Probe, Selected, Selector};
