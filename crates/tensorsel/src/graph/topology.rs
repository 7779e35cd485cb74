use std::collections::HashSet;

use thiserror::Error;

use super::{Graph, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("node {consumer} reads {producer} before it is produced")]
    UseBeforeDefinition { consumer: NodeId, producer: NodeId },
    #[error("node {consumer} reads output {port} of {producer}, which has {outputs} outputs")]
    MissingPort {
        consumer: NodeId,
        producer: NodeId,
        port: usize,
        outputs: usize,
    },
    #[error("node {node} declares no output layouts")]
    NoOutputs { node: NodeId },
}

/// Checks that the processing order defines every producer before its users.
pub fn validate_topology(graph: &Graph) -> Result<(), TopologyError> {
    let mut available = HashSet::new();
    for node in graph.nodes() {
        if node.outputs().is_empty() {
            return Err(TopologyError::NoOutputs { node: node.id() });
        }
        for edge in node.deps() {
            if !available.contains(&edge.node) {
                return Err(TopologyError::UseBeforeDefinition {
                    consumer: node.id(),
                    producer: edge.node,
                });
            }
            let outputs = graph.node(edge.node).outputs().len();
            if edge.port >= outputs {
                return Err(TopologyError::MissingPort {
                    consumer: node.id(),
                    producer: edge.node,
                    port: edge.port,
                    outputs,
                });
            }
        }
        available.insert(node.id());
    }
    Ok(())
}
