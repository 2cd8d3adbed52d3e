use thiserror::Error;

use super::layout::LayoutError;
use crate::hal::{BackendError, ops::OpKind};

/// Failures of graph preparation and execution. None of them are transient: each one names the
/// node, its operation kind and what went wrong.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The backend offers no implementation, or the operation is not registered.
    #[error("unsupported operation {kind} at node `{node}`: {reason}")]
    Unsupported {
        node: String,
        kind: OpKind,
        reason: String,
    },
    /// Malformed hints or priorities, or mismatched port counts.
    #[error("configuration error at node `{node}` ({kind}): {reason}")]
    Config {
        node: String,
        kind: OpKind,
        reason: String,
    },
    /// A phase was run out of order.
    #[error("precondition violated at node `{node}` ({kind}): {reason}")]
    Precondition {
        node: String,
        kind: OpKind,
        reason: String,
    },
    /// The graph is not a DAG, or buffer aliasing would form a cycle.
    #[error("structural error at node `{node}` ({kind}): {reason}")]
    Structural {
        node: String,
        kind: OpKind,
        reason: String,
    },
    #[error("backend failed at node `{node}` ({kind}): {source}")]
    Backend {
        node: String,
        kind: OpKind,
        #[source]
        source: BackendError,
    },
}

impl GraphError {
    /// Attributes a layout failure to a node: bad formats are configuration errors, anything
    /// else means a descriptor was used before it was resolved.
    pub(crate) fn layout(node: &str, kind: OpKind, err: LayoutError) -> Self {
        match err {
            LayoutError::Format(_) | LayoutError::Rank(..) => Self::Config {
                node: node.to_string(),
                kind,
                reason: err.to_string(),
            },
            _ => Self::Precondition {
                node: node.to_string(),
                kind,
                reason: err.to_string(),
            },
        }
    }

    #[inline]
    pub fn node(&self) -> &str {
        match self {
            GraphError::Unsupported { node, .. }
            | GraphError::Config { node, .. }
            | GraphError::Precondition { node, .. }
            | GraphError::Structural { node, .. }
            | GraphError::Backend { node, .. } => node,
        }
    }
}
