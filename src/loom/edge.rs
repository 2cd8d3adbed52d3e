use derive_more::{Display, From, Into};
use thiserror::Error;

use super::{buffer::Memory, node::NodeId, shape::Shape};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into)]
#[display("e{_0}")]
pub struct EdgeId(pub(crate) usize);

/// Lifecycle of an edge. Only ever moves forward.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeStatus {
    #[default]
    Uninitialized,
    NotAllocated,
    Allocated,
    Validated,
}

#[derive(Debug, Error)]
#[error("edge status cannot move from {from} back to {to}")]
pub struct StatusError {
    pub from: EdgeStatus,
    pub to: EdgeStatus,
}

/// Carries one tensor from a producer's output port to a consumer's input port.
#[derive(Debug, Clone)]
pub struct Edge {
    pub(crate) parent: NodeId,
    pub(crate) parent_port: usize,
    pub(crate) child: NodeId,
    pub(crate) child_port: usize,
    /// Declared shape of the producer's output port.
    pub(crate) shape: Shape,
    pub(crate) status: EdgeStatus,
    pub(crate) memory: Option<Memory>,
    /// The edge whose memory this one aliases.
    pub(crate) shared: Option<EdgeId>,
}

impl Edge {
    pub(crate) fn new(
        parent: NodeId,
        parent_port: usize,
        child: NodeId,
        child_port: usize,
        shape: Shape,
    ) -> Self {
        Self {
            parent,
            parent_port,
            child,
            child_port,
            shape,
            status: EdgeStatus::Uninitialized,
            memory: None,
            shared: None,
        }
    }

    #[inline]
    pub fn parent(&self) -> NodeId {
        self.parent
    }

    #[inline]
    pub fn parent_port(&self) -> usize {
        self.parent_port
    }

    #[inline]
    pub fn child(&self) -> NodeId {
        self.child
    }

    #[inline]
    pub fn child_port(&self) -> usize {
        self.child_port
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn status(&self) -> EdgeStatus {
        self.status
    }

    #[inline]
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    /// The edge whose buffer this one aliases, if any.
    #[inline]
    pub fn shared(&self) -> Option<EdgeId> {
        self.shared
    }

    /// Advances the status. Staying put is allowed; going back is not.
    pub fn change_status(&mut self, status: EdgeStatus) -> Result<(), StatusError> {
        if status < self.status {
            let from = self.status;
            return Err(StatusError { from, to: status });
        }
        self.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Edge, EdgeStatus};
    use crate::loom::{node::NodeId, shape::Shape};

    #[test]
    fn test_status_is_monotonic() {
        let mut edge = Edge::new(NodeId(0), 0, NodeId(1), 0, Shape::from([4]));
        assert_eq!(edge.status(), EdgeStatus::Uninitialized);
        assert!(edge.change_status(EdgeStatus::NotAllocated).is_ok());
        assert!(edge.change_status(EdgeStatus::Allocated).is_ok());
        assert!(edge.change_status(EdgeStatus::Allocated).is_ok());
        assert!(edge.change_status(EdgeStatus::NotAllocated).is_err());
        assert_eq!(edge.status(), EdgeStatus::Allocated);
    }
}
