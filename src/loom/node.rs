use std::{borrow::Cow, sync::Arc};

use derive_more::{Display, From, Into};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    edge::EdgeId, error::GraphError, impl_type::ImplType, layout::Format, layout::TensorDesc,
    weights::WeightBuffer,
};
use crate::hal::{
    KernelCandidate,
    ops::{NodeOp, OpKind},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into)]
#[display("n{_0}")]
pub struct NodeId(pub(crate) usize);

/// Result of constant propagation.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConstantType {
    #[default]
    Unknown,
    Const,
    NoConst,
}

/// Layout of one port in a candidate configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub desc: TensorDesc,
    /// Index of the opposite-side port this one shares a buffer with.
    pub in_place: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub inputs: Vec<PortConfig>,
    pub outputs: Vec<PortConfig>,
    pub weights: Vec<TensorDesc>,
}

/// A candidate kernel configuration of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveDesc {
    pub config: NodeConfig,
    pub impl_type: ImplType,
    pub impl_name: Cow<'static, str>,
}

impl PrimitiveDesc {
    /// Builds a configuration from what the backend reported. Output 0 is marked in-place with
    /// input 0 only if both the kernel and the graph allow it.
    pub fn new(candidate: KernelCandidate, in_place: bool) -> Self {
        let in_place = in_place && candidate.in_place && !candidate.inputs.is_empty();
        let inputs = candidate
            .inputs
            .into_iter()
            .map(|desc| PortConfig {
                desc,
                in_place: None,
            })
            .collect();
        let outputs = candidate
            .outputs
            .into_iter()
            .enumerate()
            .map(|(index, desc)| PortConfig {
                desc,
                in_place: (in_place && index == 0).then_some(0),
            })
            .collect();
        let weights = candidate.weights;
        let config = NodeConfig {
            inputs,
            outputs,
            weights,
        };
        let impl_type = ImplType::parse(&candidate.impl_name);
        let impl_name = candidate.impl_name;
        Self {
            config,
            impl_type,
            impl_name,
        }
    }
}

/// A graph vertex running one operation.
#[derive(Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) op: Box<dyn NodeOp>,
    /// Declared by the model: element type and shape, no layout.
    pub(crate) inputs: Vec<TensorDesc>,
    pub(crate) outputs: Vec<TensorDesc>,
    pub(crate) parent_edges: Vec<EdgeId>,
    pub(crate) child_edges: Vec<EdgeId>,
    pub(crate) candidates: Vec<PrimitiveDesc>,
    pub(crate) selected: Option<usize>,
    pub(crate) constant: ConstantType,
    pub(crate) priorities: Vec<ImplType>,
    pub(crate) input_formats: Vec<Format>,
    pub(crate) output_formats: Vec<Format>,
    pub(crate) weights: Vec<Arc<WeightBuffer>>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        op: Box<dyn NodeOp>,
        inputs: Vec<TensorDesc>,
        outputs: Vec<TensorDesc>,
    ) -> Self {
        Self {
            id,
            name,
            op,
            inputs,
            outputs,
            parent_edges: vec![],
            child_edges: vec![],
            candidates: vec![],
            selected: None,
            constant: ConstantType::Unknown,
            priorities: vec![],
            input_formats: vec![],
            output_formats: vec![],
            weights: vec![],
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    #[inline]
    pub fn op(&self) -> &dyn NodeOp {
        self.op.as_ref()
    }

    #[inline]
    pub fn inputs(&self) -> &[TensorDesc] {
        &self.inputs
    }

    #[inline]
    pub fn outputs(&self) -> &[TensorDesc] {
        &self.outputs
    }

    #[inline]
    pub fn parent_edges(&self) -> &[EdgeId] {
        &self.parent_edges
    }

    #[inline]
    pub fn child_edges(&self) -> &[EdgeId] {
        &self.child_edges
    }

    #[inline]
    pub fn candidates(&self) -> &[PrimitiveDesc] {
        &self.candidates
    }

    #[inline]
    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    #[inline]
    pub fn selected(&self) -> Option<&PrimitiveDesc> {
        self.selected.and_then(|index| self.candidates.get(index))
    }

    #[inline]
    pub(crate) fn selected_mut(&mut self) -> Option<&mut PrimitiveDesc> {
        self.selected.and_then(|index| self.candidates.get_mut(index))
    }

    /// The selected configuration, or a precondition failure naming `phase`.
    pub(crate) fn selected_or(&self, phase: &str) -> Result<&PrimitiveDesc, GraphError> {
        self.selected()
            .ok_or_else(|| self.precondition(format!("{phase} before a descriptor is selected")))
    }

    /// Cached constness; [`ConstantType::Unknown`] until resolved.
    #[inline]
    pub fn constant(&self) -> ConstantType {
        self.constant
    }

    #[inline]
    pub fn priorities(&self) -> &[ImplType] {
        &self.priorities
    }

    #[inline]
    pub fn weights(&self) -> &[Arc<WeightBuffer>] {
        &self.weights
    }

    /// Whether the selected descriptor lets any port share a buffer.
    pub fn is_in_place(&self) -> Result<bool, GraphError> {
        let desc = self.selected_or("in-place query")?;
        let config = &desc.config;
        Ok(config
            .inputs
            .iter()
            .chain(config.outputs.iter())
            .any(|port| port.in_place.is_some()))
    }

    /// Implementation kind of the selected descriptor with the element type of its first port,
    /// e.g. `jit_avx2_F32`.
    pub fn primitive_descriptor_type(&self) -> Result<String, GraphError> {
        let desc = self.selected_or("descriptor type query")?;
        let config = &desc.config;
        let port = config.inputs.first().or(config.outputs.first());
        Ok(match port {
            Some(port) => format!("{}_{}", desc.impl_type, port.desc.data_type),
            None => desc.impl_type.to_string(),
        })
    }

    /// First dimension of the first declared port.
    pub fn max_batch(&self) -> usize {
        match self.inputs.first().or(self.outputs.first()) {
            Some(desc) => desc.shape.first().copied().unwrap_or(1),
            None => 0,
        }
    }

    pub(crate) fn unsupported(&self, reason: impl Into<String>) -> GraphError {
        GraphError::Unsupported {
            node: self.name.clone(),
            kind: self.kind(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config_error(&self, reason: impl Into<String>) -> GraphError {
        GraphError::Config {
            node: self.name.clone(),
            kind: self.kind(),
            reason: reason.into(),
        }
    }

    pub(crate) fn precondition(&self, reason: impl Into<String>) -> GraphError {
        GraphError::Precondition {
            node: self.name.clone(),
            kind: self.kind(),
            reason: reason.into(),
        }
    }

    pub(crate) fn structural(&self, reason: impl Into<String>) -> GraphError {
        GraphError::Structural {
            node: self.name.clone(),
            kind: self.kind(),
            reason: reason.into(),
        }
    }
}
