use std::{any::Any, borrow::Cow, sync::Arc};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use weft_derive::Operation;

use super::{KernelCandidate, OpDesc};
use crate::loom::{layout::TensorDesc, node::ConstantType};

/// Operation kinds a node may represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OpKind {
    Unknown,
    Input,
    Output,
    Reorder,
    Convolution,
    Deconvolution,
    Eltwise,
    Lrn,
    Pooling,
    FullyConnected,
    Gemm,
    SoftMax,
    Split,
    Concatenation,
    Reshape,
    Flatten,
    Tile,
    Pad,
    Permute,
    BatchNormalization,
    Convert,
    Interpolate,
    Reduce,
}

/// An immutable weight blob declared by the model, laid out as `desc`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WeightBlob {
    pub desc: TensorDesc,
    #[cfg_attr(feature = "serde", serde(with = "crate::loom::loader::arc_bytes"))]
    pub data: Arc<[u8]>,
}

impl WeightBlob {
    #[inline]
    pub fn new(desc: TensorDesc, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        Self { desc, data }
    }

    /// Creates a planar blob from typed elements.
    pub fn from_slice<T: crate::loom::num::Scalar>(
        shape: impl Into<crate::loom::shape::Shape>,
        data: &[T],
    ) -> Self {
        let desc = TensorDesc::planar(T::DATA_TYPE, shape);
        let data: Arc<[u8]> = bytemuck::cast_slice(data).into();
        Self { desc, data }
    }
}

/// Identity and data every operation exposes. Usually derived by forwarding to an [`OpBase`].
pub trait Operation: std::fmt::Debug + Send + Sync {
    fn kind(&self) -> OpKind;
    /// Weight blobs in the order kernels expect them.
    fn weights(&self) -> &[WeightBlob];
    fn as_any(&self) -> &dyn Any;
}

/// How an operation takes part in descriptor discovery and execution.
pub trait NodeOp: Operation {
    /// Internal operation descriptors the backend is queried with, one query per descriptor.
    fn descs(&self, inputs: &[TensorDesc], outputs: &[TensorDesc]) -> Vec<OpDesc> {
        let kind = self.kind();
        let inputs = inputs.to_vec();
        let outputs = outputs.to_vec();
        let weights = self.weights().iter().map(|w| w.desc.clone()).collect();
        vec![OpDesc {
            kind,
            inputs,
            outputs,
            weights,
        }]
    }

    /// Candidates the operation offers by itself. Such operations never reach the backend.
    fn builtin_candidates(
        &self,
        _inputs: &[TensorDesc],
        _outputs: &[TensorDesc],
    ) -> Option<Vec<KernelCandidate>> {
        None
    }

    /// Whether a kernel must run for this node.
    fn requires_execution(&self) -> bool {
        true
    }

    /// Constness known without looking at neighbors.
    fn constant(&self) -> ConstantType {
        ConstantType::Unknown
    }
}

/// Shared state of all operations.
#[derive(Debug, Clone)]
pub struct OpBase {
    pub kind: OpKind,
    pub weights: Vec<WeightBlob>,
}

impl OpBase {
    #[inline]
    pub fn new(kind: OpKind) -> Self {
        let weights = vec![];
        Self { kind, weights }
    }

    #[inline]
    pub fn with_weights(mut self, weights: Vec<WeightBlob>) -> Self {
        self.weights = weights;
        self
    }
}

impl Operation for OpBase {
    #[inline]
    fn kind(&self) -> OpKind {
        self.kind
    }

    #[inline]
    fn weights(&self) -> &[WeightBlob] {
        &self.weights
    }

    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

const BUILTIN: Cow<'static, str> = Cow::Borrowed("unknown");

/// Graph input or constant (literal / parameter) source.
#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct Input {
    #[operation]
    pub base: OpBase,
    pub constant: bool,
}

impl NodeOp for Input {
    fn builtin_candidates(
        &self,
        _inputs: &[TensorDesc],
        outputs: &[TensorDesc],
    ) -> Option<Vec<KernelCandidate>> {
        let outputs = outputs
            .iter()
            .map(|desc| TensorDesc::planar(desc.data_type, desc.shape.clone()))
            .collect();
        Some(vec![KernelCandidate {
            inputs: vec![],
            outputs,
            weights: vec![],
            impl_name: BUILTIN,
            in_place: false,
        }])
    }

    fn requires_execution(&self) -> bool {
        false
    }

    fn constant(&self) -> ConstantType {
        match self.constant {
            true => ConstantType::Const,
            false => ConstantType::NoConst,
        }
    }
}

/// Graph output sink. Accepts whatever layout its producer settles on.
#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct Output(pub OpBase);

impl NodeOp for Output {
    fn builtin_candidates(
        &self,
        inputs: &[TensorDesc],
        _outputs: &[TensorDesc],
    ) -> Option<Vec<KernelCandidate>> {
        Some(vec![KernelCandidate {
            inputs: inputs.to_vec(),
            outputs: vec![],
            weights: vec![],
            impl_name: BUILTIN,
            in_place: false,
        }])
    }

    fn requires_execution(&self) -> bool {
        false
    }

    fn constant(&self) -> ConstantType {
        ConstantType::NoConst
    }
}

/// Reinterprets its input under a new shape. Always a view of the input buffer.
#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct Reshape(pub OpBase);

impl NodeOp for Reshape {
    fn builtin_candidates(
        &self,
        inputs: &[TensorDesc],
        outputs: &[TensorDesc],
    ) -> Option<Vec<KernelCandidate>> {
        let planar = |desc: &TensorDesc| TensorDesc::planar(desc.data_type, desc.shape.clone());
        Some(vec![KernelCandidate {
            inputs: inputs.iter().map(planar).collect(),
            outputs: outputs.iter().map(planar).collect(),
            weights: vec![],
            impl_name: BUILTIN,
            in_place: true,
        }])
    }

    fn requires_execution(&self) -> bool {
        false
    }
}

/// Layout conversion between two concrete descriptors.
#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct Reorder(pub OpBase);

impl NodeOp for Reorder {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvAttrs {
    pub strides: Vec<usize>,
    pub pads_begin: Vec<usize>,
    pub pads_end: Vec<usize>,
    pub dilations: Vec<usize>,
    pub group: usize,
}

impl Default for ConvAttrs {
    fn default() -> Self {
        Self {
            strides: vec![1, 1],
            pads_begin: vec![0, 0],
            pads_end: vec![0, 0],
            dilations: vec![1, 1],
            group: 1,
        }
    }
}

#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct Convolution {
    #[operation]
    pub base: OpBase,
    pub attrs: ConvAttrs,
}

impl NodeOp for Convolution {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PoolMethod {
    #[display("max")]
    Max,
    #[display("avg")]
    Avg,
}

#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct Pooling {
    #[operation]
    pub base: OpBase,
    pub method: PoolMethod,
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
}

impl NodeOp for Pooling {}

#[derive(Debug, Clone, Copy, PartialEq, Display)]
pub enum EltwiseFunc {
    Relu,
    Relu6,
    Gelu,
    Elu,
    Sigmoid,
    Tanh,
    Exp,
    Abs,
    Not,
    Clamp,
    Swish,
    HSwish,
    Mish,
    HSigmoid,
    Round,
    Erf,
    ScaleShift,
    PRelu,
    Add,
    Multiply,
    Maximum,
    Power,
    Mod,
}

impl EltwiseFunc {
    /// Maps a model operation name, plus the `operation`/`type` parameter of the generic
    /// `Eltwise`/`Activation` names, to a function.
    pub fn from_name(name: &str, param: Option<&str>) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let func = match name.as_str() {
            "relu" => Self::Relu,
            "relu6" => Self::Relu6,
            "gelu" => Self::Gelu,
            "elu" => Self::Elu,
            "sigmoid" | "logistic" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "exp" => Self::Exp,
            "abs" => Self::Abs,
            "not" => Self::Not,
            "clamp" => Self::Clamp,
            "swish" => Self::Swish,
            "hswish" => Self::HSwish,
            "mish" => Self::Mish,
            "hsigmoid" => Self::HSigmoid,
            "round" => Self::Round,
            "erf" => Self::Erf,
            "scaleshift" => Self::ScaleShift,
            "prelu" => Self::PRelu,
            "power" => Self::Power,
            "mod" => Self::Mod,
            "eltwise" => match param.map(str::to_ascii_lowercase).as_deref() {
                None | Some("sum") => Self::Add,
                Some("prod" | "mul") => Self::Multiply,
                Some("max") => Self::Maximum,
                Some(_) => return None,
            },
            "activation" => return Self::from_name(param?, None),
            _ => return None,
        };
        Some(func)
    }

    /// Number of data inputs the function consumes.
    pub const fn arity(self) -> usize {
        match self {
            Self::Add | Self::Multiply | Self::Maximum | Self::Power | Self::Mod | Self::PRelu => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct Eltwise {
    #[operation]
    pub base: OpBase,
    pub func: EltwiseFunc,
}

impl NodeOp for Eltwise {}

#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct SoftMax {
    #[operation]
    pub base: OpBase,
    pub axis: usize,
}

impl NodeOp for SoftMax {}

#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct FullyConnected(pub OpBase);

impl NodeOp for FullyConnected {}

#[derive(Debug, Clone, Operation)]
#[operation(crate = "crate")]
pub struct Concat {
    #[operation]
    pub base: OpBase,
    pub axis: usize,
}

impl NodeOp for Concat {}

#[cfg(test)]
mod tests {
    use super::{EltwiseFunc, Input, NodeOp, OpBase, OpKind, Operation, Reshape};
    use crate::loom::{layout::TensorDesc, node::ConstantType, num::DataType};

    #[test]
    fn test_eltwise_names() {
        assert_eq!(EltwiseFunc::from_name("ReLU", None), Some(EltwiseFunc::Relu));
        assert_eq!(
            EltwiseFunc::from_name("Logistic", None),
            Some(EltwiseFunc::Sigmoid)
        );
        assert_eq!(
            EltwiseFunc::from_name("Eltwise", Some("prod")),
            Some(EltwiseFunc::Multiply)
        );
        assert_eq!(
            EltwiseFunc::from_name("Activation", Some("tanh")),
            Some(EltwiseFunc::Tanh)
        );
        assert_eq!(EltwiseFunc::from_name("Eltwise", Some("xor")), None);
        assert_eq!(EltwiseFunc::Add.arity(), 2);
    }

    #[test]
    fn test_derived_forwarding() {
        let input = Input {
            base: OpBase::new(OpKind::Input),
            constant: true,
        };
        assert_eq!(input.kind(), OpKind::Input);
        assert!(input.weights().is_empty());
        assert!(input.as_any().downcast_ref::<Input>().is_some());
        assert_eq!(input.constant(), ConstantType::Const);
        assert!(!input.requires_execution());
    }

    #[test]
    fn test_reshape_is_in_place_view() {
        let reshape = Reshape(OpBase::new(OpKind::Reshape));
        let inputs = [TensorDesc::any(DataType::F32, [1, 3, 4, 4])];
        let outputs = [TensorDesc::any(DataType::F32, [1, 48])];
        let candidates = reshape
            .builtin_candidates(&inputs, &outputs)
            .unwrap_or_default();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].in_place);
        assert!(candidates[0].outputs[0].is_concrete());
        assert_eq!(candidates[0].outputs[0].shape, outputs[0].shape);
    }
}
