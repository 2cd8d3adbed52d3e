//! The hardware seam of the crate.
//!
//! A [`Backend`] answers two questions for the graph core: which kernel configurations it offers
//! for an operation ([`Backend::candidates`]), and how to run one of them over bound memory
//! ([`Backend::execute`]). Operation types live in [`ops`], their construction from model
//! descriptions in [`registry`], and a reference CPU backend in [`cpu`].

use std::{borrow::Cow, sync::Arc};

use derive_more::{Deref, Display};
use thiserror::Error;

use crate::loom::{
    buffer::Memory,
    layout::{LayoutError, TensorDesc},
    node::NodeConfig,
    num::DataType,
    weights::WeightBuffer,
};
use ops::{NodeOp, OpKind};

pub mod cpu;
pub mod ops;
pub mod registry;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no kernel for op {0}")]
    Unimplemented(String),
    #[error("data type {0} is not supported by {1}")]
    DataType(DataType, OpKind),
    #[error("layout {0} is not supported by {1}")]
    Layout(TensorDesc, OpKind),
    #[error("expected {expected} {what} buffers, found {found}")]
    Arity {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Memory(#[from] LayoutError),
}

/// An internal operation descriptor: what the backend is asked to implement.
#[derive(Debug, Clone)]
pub struct OpDesc {
    pub kind: OpKind,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    /// Weight blobs as declared by the model.
    pub weights: Vec<TensorDesc>,
}

/// One configuration a backend can run an [`OpDesc`] with.
#[derive(Debug, Clone)]
pub struct KernelCandidate {
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    /// Layouts the kernel expects its weights repacked into.
    pub weights: Vec<TensorDesc>,
    /// Implementation identifier, parsed into an [`ImplType`](crate::loom::impl_type::ImplType).
    pub impl_name: Cow<'static, str>,
    /// The kernel may write output 0 over input 0.
    pub in_place: bool,
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct StreamId(uid::Id<StreamId>);

/// Caller-supplied execution context.
#[derive(Debug, Default, Display)]
#[display("stream {id} ({launches} launches)")]
pub struct Stream {
    id: StreamId,
    launches: usize,
}

impl Stream {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Number of kernels launched on this stream.
    #[inline]
    pub fn launches(&self) -> usize {
        self.launches
    }

    #[inline]
    pub(crate) fn launch(&mut self) {
        self.launches += 1;
    }
}

/// Everything a kernel needs to run one node.
#[derive(Debug, Clone, Copy)]
pub struct ExecArgs<'a> {
    pub op: &'a dyn NodeOp,
    pub config: &'a NodeConfig,
    pub inputs: &'a [Memory],
    pub outputs: &'a [Memory],
    pub weights: &'a [Arc<WeightBuffer>],
}

impl ExecArgs<'_> {
    /// Checks the number of bound buffers.
    pub fn expect(&self, inputs: usize, outputs: usize) -> Result<(), BackendError> {
        match (self.inputs.len(), self.outputs.len()) {
            (found, _) if found != inputs => Err(BackendError::Arity {
                what: "input",
                expected: inputs,
                found,
            }),
            (_, found) if found != outputs => Err(BackendError::Arity {
                what: "output",
                expected: outputs,
                found,
            }),
            _ => Ok(()),
        }
    }
}

/// The kernel backend the graph core negotiates with.
pub trait Backend: Send + Sync {
    /// Every configuration supported for `desc`, in the backend's own order. May be empty.
    fn candidates(&self, desc: &OpDesc) -> Vec<KernelCandidate>;

    /// Runs the kernel of a finalized configuration over bound memory.
    fn execute(&self, stream: &mut Stream, args: ExecArgs<'_>) -> Result<(), BackendError>;
}

/// Implemented for each [`Backend`] for each [`NodeOp`] it has a kernel for.
pub trait BackendOp<B: Backend>: NodeOp {
    fn execute(&self, backend: &B, args: ExecArgs<'_>) -> Result<(), BackendError>;
}
