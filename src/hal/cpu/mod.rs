//! A reference CPU backend.
//!
//! Candidates mirror what an optimized CPU library would offer: the wide and narrow channel-blocked
//! layouts first, then planar ones. Only a few kernels actually run; anything else reports
//! [`BackendError::Unimplemented`].

use std::{any::TypeId, borrow::Cow, sync::Arc};

use rustc_hash::FxHashMap as HashMap;

use super::{
    Backend, BackendError, BackendOp, ExecArgs, KernelCandidate, OpDesc, Stream,
    ops::{Eltwise, NodeOp, OpKind, Reorder, SoftMax},
};
use crate::loom::layout::{Format, TensorDesc};

mod eltwise;
mod reorder;
mod softmax;

pub type OpVTable = HashMap<
    TypeId,
    fn(&CpuBackend, &dyn NodeOp, ExecArgs<'_>) -> Result<(), BackendError>,
>;

#[derive(Debug, Clone)]
pub struct CpuBackend {
    /// Kernels the backend is able to run, keyed by operation type.
    ops: Arc<OpVTable>,
}

impl Backend for CpuBackend {
    fn candidates(&self, desc: &OpDesc) -> Vec<KernelCandidate> {
        let Some(first) = desc.inputs.first().or(desc.outputs.first()) else {
            return vec![];
        };
        if !first.data_type.is_float() {
            log::debug!("no cpu candidates for {} on {}", desc.kind, first.data_type);
            return vec![];
        }

        let rank = first.shape.rank();
        let blocked = |block| {
            Format::available(rank)
                .iter()
                .copied()
                .find(move |format| format.block() == Some(block))
        };
        let wide = blocked(16).map(|x| (x, "jit:avx512"));
        let narrow = blocked(8).map(|x| (x, "jit:avx2"));

        use OpKind as K;
        match desc.kind {
            K::Eltwise | K::Pooling => {
                let in_place = desc.kind == K::Eltwise && desc.inputs.len() == 1;
                let mut candidates = wide
                    .into_iter()
                    .chain(narrow)
                    .filter_map(|(format, name)| formatted(desc, Some(format), false, name))
                    .collect::<Vec<_>>();
                candidates.extend(formatted(desc, None, false, "jit:uni"));
                candidates.extend(formatted(desc, None, false, "ref:any"));
                for candidate in &mut candidates {
                    candidate.in_place = in_place;
                }
                candidates
            }
            K::Convolution | K::Deconvolution => wide
                .into_iter()
                .chain(narrow)
                .filter_map(|(format, name)| formatted(desc, Some(format), true, name))
                .chain(formatted(desc, None, false, "gemm:blas"))
                .chain(formatted(desc, None, false, "ref:any"))
                .collect(),
            K::FullyConnected | K::Gemm => formatted(desc, None, false, "gemm:blas")
                .into_iter()
                .chain(formatted(desc, None, false, "ref:any"))
                .collect(),
            K::SoftMax | K::Concatenation => formatted(desc, None, false, "ref:any")
                .into_iter()
                .collect(),
            K::Reorder => {
                let any = |x: &TensorDesc| TensorDesc::any(x.data_type, x.shape.clone());
                vec![KernelCandidate {
                    inputs: desc.inputs.iter().map(any).collect(),
                    outputs: desc.outputs.iter().map(any).collect(),
                    weights: desc.weights.clone(),
                    impl_name: Cow::Borrowed("ref:any"),
                    in_place: false,
                }]
            }
            _ => vec![],
        }
    }

    fn execute(&self, _stream: &mut Stream, args: ExecArgs<'_>) -> Result<(), BackendError> {
        let id = args.op.as_any().type_id();
        match self.ops.get(&id) {
            Some(f) => f(self, args.op, args),
            None => {
                let kind = args.op.kind();
                log::error!("unable to execute op of kind {kind}");
                Err(BackendError::Unimplemented(kind.to_string()))
            }
        }
    }
}

/// Lays every data port of `desc` out as `format`, or planar if `None`. Weights stay planar unless
/// `blocked_weights` asks for them in `format` too.
fn formatted(
    desc: &OpDesc,
    format: Option<Format>,
    blocked_weights: bool,
    impl_name: &'static str,
) -> Option<KernelCandidate> {
    let layout = |x: &TensorDesc, format: Option<Format>| match format {
        Some(format) => TensorDesc::with_format(x.data_type, x.shape.clone(), format).ok(),
        None => Some(TensorDesc::planar(x.data_type, x.shape.clone())),
    };
    let inputs = desc
        .inputs
        .iter()
        .map(|x| layout(x, format))
        .collect::<Option<Vec<_>>>()?;
    let outputs = desc
        .outputs
        .iter()
        .map(|x| layout(x, format))
        .collect::<Option<Vec<_>>>()?;
    let weights = desc
        .weights
        .iter()
        .map(|x| layout(x, format.filter(|_| blocked_weights)))
        .collect::<Option<Vec<_>>>()?;
    Some(KernelCandidate {
        inputs,
        outputs,
        weights,
        impl_name: Cow::Borrowed(impl_name),
        in_place: false,
    })
}

#[derive(Debug, Default, Clone)]
pub struct CpuBuilder {
    pub ops: OpVTable,
}

impl CpuBuilder {
    /// A builder with every reference kernel registered.
    pub fn new() -> Self {
        Self::default()
            .add_op::<Eltwise>()
            .add_op::<SoftMax>()
            .add_op::<Reorder>()
    }

    pub fn build(self) -> CpuBackend {
        let ops = Arc::new(self.ops);
        CpuBackend { ops }
    }

    pub fn add_op<Op: NodeOp + BackendOp<CpuBackend> + 'static>(mut self) -> Self {
        let id = TypeId::of::<Op>();
        let f: fn(&CpuBackend, &dyn NodeOp, ExecArgs<'_>) -> Result<(), BackendError> =
            |backend, op, args| match op.as_any().downcast_ref::<Op>() {
                Some(op) => op.execute(backend, args),
                None => Err(BackendError::Unimplemented(op.kind().to_string())),
            };
        self.ops.insert(id, f);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::CpuBuilder;
    use crate::{
        hal::{Backend, OpDesc, Stream, ops::OpKind},
        loom::{
            config::GraphBuilder,
            error::GraphError,
            graph::tests::chain,
            layout::{Format, TensorDesc},
            loader::NodeSpec,
            num::DataType,
        },
    };

    fn desc(kind: OpKind, shape: [usize; 4]) -> OpDesc {
        let x = TensorDesc::any(DataType::F32, shape);
        OpDesc {
            kind,
            inputs: vec![x.clone()],
            outputs: vec![x],
            weights: vec![],
        }
    }

    #[test]
    fn test_candidates() {
        let backend = CpuBuilder::new().build();
        let candidates = backend.candidates(&desc(OpKind::Eltwise, [1, 16, 4, 4]));
        let names = candidates.iter().map(|x| x.impl_name.as_ref()).collect::<Vec<_>>();
        assert_eq!(names, ["jit:avx512", "jit:avx2", "jit:uni", "ref:any"]);
        assert_eq!(candidates[0].inputs[0].format(), Some(Format::NChw16c));
        assert_eq!(candidates[1].outputs[0].format(), Some(Format::NChw8c));
        assert_eq!(candidates[2].inputs[0].format(), Some(Format::Nchw));
        assert!(candidates.iter().all(|x| x.in_place));

        let candidates = backend.candidates(&desc(OpKind::SoftMax, [1, 16, 4, 4]));
        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].in_place);

        let candidates = backend.candidates(&desc(OpKind::Reorder, [1, 16, 4, 4]));
        assert!(!candidates[0].inputs[0].is_concrete());

        let mut ints = desc(OpKind::Eltwise, [1, 16, 4, 4]);
        ints.inputs[0].data_type = DataType::I32;
        assert!(backend.candidates(&ints).is_empty());
        assert!(backend.candidates(&desc(OpKind::Lrn, [1, 16, 4, 4])).is_empty());
    }

    #[test]
    fn test_conv_weights_follow_blocking() {
        let backend = CpuBuilder::new().build();
        let mut conv = desc(OpKind::Convolution, [1, 16, 4, 4]);
        conv.weights = vec![TensorDesc::planar(DataType::F32, [16, 16, 3, 3])];
        let candidates = backend.candidates(&conv);
        assert_eq!(candidates[0].weights[0].format(), Some(Format::NChw16c));
        assert_eq!(candidates[2].impl_name, "gemm:blas");
        assert_eq!(candidates[2].weights[0].format(), Some(Format::Nchw));
    }

    #[test]
    fn test_prepare_and_execute() -> Result<(), Box<dyn Error>> {
        let shape = [1, 8, 2, 2];
        let mut graph = GraphBuilder::new(CpuBuilder::new().build()).build();
        let [input, relu, output] = chain(&mut graph, &shape)?;
        graph.prepare()?;

        // unary eltwise runs in place, so all three edges share one buffer
        let memory = |edge| graph.edge(edge).map(|x| x.memory().cloned());
        let source = memory(graph.child_edge_at(input, 0)?)?.ok_or("unbound input")?;
        let sink = memory(graph.parent_edge_at(output, 0)?)?.ok_or("unbound output")?;
        assert!(source.buffer().same_storage(sink.buffer()));

        let data = (0..32).map(|x| x as f32 - 16.0).collect::<Vec<_>>();
        source.buffer().write_slice(&data);

        let mut stream = Stream::new();
        for id in graph.topological_order()? {
            graph.execute(id, &mut stream)?;
        }
        assert_eq!(stream.launches(), 1);

        // the uni kernel ranks first, so the layout stays planar
        let expected = data.iter().map(|x| x.max(0.0)).collect::<Vec<_>>();
        assert_eq!(sink.desc().format(), Some(Format::Nchw));
        assert_eq!(sink.buffer().read_slice::<f32>(), expected);

        let relu = graph.node(relu)?;
        assert!(relu.is_in_place()?);
        Ok(())
    }

    #[test]
    fn test_missing_kernel() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(CpuBuilder::new().build()).build();
        let spec = NodeSpec::new("pool", "Pooling")
            .input(DataType::F32, [1, 8, 2, 2])
            .output(DataType::F32, [1, 8, 1, 1])
            .param("kernel", "2,2");
        let input =
            graph.add_node(&NodeSpec::new("input", "Input").output(DataType::F32, [1, 8, 2, 2]))?;
        let pool = graph.add_node(&spec)?;
        let output =
            graph.add_node(&NodeSpec::new("output", "Output").input(DataType::F32, [1, 8, 1, 1]))?;
        graph.connect(input, 0, pool, 0)?;
        graph.connect(pool, 0, output, 0)?;
        graph.prepare()?;

        let mut stream = Stream::new();
        assert!(matches!(
            graph.execute(pool, &mut stream),
            Err(GraphError::Backend { .. })
        ));
        assert_eq!(stream.launches(), 0);
        Ok(())
    }
}
