use super::CpuBackend;
use crate::{
    hal::{
        BackendError, BackendOp, ExecArgs,
        ops::{OpKind, SoftMax},
    },
    loom::{layout::TensorDesc, num::DataType},
};

impl BackendOp<CpuBackend> for SoftMax {
    fn execute(&self, _backend: &CpuBackend, args: ExecArgs<'_>) -> Result<(), BackendError> {
        args.expect(1, 1)?;
        let (input, output) = (&args.inputs[0], &args.outputs[0]);
        let desc = input.desc();
        if desc.data_type != DataType::F32 {
            return Err(BackendError::DataType(desc.data_type, OpKind::SoftMax));
        }
        let planar = TensorDesc::planar(desc.data_type, desc.shape.clone());
        if let Some(x) = [desc, output.desc()].into_iter().find(|x| !x.is_compatible(&planar)) {
            return Err(BackendError::Layout(x.clone(), OpKind::SoftMax));
        }

        let shape = &desc.shape;
        let axis = self.axis.min(shape.rank().max(1) - 1);
        let dim = shape.get(axis).copied().unwrap_or(1);
        let inner: usize = shape.iter().skip(axis + 1).product();
        let outer: usize = shape.iter().take(axis).product();

        let x = input.buffer().read_slice::<f32>();
        let mut y = vec![0.0f32; outer * dim * inner];
        for o in 0..outer {
            for i in 0..inner {
                let index = |d: usize| (o * dim + d) * inner + i;
                let max = (0..dim).map(|d| x[index(d)]).fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for d in 0..dim {
                    let e = (x[index(d)] - max).exp();
                    y[index(d)] = e;
                    sum += e;
                }
                for d in 0..dim {
                    y[index(d)] /= sum;
                }
            }
        }
        output.buffer().write_slice(&y);
        Ok(())
    }
}
