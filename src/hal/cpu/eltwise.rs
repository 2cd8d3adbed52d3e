use half::{bf16, f16};

use super::CpuBackend;
use crate::{
    hal::{
        BackendError, BackendOp, ExecArgs,
        ops::{Eltwise, EltwiseFunc, OpKind},
    },
    loom::{
        buffer::Memory,
        num::{DataType, Float},
    },
};

fn unary(func: EltwiseFunc) -> Option<fn(f32) -> f32> {
    let f: fn(f32) -> f32 = match func {
        EltwiseFunc::Relu => |x| x.max(0.0),
        EltwiseFunc::Relu6 => |x| x.clamp(0.0, 6.0),
        EltwiseFunc::Sigmoid => |x| 1.0 / (1.0 + (-x).exp()),
        EltwiseFunc::Tanh => f32::tanh,
        EltwiseFunc::Exp => f32::exp,
        EltwiseFunc::Abs => f32::abs,
        _ => return None,
    };
    Some(f)
}

fn binary(func: EltwiseFunc) -> Option<fn(f32, f32) -> f32> {
    let f: fn(f32, f32) -> f32 = match func {
        EltwiseFunc::Add => |x, y| x + y,
        EltwiseFunc::Multiply => |x, y| x * y,
        EltwiseFunc::Maximum => f32::max,
        _ => return None,
    };
    Some(f)
}

/// Elements covered by the descriptor of `memory`, padding included.
fn load<T: Float>(memory: &Memory) -> Result<Vec<T>, BackendError> {
    let count = memory.desc().size_in_bytes()? / memory.desc().data_type.size();
    let mut data = memory.buffer().read_slice::<T>();
    data.truncate(count);
    Ok(data)
}

fn run<T: Float>(func: EltwiseFunc, args: &ExecArgs<'_>) -> Result<(), BackendError> {
    let output = &args.outputs[0];
    let data: Vec<T> = match (unary(func), binary(func)) {
        (Some(f), _) => {
            let x = load::<T>(&args.inputs[0])?;
            #[cfg(not(feature = "rayon"))]
            let data = x.iter().map(|&x| T::from_f32(f(x.to_f32()))).collect();
            #[cfg(feature = "rayon")]
            let data = {
                use rayon::prelude::*;
                x.par_iter().map(|&x| T::from_f32(f(x.to_f32()))).collect()
            };
            data
        }
        (_, Some(f)) => {
            let x = load::<T>(&args.inputs[0])?;
            let y = load::<T>(&args.inputs[1])?;
            #[cfg(not(feature = "rayon"))]
            let data = {
                use itertools::Itertools;
                x.iter()
                    .zip_eq(y.iter())
                    .map(|(&x, &y)| T::from_f32(f(x.to_f32(), y.to_f32())))
                    .collect()
            };
            #[cfg(feature = "rayon")]
            let data = {
                use rayon::prelude::*;
                x.par_iter()
                    .zip_eq(y.par_iter())
                    .map(|(&x, &y)| T::from_f32(f(x.to_f32(), y.to_f32())))
                    .collect()
            };
            data
        }
        _ => return Err(BackendError::Unimplemented(format!("eltwise {func}"))),
    };
    output.buffer().write_slice(&data);
    Ok(())
}

impl BackendOp<CpuBackend> for Eltwise {
    fn execute(&self, _backend: &CpuBackend, args: ExecArgs<'_>) -> Result<(), BackendError> {
        args.expect(self.func.arity(), 1)?;
        // elementwise math is layout-agnostic as long as every port is laid out alike
        let output = args.outputs[0].desc();
        if let Some(x) = args.inputs.iter().find(|x| !x.desc().is_compatible(output)) {
            return Err(BackendError::Layout(x.desc().clone(), OpKind::Eltwise));
        }
        match output.data_type {
            DataType::F32 => run::<f32>(self.func, &args),
            DataType::F16 => run::<f16>(self.func, &args),
            DataType::BF16 => run::<bf16>(self.func, &args),
            data_type => Err(BackendError::DataType(data_type, OpKind::Eltwise)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;
    use itertools::Itertools;

    use crate::{
        hal::{
            BackendError, BackendOp, ExecArgs,
            cpu::CpuBuilder,
            ops::{Eltwise, EltwiseFunc, OpBase, OpKind},
        },
        loom::{
            buffer::Memory,
            layout::{Format, TensorDesc},
            node::NodeConfig,
            num::DataType,
        },
    };

    fn eltwise(func: EltwiseFunc) -> Eltwise {
        let base = OpBase::new(OpKind::Eltwise);
        Eltwise { base, func }
    }

    fn exec(
        op: &Eltwise,
        inputs: &[Memory],
        outputs: &[Memory],
    ) -> Result<(), BackendError> {
        let backend = CpuBuilder::new().build();
        let config = NodeConfig::default();
        let args = ExecArgs {
            op,
            config: &config,
            inputs,
            outputs,
            weights: &[],
        };
        op.execute(&backend, args)
    }

    #[test]
    fn test_add_f32() -> Result<(), Box<dyn Error>> {
        const C: usize = 1000;
        let desc = TensorDesc::planar(DataType::F32, [C]);
        let x = (0..C).map(|_| fastrand::f32()).collect_vec();
        let y = (0..C).map(|_| fastrand::f32()).collect_vec();

        let a = Memory::alloc(desc.clone())?;
        let b = Memory::alloc(desc.clone())?;
        let z = Memory::alloc(desc)?;
        a.buffer().write_slice(&x);
        b.buffer().write_slice(&y);
        exec(&eltwise(EltwiseFunc::Add), &[a, b], &[z.clone()])?;

        let r = x.iter().zip_eq(y.iter()).map(|(x, y)| x + y).collect_vec();
        assert_eq!(z.buffer().read_slice::<f32>(), r);
        Ok(())
    }

    #[test]
    fn test_sigmoid_f16_in_place() -> Result<(), Box<dyn Error>> {
        let desc = TensorDesc::planar(DataType::F16, [4]);
        let x = [-2.0f32, 0.0, 1.0, 4.0].map(f16::from_f32);
        let memory = Memory::alloc(desc)?;
        memory.buffer().write_slice(&x);
        exec(&eltwise(EltwiseFunc::Sigmoid), &[memory.clone()], &[memory.clone()])?;

        let r = x.map(|x| f16::from_f32(1.0 / (1.0 + (-x.to_f32()).exp())));
        assert_eq!(memory.buffer().read_slice::<f16>(), r);
        Ok(())
    }

    #[test]
    fn test_blocked_relu_keeps_padding() -> Result<(), Box<dyn Error>> {
        // three channels padded to a block of eight
        let desc = TensorDesc::with_format(DataType::F32, [1, 3, 1, 1], Format::NChw8c)?;
        let memory = Memory::alloc(desc)?;
        let x = [-1.0f32, 2.0, -3.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        memory.buffer().write_slice(&x);
        exec(&eltwise(EltwiseFunc::Relu), &[memory.clone()], &[memory.clone()])?;
        assert_eq!(
            memory.buffer().read_slice::<f32>(),
            [0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
        Ok(())
    }

    #[test]
    fn test_rejections() -> Result<(), Box<dyn Error>> {
        let planar = Memory::alloc(TensorDesc::planar(DataType::F32, [1, 8, 1, 1]))?;
        let blocked = Memory::alloc(TensorDesc::with_format(
            DataType::F32,
            [1, 8, 1, 1],
            Format::NChw8c,
        )?)?;
        let relu = eltwise(EltwiseFunc::Relu);
        assert!(matches!(
            exec(&relu, &[planar.clone()], &[blocked.clone()]),
            Err(BackendError::Layout(..))
        ));
        assert!(matches!(
            exec(&relu, &[planar.clone(), planar.clone()], &[planar.clone()]),
            Err(BackendError::Arity { .. })
        ));
        assert!(matches!(
            exec(&eltwise(EltwiseFunc::Gelu), &[planar.clone()], &[planar.clone()]),
            Err(BackendError::Unimplemented(_))
        ));

        let ints = Memory::alloc(TensorDesc::planar(DataType::I32, [4]))?;
        assert!(matches!(
            exec(&relu, &[ints.clone()], &[ints]),
            Err(BackendError::DataType(DataType::I32, OpKind::Eltwise))
        ));
        Ok(())
    }
}
