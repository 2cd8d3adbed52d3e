use super::CpuBackend;
use crate::{
    hal::{BackendError, BackendOp, ExecArgs, ops::Reorder},
    loom::layout,
};

impl BackendOp<CpuBackend> for Reorder {
    fn execute(&self, _backend: &CpuBackend, args: ExecArgs<'_>) -> Result<(), BackendError> {
        args.expect(1, 1)?;
        let (input, output) = (&args.inputs[0], &args.outputs[0]);
        let data = layout::reorder(input.desc(), output.desc(), &input.buffer().read())?;
        output.buffer().write()[..data.len()].copy_from_slice(&data);
        Ok(())
    }
}
