//! Static tables mapping model operation names to kinds, and kinds to constructors.

use std::sync::LazyLock;

use rustc_hash::FxHashMap as HashMap;

use super::ops::{
    Concat, ConvAttrs, Convolution, Eltwise, EltwiseFunc, FullyConnected, Input, NodeOp, OpBase,
    OpKind, Output, PoolMethod, Pooling, Reorder, Reshape, SoftMax,
};
use crate::loom::{error::GraphError, loader::NodeSpec};

static OP_NAMES: LazyLock<HashMap<&'static str, OpKind>> = LazyLock::new(|| {
    use OpKind::*;
    [
        ("unknown", Unknown),
        ("input", Input),
        ("const", Input),
        ("output", Output),
        ("reorder", Reorder),
        ("convolution", Convolution),
        ("deconvolution", Deconvolution),
        ("relu", Eltwise),
        ("relu6", Eltwise),
        ("gelu", Eltwise),
        ("elu", Eltwise),
        ("sigmoid", Eltwise),
        ("logistic", Eltwise),
        ("tanh", Eltwise),
        ("exp", Eltwise),
        ("abs", Eltwise),
        ("not", Eltwise),
        ("clamp", Eltwise),
        ("swish", Eltwise),
        ("hswish", Eltwise),
        ("mish", Eltwise),
        ("hsigmoid", Eltwise),
        ("round", Eltwise),
        ("erf", Eltwise),
        ("scaleshift", Eltwise),
        ("prelu", Eltwise),
        ("power", Eltwise),
        ("mod", Eltwise),
        ("eltwise", Eltwise),
        ("activation", Eltwise),
        ("norm", Lrn),
        ("lrn", Lrn),
        ("pooling", Pooling),
        ("innerproduct", FullyConnected),
        ("fullyconnected", FullyConnected),
        ("gemm", Gemm),
        ("softmax", SoftMax),
        ("split", Split),
        ("slice", Split),
        ("concat", Concatenation),
        ("reshape", Reshape),
        ("squeeze", Reshape),
        ("unsqueeze", Reshape),
        ("flatten", Flatten),
        ("tile", Tile),
        ("pad", Pad),
        ("permute", Permute),
        ("batchnormalization", BatchNormalization),
        ("convert", Convert),
        ("interpolate", Interpolate),
        ("reducemean", Reduce),
        ("reducesum", Reduce),
        ("reducemax", Reduce),
    ]
    .into_iter()
    .collect()
});

/// Looks up the kind of a model operation name, ignoring case.
pub fn op_kind(name: &str) -> OpKind {
    let name = name.to_ascii_lowercase();
    OP_NAMES.get(name.as_str()).copied().unwrap_or(OpKind::Unknown)
}

type Constructor = fn(OpBase, &NodeSpec) -> Result<Box<dyn NodeOp>, String>;

static REGISTRY: LazyLock<HashMap<OpKind, Constructor>> = LazyLock::new(|| {
    let mut registry: HashMap<OpKind, Constructor> = HashMap::default();
    registry.insert(OpKind::Input, |base, spec| {
        let constant = spec.op_type.eq_ignore_ascii_case("const")
            || spec.param_as::<bool>("constant")?.unwrap_or(false);
        Ok(Box::new(Input { base, constant }))
    });
    registry.insert(OpKind::Output, |base, _| Ok(Box::new(Output(base))));
    registry.insert(OpKind::Reshape, |base, _| Ok(Box::new(Reshape(base))));
    registry.insert(OpKind::Flatten, |base, _| Ok(Box::new(Reshape(base))));
    registry.insert(OpKind::Reorder, |base, _| Ok(Box::new(Reorder(base))));
    registry.insert(OpKind::Convolution, |base, spec| {
        let default = ConvAttrs::default();
        let attrs = ConvAttrs {
            strides: spec.param_list("strides")?.unwrap_or(default.strides),
            pads_begin: spec.param_list("pads_begin")?.unwrap_or(default.pads_begin),
            pads_end: spec.param_list("pads_end")?.unwrap_or(default.pads_end),
            dilations: spec.param_list("dilations")?.unwrap_or(default.dilations),
            group: spec.param_as("group")?.unwrap_or(default.group),
        };
        Ok(Box::new(Convolution { base, attrs }))
    });
    registry.insert(OpKind::Pooling, |base, spec| {
        let method = match spec.params.get("pool-method").map(|x| x.to_ascii_lowercase()) {
            None => PoolMethod::Max,
            Some(x) if x == "max" => PoolMethod::Max,
            Some(x) if x == "avg" => PoolMethod::Avg,
            Some(x) => return Err(format!("unknown pooling method `{x}`")),
        };
        let kernel = spec.param_list("kernel")?.unwrap_or_default();
        let strides = spec.param_list("strides")?.unwrap_or_else(|| kernel.clone());
        Ok(Box::new(Pooling {
            base,
            method,
            kernel,
            strides,
        }))
    });
    registry.insert(OpKind::Eltwise, |base, spec| {
        let param = spec
            .params
            .get("operation")
            .or(spec.params.get("type"))
            .map(String::as_str);
        let func = EltwiseFunc::from_name(&spec.op_type, param)
            .ok_or_else(|| format!("unknown eltwise function `{}`", spec.op_type))?;
        if spec.inputs.len() != func.arity() {
            let arity = func.arity();
            let found = spec.inputs.len();
            return Err(format!("{func} takes {arity} inputs, found {found}"));
        }
        Ok(Box::new(Eltwise { base, func }))
    });
    registry.insert(OpKind::SoftMax, |base, spec| {
        let rank = spec.inputs.first().map(|x| x.shape.rank()).unwrap_or(1);
        let axis = spec.param_as("axis")?.unwrap_or(rank.max(1) - 1);
        if axis >= rank.max(1) {
            return Err(format!("softmax axis {axis} out of rank {rank}"));
        }
        Ok(Box::new(SoftMax { base, axis }))
    });
    registry.insert(OpKind::FullyConnected, |base, _| {
        Ok(Box::new(FullyConnected(base)))
    });
    registry.insert(OpKind::Concatenation, |base, spec| {
        let axis = spec.param_as("axis")?.unwrap_or(1);
        Ok(Box::new(Concat { base, axis }))
    });
    registry
});

/// Builds the operation of a node from its model description.
///
/// Unknown names, and kinds nothing is registered for, are unsupported. Malformed parameters are
/// configuration errors.
pub fn create(spec: &NodeSpec) -> Result<Box<dyn NodeOp>, GraphError> {
    let kind = op_kind(&spec.op_type);
    let Some(constructor) = REGISTRY.get(&kind) else {
        return Err(GraphError::Unsupported {
            node: spec.name.clone(),
            kind,
            reason: format!("no operation registered for type `{}`", spec.op_type),
        });
    };
    let base = OpBase::new(kind).with_weights(spec.weights.clone());
    constructor(base, spec).map_err(|reason| GraphError::Config {
        node: spec.name.clone(),
        kind,
        reason,
    })
}
