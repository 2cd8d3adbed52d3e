use std::str::FromStr;

use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    impl_type::ImplType,
    layout::{Format, LayoutError, TensorDesc},
    num::DataType,
    shape::Shape,
};
use crate::hal::ops::WeightBlob;

/// Element type and dimensions of a declared port. Layouts are never declared.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PortSpec {
    pub data_type: DataType,
    pub shape: Shape,
}

impl From<&PortSpec> for TensorDesc {
    fn from(value: &PortSpec) -> Self {
        TensorDesc::any(value.data_type, value.shape.clone())
    }
}

/// A node as handed over by the model loader.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeSpec {
    pub name: String,
    /// Operation name as written in the model, e.g. `Convolution` or `ReLU`.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub op_type: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub inputs: Vec<PortSpec>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub outputs: Vec<PortSpec>,
    /// Comma separated, backend prefixed format tokens, one per input port.
    #[cfg_attr(feature = "serde", serde(default))]
    pub input_formats: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub output_formats: Option<String>,
    /// Comma separated, backend prefixed implementation kinds, most preferred first.
    #[cfg_attr(feature = "serde", serde(default))]
    pub priorities: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub params: HashMap<String, String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub weights: Vec<WeightBlob>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            ..Default::default()
        }
    }

    pub fn input(mut self, data_type: DataType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        self.inputs.push(PortSpec { data_type, shape });
        self
    }

    pub fn output(mut self, data_type: DataType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        self.outputs.push(PortSpec { data_type, shape });
        self
    }

    pub fn input_formats(mut self, formats: impl Into<String>) -> Self {
        self.input_formats = Some(formats.into());
        self
    }

    pub fn output_formats(mut self, formats: impl Into<String>) -> Self {
        self.output_formats = Some(formats.into());
        self
    }

    pub fn priorities(mut self, priorities: impl Into<String>) -> Self {
        self.priorities = Some(priorities.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn weight(mut self, blob: WeightBlob) -> Self {
        self.weights.push(blob);
        self
    }

    /// Parses a single-valued parameter.
    pub fn param_as<T: FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        match self.params.get(key) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| format!("malformed parameter `{key}`: {value}")),
        }
    }

    /// Parses a comma separated list parameter such as `strides="2,2"`.
    pub fn param_list(&self, key: &str) -> Result<Option<Vec<usize>>, String> {
        match self.params.get(key) {
            None => Ok(None),
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(|x| x.parse())
                .collect::<Result<Vec<_>, _>>()
                .map(Some)
                .map_err(|_| format!("malformed parameter `{key}`: {value}")),
        }
    }
}

/// Tokens of a comma separated list that carry `prefix`, with the prefix stripped.
fn prefixed<'a>(list: &'a str, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    list.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(move |token| match token.strip_prefix(prefix) {
            Some(token) => Some(token),
            None => {
                log::debug!("ignore token `{token}` without prefix `{prefix}`");
                None
            }
        })
}

/// Parses format hints. Tokens for other backends are ignored.
pub fn parse_formats(list: &str, prefix: &str) -> Result<Vec<Format>, LayoutError> {
    prefixed(list, prefix).map(Format::from_str).collect()
}

/// Parses an implementation priority override. Tokens for other backends are ignored; tokens
/// naming no known implementation kind are rejected with the `strict` feature and skipped
/// otherwise.
pub fn parse_priorities(list: &str, prefix: &str) -> Result<Vec<ImplType>, String> {
    let mut priorities = vec![];
    for token in prefixed(list, prefix) {
        match ImplType::parse(token) {
            ImplType::Unknown if !token.eq_ignore_ascii_case("unknown") => {
                #[cfg(feature = "strict")]
                return Err(format!("unknown implementation kind `{token}`"));
                #[cfg(not(feature = "strict"))]
                log::warn!("skip unknown implementation kind `{token}`");
            }
            impl_type => priorities.push(impl_type),
        }
    }
    Ok(priorities)
}

/// Serializes shared byte slices through `serde_bytes`.
#[cfg(feature = "serde")]
pub(crate) mod arc_bytes {
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Arc<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::serialize(data.as_ref(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<[u8]>, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Ok(bytes.into_vec().into())
    }
}
