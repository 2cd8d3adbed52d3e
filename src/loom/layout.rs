use std::str::FromStr;

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{num::DataType, shape::Shape};

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("descriptor {0} has no concrete layout")]
    Unresolved(TensorDesc),
    #[error("format {0} expects rank {1}, found shape {2}")]
    Rank(Format, usize, Shape),
    #[error("unknown memory format: {0}")]
    Format(String),
    #[error("buffer of {0} bytes is smaller than descriptor {1}")]
    Size(usize, TensorDesc),
    #[error("cannot reorder {0} into {1}")]
    Reorder(TensorDesc, TensorDesc),
}

/// Physical arrangement of a tensor: outer axis order followed by inner blocks.
///
/// `order[k]` is the logical axis stored at position `k`. An axis listed more than once is
/// blocked; its later occurrences are inner blocks of the given size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockingDesc {
    order: Vec<usize>,
    block_dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl BlockingDesc {
    /// Creates a dense blocking of `shape` stored in `order`, with `blocks` as `(axis, size)`
    /// inner blocks from outermost to innermost.
    pub fn new(shape: &Shape, order: &[usize], blocks: &[(usize, usize)]) -> Self {
        let outer = order.iter().map(|&axis| {
            let block: usize = blocks
                .iter()
                .filter(|&&(x, _)| x == axis)
                .map(|&(_, size)| size)
                .product();
            shape[axis].div_ceil(block.max(1))
        });
        let inner = blocks.iter().map(|&(_, size)| size);
        let block_dims = outer.chain(inner).collect_vec();
        let order = order
            .iter()
            .copied()
            .chain(blocks.iter().map(|&(axis, _)| axis))
            .collect_vec();

        let mut strides = vec![0; block_dims.len()];
        let mut stride = 1;
        for (slot, &dim) in strides.iter_mut().zip(block_dims.iter()).rev() {
            *slot = stride;
            stride *= dim;
        }

        Self {
            order,
            block_dims,
            strides,
            offset: 0,
        }
    }

    /// Row-major blocking of `shape`.
    #[inline]
    pub fn dense(shape: &Shape) -> Self {
        let order = (0..shape.rank()).collect_vec();
        Self::new(shape, &order, &[])
    }

    #[inline]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[inline]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    #[inline]
    pub fn block_dims(&self) -> &[usize] {
        &self.block_dims
    }

    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of elements spanned by the layout, padding and offset included.
    pub fn size(&self) -> usize {
        if self.block_dims.contains(&0) {
            return self.offset;
        }
        let span: usize = itertools::izip!(&self.block_dims, &self.strides)
            .map(|(&dim, &stride)| (dim - 1) * stride)
            .sum();
        self.offset + span + 1
    }

    /// Element offset of a logical index.
    pub fn offset_of(&self, index: &[usize]) -> usize {
        let mut rem = index.to_vec();
        let mut offset = self.offset;
        for k in (0..self.order.len()).rev() {
            let axis = self.order[k];
            let outer = !self.order[..k].contains(&axis);
            let component = match outer {
                true => rem[axis],
                false => {
                    let component = rem[axis] % self.block_dims[k];
                    rem[axis] /= self.block_dims[k];
                    component
                }
            };
            offset += component * self.strides[k];
        }
        offset
    }

    /// Outer order and inner blocks, ignoring strides and offsets.
    fn partial(&self) -> (Vec<usize>, Vec<(usize, usize)>) {
        let mut outer = vec![];
        let mut inner = vec![];
        for (&axis, &dim) in self.order.iter().zip(self.block_dims.iter()) {
            match outer.contains(&axis) {
                true => inner.push((axis, dim)),
                false => outer.push(axis),
            }
        }
        (outer, inner)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Layout {
    /// Any layout is acceptable. Must be resolved before allocation.
    #[default]
    Any,
    Blocked(BlockingDesc),
}

/// Shape, element type and physical layout of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TensorDesc {
    pub data_type: DataType,
    pub shape: Shape,
    pub layout: Layout,
}

impl std::fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}:", self.data_type, self.shape)?;
        match (&self.layout, self.format()) {
            (Layout::Any, _) => write!(f, "any"),
            (Layout::Blocked(_), Some(format)) => write!(f, "{format}"),
            (Layout::Blocked(blocking), None) => write!(
                f,
                "blocked<{}|{}>",
                blocking.order.iter().format(","),
                blocking.block_dims.iter().format(",")
            ),
        }
    }
}

impl TensorDesc {
    #[inline]
    pub fn any(data_type: DataType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let layout = Layout::Any;
        Self {
            data_type,
            shape,
            layout,
        }
    }

    /// Dense, row-major descriptor of the shape.
    #[inline]
    pub fn planar(data_type: DataType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let layout = Layout::Blocked(BlockingDesc::dense(&shape));
        Self {
            data_type,
            shape,
            layout,
        }
    }

    #[inline]
    pub fn with_format(
        data_type: DataType,
        shape: impl Into<Shape>,
        format: Format,
    ) -> Result<Self, LayoutError> {
        let shape = shape.into();
        let layout = Layout::Blocked(format.blocking(&shape)?);
        Ok(Self {
            data_type,
            shape,
            layout,
        })
    }

    #[inline]
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    #[inline]
    pub fn is_concrete(&self) -> bool {
        matches!(self.layout, Layout::Blocked(_))
    }

    #[inline]
    pub fn blocking(&self) -> Option<&BlockingDesc> {
        match &self.layout {
            Layout::Any => None,
            Layout::Blocked(blocking) => Some(blocking),
        }
    }

    /// Bytes required to hold the tensor. Fails on an unresolved layout.
    pub fn size_in_bytes(&self) -> Result<usize, LayoutError> {
        match &self.layout {
            Layout::Any => Err(LayoutError::Unresolved(self.clone())),
            Layout::Blocked(blocking) => Ok(blocking.size() * self.data_type.size()),
        }
    }

    /// Same logical type and shape, and the same block structure. Offsets are ignored.
    pub fn is_compatible(&self, other: &TensorDesc) -> bool {
        if self.data_type != other.data_type || self.shape != other.shape {
            return false;
        }
        match (&self.layout, &other.layout) {
            (Layout::Any, Layout::Any) => true,
            (Layout::Blocked(x), Layout::Blocked(y)) => {
                x.order == y.order && x.block_dims == y.block_dims && x.strides == y.strides
            }
            _ => false,
        }
    }

    /// Whether the layout has the outer order and inner blocks of `format`.
    pub fn matches_format(&self, format: Format) -> bool {
        let Some(blocking) = self.blocking() else {
            return false;
        };
        match format.blocking(&self.shape) {
            Ok(expected) => expected.partial() == blocking.partial(),
            Err(_) => false,
        }
    }

    /// Names the layout if it is one of the known formats.
    pub fn format(&self) -> Option<Format> {
        let blocking = self.blocking()?;
        Format::available(self.shape.rank())
            .iter()
            .chain(Format::ALL.iter())
            .copied()
            .find(|&format| {
                format
                    .blocking(&self.shape)
                    .is_ok_and(|x| x.partial() == blocking.partial())
            })
    }
}

/// Named memory formats. Letters follow the usual `n`/`c`/`d`/`h`/`w` convention; an
/// upper-case letter is blocked by the trailing number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Format {
    #[display("x")]
    X,
    #[display("nc")]
    Nc,
    #[display("tnc")]
    Tnc,
    #[display("ntc")]
    Ntc,
    #[display("nchw")]
    Nchw,
    #[display("nhwc")]
    Nhwc,
    #[display("nChw8c")]
    NChw8c,
    #[display("nChw16c")]
    NChw16c,
    #[display("ncdhw")]
    Ncdhw,
    #[display("ndhwc")]
    Ndhwc,
    #[display("nCdhw8c")]
    NCdhw8c,
    #[display("nCdhw16c")]
    NCdhw16c,
}

impl FromStr for Format {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|format| format.to_string() == s)
            .ok_or_else(|| LayoutError::Format(s.to_string()))
    }
}

impl Format {
    pub const ALL: [Format; 12] = [
        Format::X,
        Format::Nc,
        Format::Tnc,
        Format::Ntc,
        Format::Nchw,
        Format::Nhwc,
        Format::NChw8c,
        Format::NChw16c,
        Format::Ncdhw,
        Format::Ndhwc,
        Format::NCdhw8c,
        Format::NCdhw16c,
    ];

    pub const fn rank(self) -> usize {
        match self {
            Format::X => 1,
            Format::Nc => 2,
            Format::Tnc | Format::Ntc => 3,
            Format::Nchw | Format::Nhwc | Format::NChw8c | Format::NChw16c => 4,
            Format::Ncdhw | Format::Ndhwc | Format::NCdhw8c | Format::NCdhw16c => 5,
        }
    }

    /// Formats a backend may offer for tensors of the given rank, preferred first.
    pub const fn available(rank: usize) -> &'static [Format] {
        match rank {
            0 | 1 => &[Format::X],
            2 => &[Format::Nc],
            3 => &[Format::Tnc, Format::Ntc],
            4 => &[Format::Nchw, Format::NChw8c, Format::NChw16c],
            5 => &[Format::Ncdhw, Format::NCdhw8c, Format::NCdhw16c],
            _ => &[],
        }
    }

    /// Channel block size, if the format is blocked.
    pub const fn block(self) -> Option<usize> {
        match self {
            Format::NChw8c | Format::NCdhw8c => Some(8),
            Format::NChw16c | Format::NCdhw16c => Some(16),
            _ => None,
        }
    }

    fn order(self) -> &'static [usize] {
        match self {
            Format::X => &[0],
            Format::Nc => &[0, 1],
            Format::Tnc => &[0, 1, 2],
            Format::Ntc => &[1, 0, 2],
            Format::Nchw | Format::NChw8c | Format::NChw16c => &[0, 1, 2, 3],
            Format::Nhwc => &[0, 2, 3, 1],
            Format::Ncdhw | Format::NCdhw8c | Format::NCdhw16c => &[0, 1, 2, 3, 4],
            Format::Ndhwc => &[0, 2, 3, 4, 1],
        }
    }

    /// Concrete blocking of this format for `shape`.
    pub fn blocking(self, shape: &Shape) -> Result<BlockingDesc, LayoutError> {
        match (self, shape.rank()) {
            (Format::X, 0) => return Ok(BlockingDesc::dense(shape)),
            (format, rank) if format.rank() != rank => {
                return Err(LayoutError::Rank(format, format.rank(), shape.clone()));
            }
            _ => {}
        }
        let blocks = match self.block() {
            Some(block) => vec![(1, block)],
            None => vec![],
        };
        Ok(BlockingDesc::new(shape, self.order(), &blocks))
    }
}

/// Copies every logical element of `bytes` laid out as `src` into a new buffer laid out as `dst`.
/// Padding of `dst` is zero-filled.
pub fn reorder(src: &TensorDesc, dst: &TensorDesc, bytes: &[u8]) -> Result<Box<[u8]>, LayoutError> {
    if src.data_type != dst.data_type || src.shape != dst.shape {
        return Err(LayoutError::Reorder(src.clone(), dst.clone()));
    }
    let (Some(x), Some(y)) = (src.blocking(), dst.blocking()) else {
        let desc = if src.is_concrete() { dst } else { src };
        return Err(LayoutError::Unresolved(desc.clone()));
    };
    if bytes.len() < src.size_in_bytes()? {
        return Err(LayoutError::Size(bytes.len(), src.clone()));
    }

    let size = src.data_type.size();
    let mut output = vec![0u8; dst.size_in_bytes()?];
    for index in src.shape.indices() {
        let from = x.offset_of(&index) * size;
        let to = y.offset_of(&index) * size;
        output[to..to + size].copy_from_slice(&bytes[from..from + size]);
    }
    Ok(output.into_boxed_slice())
}
