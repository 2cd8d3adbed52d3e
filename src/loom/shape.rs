use std::sync::Arc;

use casey::snake;
use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Logical dimensions of a tensor, outermost first.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

macro_rules! impl_shape_from {
    ($($t:ident),+) => {
        impl From<($($t),+,)> for Shape {
            #[inline]
            fn from(($(snake!($t)),+,): ($($t),+,)) -> Self {
                Self([$(snake!($t)),+].into())
            }
        }
    };
}

type D0 = usize;
type D1 = usize;
type D2 = usize;
type D3 = usize;
type D4 = usize;
type D5 = usize;

impl_shape_from!(D0);
impl_shape_from!(D0, D1);
impl_shape_from!(D0, D1, D2);
impl_shape_from!(D0, D1, D2, D3);
impl_shape_from!(D0, D1, D2, D3, D4);
impl_shape_from!(D0, D1, D2, D3, D4, D5);

impl Shape {
    /// A rank-0 shape.
    #[inline]
    pub fn scalar() -> Self {
        Self(Arc::new([]))
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of logical elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Iterates every logical index in row-major order.
    pub fn indices(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        (0..self.size()).map(move |mut flat| {
            let mut index = vec![0; self.rank()];
            for (slot, &dim) in index.iter_mut().zip(self.0.iter()).rev() {
                *slot = flat % dim;
                flat /= dim;
            }
            index
        })
    }
}
