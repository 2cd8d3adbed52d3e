use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Strategy {
    #[display("jit")]
    Jit,
    #[display("gemm")]
    Gemm,
    #[display("jit_gemm")]
    JitGemm,
    #[display("ref")]
    Ref,
    #[display("reorder")]
    Reorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Isa {
    #[display("")]
    None,
    #[display("uni")]
    Uni,
    #[display("avx512")]
    Avx512,
    #[display("avx2")]
    Avx2,
    #[display("avx")]
    Avx,
    #[display("sse42")]
    Sse42,
    #[display("blas")]
    Blas,
    #[display("any")]
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Variant {
    #[display("")]
    Plain,
    #[display("dw")]
    Dw,
    #[display("1x1")]
    OneByOne,
    #[display("winograd")]
    Winograd,
}

/// Category of kernel execution strategy reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ImplType {
    /// No implementation has been chosen.
    Undef,
    /// The backend reported a name no keyword matched.
    Unknown,
    Known {
        strategy: Strategy,
        isa: Isa,
        variant: Variant,
    },
}

impl std::fmt::Display for ImplType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImplType::Undef => write!(f, "undef"),
            ImplType::Unknown => write!(f, "unknown"),
            ImplType::Known {
                strategy,
                isa,
                variant,
            } => {
                write!(f, "{strategy}")?;
                if !matches!(isa, Isa::None) {
                    write!(f, "_{isa}")?;
                }
                if !matches!(variant, Variant::Plain) {
                    write!(f, "_{variant}")?;
                }
                Ok(())
            }
        }
    }
}

impl ImplType {
    #[inline]
    pub const fn new(strategy: Strategy, isa: Isa, variant: Variant) -> Self {
        Self::Known {
            strategy,
            isa,
            variant,
        }
    }

    #[inline]
    const fn plain(strategy: Strategy, isa: Isa) -> Self {
        Self::new(strategy, isa, Variant::Plain)
    }

    /// Parses an implementation name by keyword matching.
    ///
    /// Names with no strategy keyword (`jit`, `gemm`, `ref`, `reorder`) map to [`ImplType::Unknown`].
    pub fn parse(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        let contains = |keyword: &str| name.contains(keyword);

        let strategy = if contains("reorder") {
            Strategy::Reorder
        } else if contains("jit") && contains("gemm") {
            Strategy::JitGemm
        } else if contains("jit") {
            Strategy::Jit
        } else if contains("gemm") {
            Strategy::Gemm
        } else if contains("ref") {
            Strategy::Ref
        } else {
            return Self::Unknown;
        };

        let isa = if contains("avx512") {
            Isa::Avx512
        } else if contains("avx2") {
            Isa::Avx2
        } else if contains("avx") {
            Isa::Avx
        } else if contains("sse42") || contains("sse41") {
            Isa::Sse42
        } else if contains("blas") {
            Isa::Blas
        } else if contains("uni") {
            Isa::Uni
        } else if contains("any") {
            Isa::Any
        } else {
            Isa::None
        };

        let variant = if contains("_dw") || contains(":dw") {
            Variant::Dw
        } else if contains("1x1") {
            Variant::OneByOne
        } else if contains("winograd") {
            Variant::Winograd
        } else {
            Variant::Plain
        };

        Self::new(strategy, isa, variant)
    }
}

/// Global preference order: vectorized-wide, vectorized-narrow, generic library, reference.
pub static DEFAULT_PRIORITIES: [ImplType; 25] = {
    use Isa::*;
    use Strategy::*;
    use Variant::*;
    [
        ImplType::Unknown,
        ImplType::new(Jit, Uni, Dw),
        ImplType::new(Jit, Uni, OneByOne),
        ImplType::plain(Jit, Uni),
        ImplType::new(Jit, Avx512, Dw),
        ImplType::new(Jit, Avx512, OneByOne),
        ImplType::plain(Jit, Avx512),
        ImplType::new(Jit, Avx2, Dw),
        ImplType::new(Jit, Avx2, OneByOne),
        ImplType::plain(Jit, Avx2),
        ImplType::new(Jit, Avx, Dw),
        ImplType::new(Jit, Avx, OneByOne),
        ImplType::plain(Jit, Avx),
        ImplType::new(Jit, Sse42, Dw),
        ImplType::new(Jit, Sse42, OneByOne),
        ImplType::plain(Jit, Sse42),
        ImplType::plain(Gemm, Any),
        ImplType::plain(Gemm, Blas),
        ImplType::plain(Gemm, Avx512),
        ImplType::plain(Gemm, Avx2),
        ImplType::plain(Gemm, Avx),
        ImplType::plain(Gemm, Sse42),
        ImplType::plain(JitGemm, None),
        ImplType::plain(Ref, Any),
        ImplType::plain(Ref, None),
    ]
};

/// Appends every default kind missing from `preferred`, keeping `preferred` first.
pub fn merge_priorities(preferred: &[ImplType], defaults: &[ImplType]) -> Vec<ImplType> {
    let mut priorities = preferred.to_vec();
    for &impl_type in defaults {
        if !priorities.contains(&impl_type) {
            priorities.push(impl_type);
        }
    }
    priorities
}
