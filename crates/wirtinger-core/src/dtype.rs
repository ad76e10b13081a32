//! Element types and dtype promotion
//!
//! Leaves carry a nominal [`DType`]. Real dtypes store `f64` values and
//! complex dtypes store [`Complex64`] values; the dtype decides how values
//! are rounded on construction and which complex counterpart a real leaf
//! is promoted to when a gradient becomes complex.

use crate::error::{Result, WirtingerError};
use scirs2_core::numeric::Complex64;
use std::fmt;

/// Element type of a tensor leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Complex64,
    Complex128,
}

impl DType {
    /// Whether this dtype is a complex floating type
    pub fn is_complex(self) -> bool {
        matches!(self, DType::Complex64 | DType::Complex128)
    }

    /// Whether this dtype is a real or complex floating type
    pub fn is_floating(self) -> bool {
        matches!(
            self,
            DType::Float32 | DType::Float64 | DType::Complex64 | DType::Complex128
        )
    }

    /// Complex counterpart of this dtype.
    ///
    /// Complex dtypes map to themselves, `Float32` to `Complex64` and
    /// `Float64` to `Complex128`. Integer and boolean dtypes have no
    /// counterpart.
    ///
    /// ```
    /// use wirtinger_core::DType;
    ///
    /// assert_eq!(DType::Float32.to_complex().unwrap(), DType::Complex64);
    /// assert_eq!(DType::Complex128.to_complex().unwrap(), DType::Complex128);
    /// assert!(DType::Int32.to_complex().is_err());
    /// ```
    pub fn to_complex(self) -> Result<DType> {
        match self {
            DType::Complex64 | DType::Complex128 => Ok(self),
            DType::Float32 => Ok(DType::Complex64),
            DType::Float64 => Ok(DType::Complex128),
            other => Err(WirtingerError::UnknownDtype(other)),
        }
    }

    /// Real counterpart of this dtype; real dtypes map to themselves
    pub fn to_real(self) -> DType {
        match self {
            DType::Complex64 => DType::Float32,
            DType::Complex128 => DType::Float64,
            other => other,
        }
    }

    /// Dtype of the result of a binary operation between `self` and `other`.
    ///
    /// Real dtypes form the lattice `Bool < Int32 < Int64 < Float32 <
    /// Float64`; if either side is complex the result is the complex
    /// counterpart of the promoted real parts.
    pub fn promote(self, other: DType) -> DType {
        let real = self.to_real().max(other.to_real());
        if self.is_complex() || other.is_complex() {
            match real {
                DType::Float32 => DType::Complex64,
                _ => DType::Complex128,
            }
        } else {
            real
        }
    }

    /// Dtype of gradients flowing into a leaf of this dtype.
    ///
    /// Floating dtypes keep their own type, integer and boolean leaves
    /// receive `Float64` gradients.
    pub fn gradient_dtype(self) -> DType {
        if self.is_floating() {
            self
        } else {
            DType::Float64
        }
    }

    /// Round a real value to this dtype's nominal precision
    pub fn round_real(self, x: f64) -> f64 {
        match self {
            DType::Bool => {
                if x != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Int32 | DType::Int64 => x.trunc(),
            DType::Float32 | DType::Complex64 => x as f32 as f64,
            DType::Float64 | DType::Complex128 => x,
        }
    }

    /// Round a complex value to this dtype's nominal precision
    pub fn round_complex(self, z: Complex64) -> Complex64 {
        Complex64::new(self.round_real(z.re), self.round_real(z.im))
    }

    /// Canonical lower-case name (`float64`, `complex128`, ...)
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Promote `main` to its complex counterpart if it or any of `others` is
/// complex; otherwise return `main` unchanged.
///
/// ```
/// use wirtinger_core::{maybe_promote_to_complex, DType};
///
/// let promoted = maybe_promote_to_complex(DType::Float64, &[DType::Complex64]).unwrap();
/// assert_eq!(promoted, DType::Complex128);
///
/// let kept = maybe_promote_to_complex(DType::Float32, &[DType::Float64]).unwrap();
/// assert_eq!(kept, DType::Float32);
/// ```
pub fn maybe_promote_to_complex(main: DType, others: &[DType]) -> Result<DType> {
    if main.is_complex() || others.iter().any(|t| t.is_complex()) {
        main.to_complex()
    } else {
        Ok(main)
    }
}
