//! Dense tensor leaves
//!
//! A [`Tensor`] is the leaf type of every pytree that carries numbers:
//! primals, outputs, cotangents and gradients. It pairs an n-dimensional
//! array with a nominal [`DType`]. Real dtypes are backed by `ArrayD<f64>`,
//! complex dtypes by `ArrayD<Complex64>`; [`TensorData`] keeps the two
//! apart so code can branch on reality without inspecting values.
//!
//! # Examples
//!
//! ```
//! use wirtinger_core::{DType, Tensor};
//!
//! let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
//! assert_eq!(x.shape(), &[2, 2]);
//! assert_eq!(x.dtype(), DType::Float64);
//! assert!(!x.is_complex());
//!
//! let z = x.astype(DType::Complex128);
//! assert!(z.is_complex());
//! assert!(z.conj().allclose(&z, 0.0, 0.0));
//! ```

use crate::dtype::DType;
use crate::error::{Result, WirtingerError};
use crate::random::PrngKey;
use scirs2_core::ndarray_ext::{ArrayD, IxDyn, Zip};
use scirs2_core::numeric::Complex64;
use scirs2_core::random::{rngs::StdRng, Rng, SeedableRng};
use std::fmt;

/// Storage of a tensor: real or complex values
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// Real values (bool, integer and real floating dtypes)
    Real(ArrayD<f64>),
    /// Complex values (complex floating dtypes)
    Complex(ArrayD<Complex64>),
}

impl TensorData {
    fn shape(&self) -> &[usize] {
        match self {
            TensorData::Real(a) => a.shape(),
            TensorData::Complex(a) => a.shape(),
        }
    }
}

/// Shape and element type of a leaf, without its values
///
/// This is what abstract evaluation produces: enough to decide how a
/// function must be differentiated, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ShapeDtype {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl ShapeDtype {
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Number of scalars described
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_complex(&self) -> bool {
        self.dtype.is_complex()
    }
}

impl fmt::Display for ShapeDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

/// N-dimensional array leaf with a nominal dtype
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    data: TensorData,
}

impl Tensor {
    /// Create a tensor from storage and a dtype.
    ///
    /// The dtype's reality must agree with the storage variant. Values are
    /// rounded to the dtype's nominal precision.
    pub fn new(data: TensorData, dtype: DType) -> Result<Self> {
        let data = match data {
            TensorData::Real(a) if !dtype.is_complex() => {
                TensorData::Real(a.mapv(|x| dtype.round_real(x)))
            }
            TensorData::Complex(a) if dtype.is_complex() => {
                TensorData::Complex(a.mapv(|z| dtype.round_complex(z)))
            }
            _ => {
                return Err(WirtingerError::DtypeMismatch(format!(
                    "storage reality does not match dtype {}",
                    dtype
                )))
            }
        };
        Ok(Self { dtype, data })
    }

    /// `Float64` tensor from a real array
    pub fn from_real(array: ArrayD<f64>) -> Self {
        Self {
            dtype: DType::Float64,
            data: TensorData::Real(array),
        }
    }

    /// `Complex128` tensor from a complex array
    pub fn from_complex(array: ArrayD<Complex64>) -> Self {
        Self {
            dtype: DType::Complex128,
            data: TensorData::Complex(array),
        }
    }

    /// Rank-0 `Float64` tensor
    pub fn scalar(value: f64) -> Self {
        Self::from_real(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Rank-0 `Complex128` tensor
    pub fn complex_scalar(value: Complex64) -> Self {
        Self::from_complex(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// `Float64` tensor from row-major values
    pub fn from_vec(values: Vec<f64>, shape: &[usize]) -> Result<Self> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| {
            WirtingerError::InvalidArgument(format!("cannot build tensor of shape {:?}: {}", shape, e))
        })?;
        Ok(Self::from_real(array))
    }

    /// `Complex128` tensor from row-major values
    pub fn from_complex_vec(values: Vec<Complex64>, shape: &[usize]) -> Result<Self> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| {
            WirtingerError::InvalidArgument(format!("cannot build tensor of shape {:?}: {}", shape, e))
        })?;
        Ok(Self::from_complex(array))
    }

    /// Tensor filled with zeros
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, dtype, 0.0)
    }

    /// Tensor filled with ones (`1 + 0i` for complex dtypes)
    pub fn ones(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, dtype, 1.0)
    }

    fn full(shape: &[usize], dtype: DType, value: f64) -> Self {
        let data = if dtype.is_complex() {
            TensorData::Complex(ArrayD::from_elem(IxDyn(shape), Complex64::new(value, 0.0)))
        } else {
            TensorData::Real(ArrayD::from_elem(IxDyn(shape), dtype.round_real(value)))
        };
        Self { dtype, data }
    }

    /// Uniformly distributed values in `[low, high)`, reproducible from `key`.
    ///
    /// Complex dtypes draw real and imaginary parts independently.
    pub fn random_uniform(shape: &[usize], dtype: DType, key: PrngKey, low: f64, high: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(key.seed());
        let data = if dtype.is_complex() {
            TensorData::Complex(ArrayD::from_shape_fn(IxDyn(shape), |_| {
                let re = rng.random_range(low..high);
                let im = rng.random_range(low..high);
                dtype.round_complex(Complex64::new(re, im))
            }))
        } else {
            TensorData::Real(ArrayD::from_shape_fn(IxDyn(shape), |_| {
                dtype.round_real(rng.random_range(low..high))
            }))
        };
        Self { dtype, data }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of scalars in the tensor
    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn is_complex(&self) -> bool {
        self.dtype.is_complex()
    }

    pub fn shape_dtype(&self) -> ShapeDtype {
        ShapeDtype::new(self.shape(), self.dtype)
    }

    /// Real storage, if the tensor is real
    pub fn as_real(&self) -> Option<&ArrayD<f64>> {
        match &self.data {
            TensorData::Real(a) => Some(a),
            TensorData::Complex(_) => None,
        }
    }

    /// Complex storage, if the tensor is complex
    pub fn as_complex(&self) -> Option<&ArrayD<Complex64>> {
        match &self.data {
            TensorData::Complex(a) => Some(a),
            TensorData::Real(_) => None,
        }
    }

    /// Values widened to complex, whatever the dtype
    pub fn to_complex_array(&self) -> ArrayD<Complex64> {
        match &self.data {
            TensorData::Real(a) => a.mapv(|x| Complex64::new(x, 0.0)),
            TensorData::Complex(a) => a.clone(),
        }
    }

    /// Convert to another dtype.
    ///
    /// Converting a complex tensor to a real dtype discards the imaginary
    /// part.
    pub fn astype(&self, dtype: DType) -> Tensor {
        let data = match (&self.data, dtype.is_complex()) {
            (TensorData::Real(a), false) => TensorData::Real(a.mapv(|x| dtype.round_real(x))),
            (TensorData::Real(a), true) => {
                TensorData::Complex(a.mapv(|x| dtype.round_complex(Complex64::new(x, 0.0))))
            }
            (TensorData::Complex(a), true) => TensorData::Complex(a.mapv(|z| dtype.round_complex(z))),
            (TensorData::Complex(a), false) => {
                log::warn!(
                    "casting {} tensor to {} discards the imaginary part",
                    self.dtype,
                    dtype
                );
                TensorData::Real(a.mapv(|z| dtype.round_real(z.re)))
            }
        };
        Tensor { dtype, data }
    }

    /// Real part, with the real counterpart dtype
    pub fn real_part(&self) -> Tensor {
        match &self.data {
            TensorData::Real(_) => self.clone(),
            TensorData::Complex(a) => Tensor {
                dtype: self.dtype.to_real(),
                data: TensorData::Real(a.mapv(|z| z.re)),
            },
        }
    }

    /// Imaginary part, with the real counterpart dtype (zeros for real tensors)
    pub fn imag_part(&self) -> Tensor {
        match &self.data {
            TensorData::Real(a) => Tensor {
                dtype: self.dtype,
                data: TensorData::Real(ArrayD::zeros(a.raw_dim())),
            },
            TensorData::Complex(a) => Tensor {
                dtype: self.dtype.to_real(),
                data: TensorData::Real(a.mapv(|z| z.im)),
            },
        }
    }

    /// Complex conjugate; real tensors are returned unchanged
    pub fn conj(&self) -> Tensor {
        match &self.data {
            TensorData::Real(_) => self.clone(),
            TensorData::Complex(a) => Tensor {
                dtype: self.dtype,
                data: TensorData::Complex(a.mapv(|z| z.conj())),
            },
        }
    }

    pub fn neg(&self) -> Tensor {
        self.scale(-1.0)
    }

    /// Multiply every element by a real factor
    pub fn scale(&self, factor: f64) -> Tensor {
        let data = match &self.data {
            TensorData::Real(a) => TensorData::Real(a.mapv(|x| x * factor)),
            TensorData::Complex(a) => TensorData::Complex(a.mapv(|z| z * factor)),
        };
        Tensor {
            dtype: self.dtype,
            data,
        }
    }

    /// Element-wise sum of two tensors of equal shape, with dtype promotion
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    /// Element-wise difference of two tensors of equal shape, with dtype promotion
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, "sub", |a, b| a - b)
    }

    fn zip_with<F>(&self, other: &Tensor, op: &str, f: F) -> Result<Tensor>
    where
        F: Fn(Complex64, Complex64) -> Complex64,
    {
        if self.shape() != other.shape() {
            return Err(WirtingerError::StructureMismatch(format!(
                "cannot {} tensors of shape {:?} and {:?}",
                op,
                self.shape(),
                other.shape()
            )));
        }
        let dtype = self.dtype.promote(other.dtype);
        let lhs = self.to_complex_array();
        let rhs = other.to_complex_array();
        let mut out = ArrayD::zeros(lhs.raw_dim());
        Zip::from(&mut out)
            .and(&lhs)
            .and(&rhs)
            .for_each(|o, &a, &b| *o = f(a, b));

        let data = if dtype.is_complex() {
            TensorData::Complex(out.mapv(|z| dtype.round_complex(z)))
        } else {
            TensorData::Real(out.mapv(|z| dtype.round_real(z.re)))
        };
        Ok(Tensor { dtype, data })
    }

    /// Assemble `re + i·sign·im` from two real tensors of equal shape.
    ///
    /// The result dtype is the complex counterpart of the promoted input
    /// dtypes; integer inputs fail with [`WirtingerError::UnknownDtype`].
    pub fn from_parts(re: &Tensor, im: &Tensor, sign: f64) -> Result<Tensor> {
        let (re_arr, im_arr) = match (re.as_real(), im.as_real()) {
            (Some(r), Some(i)) => (r, i),
            _ => {
                return Err(WirtingerError::DtypeMismatch(format!(
                    "from_parts expects real tensors, got {} and {}",
                    re.dtype, im.dtype
                )))
            }
        };
        if re_arr.shape() != im_arr.shape() {
            return Err(WirtingerError::StructureMismatch(format!(
                "real part has shape {:?} but imaginary part has shape {:?}",
                re_arr.shape(),
                im_arr.shape()
            )));
        }
        let dtype = re.dtype.promote(im.dtype).to_complex()?;
        let mut out = ArrayD::zeros(re_arr.raw_dim());
        Zip::from(&mut out)
            .and(re_arr)
            .and(im_arr)
            .for_each(|o, &r, &i| *o = dtype.round_complex(Complex64::new(r, sign * i)));
        Ok(Tensor {
            dtype,
            data: TensorData::Complex(out),
        })
    }

    /// Largest element-wise `|self - other|`, or `None` if shapes differ
    pub fn max_abs_diff(&self, other: &Tensor) -> Option<f64> {
        if self.shape() != other.shape() {
            return None;
        }
        let lhs = self.to_complex_array();
        let rhs = other.to_complex_array();
        Some(
            lhs.iter()
                .zip(rhs.iter())
                .map(|(a, b)| (a - b).norm())
                .fold(0.0, f64::max),
        )
    }

    /// Element-wise `|self - other| <= atol + rtol·|other|`, compared as
    /// complex numbers; shapes must agree
    pub fn allclose(&self, other: &Tensor, rtol: f64, atol: f64) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        let lhs = self.to_complex_array();
        let rhs = other.to_complex_array();
        lhs.iter()
            .zip(rhs.iter())
            .all(|(a, b)| (a - b).norm() <= atol + rtol * b.norm())
    }
}

impl From<ArrayD<f64>> for Tensor {
    fn from(array: ArrayD<f64>) -> Self {
        Tensor::from_real(array)
    }
}

impl From<ArrayD<Complex64>> for Tensor {
    fn from(array: ArrayD<Complex64>) -> Self {
        Tensor::from_complex(array)
    }
}
