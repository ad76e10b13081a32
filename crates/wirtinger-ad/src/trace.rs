//! Complex-aware tracing over the real tape
//!
//! The tape only understands `f64`. A [`Traced`] value is either one real
//! node or a pair of nodes holding the real and imaginary parts, and the
//! [`Tracer`] expresses every complex operation through real ones. Because
//! the tape differentiates the pair independently, the engine is
//! real-linear: it never assumes a function is holomorphic.
//!
//! Functions to differentiate implement [`TracedFn`]. Closures taking a
//! tracer and the traced primals implement it directly:
//!
//! ```
//! use wirtinger_ad::trace::{arg, traced_fn, Traced};
//!
//! // f(x) = x + i·x
//! let f = traced_fn(|t, p| {
//!     let x = arg(p, 0)?;
//!     let ix = t.complex(&t.zeros_like(x)?, x)?;
//!     t.add(x, &ix)
//! });
//! # let _ = f;
//! ```

use crate::tape::{Tape, TapeMode, Var};
use scirs2_core::ndarray_ext::{ArrayD, Zip};
use scirs2_core::numeric::Complex64;
use wirtinger_core::{DType, Result, ShapeDtype, Tensor, TensorData, Tree, WirtingerError};

/// A value recorded on the tape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traced {
    /// One real node
    Real { var: Var, dtype: DType },
    /// Real and imaginary parts as two real nodes
    Complex { re: Var, im: Var, dtype: DType },
}

impl Traced {
    pub fn dtype(&self) -> DType {
        match self {
            Traced::Real { dtype, .. } | Traced::Complex { dtype, .. } => *dtype,
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Traced::Complex { .. })
    }
}

impl From<Traced> for Tree<Traced> {
    fn from(x: Traced) -> Self {
        Tree::Leaf(x)
    }
}

/// Transcendental results of integer or boolean operands are `Float64`
fn floating(dtype: DType) -> DType {
    if dtype.is_floating() {
        dtype
    } else {
        DType::Float64
    }
}

/// Leaf argument `index` of a traced call
pub fn arg(primals: &[Tree<Traced>], index: usize) -> Result<&Traced> {
    primals
        .get(index)
        .and_then(Tree::as_leaf)
        .ok_or_else(|| {
            WirtingerError::InvalidArgument(format!(
                "expected a leaf at argument {} of {}",
                index,
                primals.len()
            ))
        })
}

/// What a traced function returns: its value and an optional aux payload
#[derive(Debug, Clone, PartialEq)]
pub struct FnOutput {
    pub value: Tree<Traced>,
    pub aux: Option<Tree<Traced>>,
}

impl FnOutput {
    pub fn new(value: impl Into<Tree<Traced>>) -> Self {
        Self {
            value: value.into(),
            aux: None,
        }
    }

    /// Value together with an auxiliary payload that is not differentiated
    pub fn with_aux(value: impl Into<Tree<Traced>>, aux: impl Into<Tree<Traced>>) -> Self {
        Self {
            value: value.into(),
            aux: Some(aux.into()),
        }
    }
}

impl From<Traced> for FnOutput {
    fn from(x: Traced) -> Self {
        FnOutput::new(x)
    }
}

impl From<Tree<Traced>> for FnOutput {
    fn from(tree: Tree<Traced>) -> Self {
        FnOutput::new(tree)
    }
}

/// A function that can be traced, and therefore differentiated
pub trait TracedFn: Send + Sync {
    fn trace(&self, tracer: &Tracer, primals: &[Tree<Traced>]) -> Result<FnOutput>;
}

impl<F, R> TracedFn for F
where
    F: Fn(&Tracer, &[Tree<Traced>]) -> Result<R> + Send + Sync,
    R: Into<FnOutput>,
{
    fn trace(&self, tracer: &Tracer, primals: &[Tree<Traced>]) -> Result<FnOutput> {
        self(tracer, primals).map(Into::into)
    }
}

/// Identity that pins a closure's signature so it implements [`TracedFn`]
pub fn traced_fn<F, R>(f: F) -> F
where
    F: Fn(&Tracer, &[Tree<Traced>]) -> Result<R> + Send + Sync,
    R: Into<FnOutput>,
{
    f
}

/// Records complex-aware operations on a [`Tape`]
#[derive(Debug, Default)]
pub struct Tracer {
    tape: Tape,
}

impl Tracer {
    pub fn new(mode: TapeMode) -> Self {
        Self {
            tape: Tape::with_mode(mode),
        }
    }

    pub fn mode(&self) -> TapeMode {
        self.tape.mode()
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    pub fn into_tape(self) -> Tape {
        self.tape
    }

    // ===== Leaves =====

    /// Differentiable input holding a concrete tensor
    pub fn input(&self, tensor: &Tensor) -> Result<Traced> {
        let dtype = tensor.dtype();
        match tensor.data() {
            TensorData::Real(a) => Ok(Traced::Real {
                var: self.tape.variable(a.clone())?,
                dtype,
            }),
            TensorData::Complex(a) => Ok(Traced::Complex {
                re: self.tape.variable(a.mapv(|z| z.re))?,
                im: self.tape.variable(a.mapv(|z| z.im))?,
                dtype,
            }),
        }
    }

    /// Differentiable input known only by shape and dtype
    pub fn placeholder(&self, aval: &ShapeDtype) -> Result<Traced> {
        if aval.dtype.is_complex() {
            Ok(Traced::Complex {
                re: self.tape.placeholder(&aval.shape)?,
                im: self.tape.placeholder(&aval.shape)?,
                dtype: aval.dtype,
            })
        } else {
            Ok(Traced::Real {
                var: self.tape.placeholder(&aval.shape)?,
                dtype: aval.dtype,
            })
        }
    }

    /// Non-differentiable constant
    pub fn constant(&self, tensor: &Tensor) -> Traced {
        let dtype = tensor.dtype();
        match tensor.data() {
            TensorData::Real(a) => Traced::Real {
                var: self.tape.constant(a.clone()),
                dtype,
            },
            TensorData::Complex(a) => Traced::Complex {
                re: self.tape.constant(a.mapv(|z| z.re)),
                im: self.tape.constant(a.mapv(|z| z.im)),
                dtype,
            },
        }
    }

    /// Rank-0 `Float64` constant
    pub fn scalar(&self, value: f64) -> Traced {
        self.constant(&Tensor::scalar(value))
    }

    /// Rank-0 `Complex128` constant
    pub fn complex_scalar(&self, value: Complex64) -> Traced {
        self.constant(&Tensor::complex_scalar(value))
    }

    /// Real zeros with the shape of `x` and its real dtype
    pub fn zeros_like(&self, x: &Traced) -> Result<Traced> {
        let shape = self.shape(x)?;
        Ok(Traced::Real {
            var: self.tape.zeros(&shape),
            dtype: x.dtype().to_real(),
        })
    }

    // ===== Inspection =====

    pub fn shape(&self, x: &Traced) -> Result<Vec<usize>> {
        match x {
            Traced::Real { var, .. } => self.tape.shape(*var),
            Traced::Complex { re, .. } => self.tape.shape(*re),
        }
    }

    /// Shape and dtype of a traced value
    pub fn aval(&self, x: &Traced) -> Result<ShapeDtype> {
        Ok(ShapeDtype::new(&self.shape(x)?, x.dtype()))
    }

    /// Concrete value; fails with `ShapeInference` during abstract tracing
    pub fn value(&self, x: &Traced) -> Result<Tensor> {
        match *x {
            Traced::Real { var, dtype } => Tensor::new(TensorData::Real(self.tape.value(var)?), dtype),
            Traced::Complex { re, im, dtype } => {
                let re = self.tape.value(re)?;
                let im = self.tape.value(im)?;
                let mut out = ArrayD::zeros(re.raw_dim());
                Zip::from(&mut out)
                    .and(&re)
                    .and(&im)
                    .for_each(|o, &r, &i| *o = Complex64::new(r, i));
                Tensor::new(TensorData::Complex(out), dtype)
            }
        }
    }

    /// Broadcast a rank-0 node up to `shape`
    fn pad_to(&self, v: Var, shape: &[usize]) -> Result<Var> {
        if self.tape.shape(v)? == shape {
            Ok(v)
        } else {
            self.tape.add(v, self.tape.zeros(shape))
        }
    }

    fn real_only(&self, x: &Traced, op: &str) -> Result<Var> {
        match x {
            Traced::Real { var, .. } => Ok(*var),
            Traced::Complex { dtype, .. } => Err(WirtingerError::InvalidOperation(format!(
                "{} is not defined for {} values",
                op, dtype
            ))),
        }
    }

    // ===== Arithmetic =====

    pub fn add(&self, a: &Traced, b: &Traced) -> Result<Traced> {
        let dtype = a.dtype().promote(b.dtype());
        match (*a, *b) {
            (Traced::Real { var: x, .. }, Traced::Real { var: y, .. }) => Ok(Traced::Real {
                var: self.tape.add(x, y)?,
                dtype,
            }),
            (Traced::Real { var: x, .. }, Traced::Complex { re, im, .. })
            | (Traced::Complex { re, im, .. }, Traced::Real { var: x, .. }) => {
                let re = self.tape.add(re, x)?;
                let im = self.pad_to(im, &self.tape.shape(re)?)?;
                Ok(Traced::Complex { re, im, dtype })
            }
            (Traced::Complex { re: ar, im: ai, .. }, Traced::Complex { re: br, im: bi, .. }) => {
                Ok(Traced::Complex {
                    re: self.tape.add(ar, br)?,
                    im: self.tape.add(ai, bi)?,
                    dtype,
                })
            }
        }
    }

    pub fn sub(&self, a: &Traced, b: &Traced) -> Result<Traced> {
        let dtype = a.dtype().promote(b.dtype());
        match (*a, *b) {
            (Traced::Real { var: x, .. }, Traced::Real { var: y, .. }) => Ok(Traced::Real {
                var: self.tape.sub(x, y)?,
                dtype,
            }),
            (Traced::Real { var: x, .. }, Traced::Complex { re, im, .. }) => {
                let re = self.tape.sub(x, re)?;
                let im = self.pad_to(self.tape.neg(im)?, &self.tape.shape(re)?)?;
                Ok(Traced::Complex { re, im, dtype })
            }
            (Traced::Complex { re, im, .. }, Traced::Real { var: y, .. }) => {
                let re = self.tape.sub(re, y)?;
                let im = self.pad_to(im, &self.tape.shape(re)?)?;
                Ok(Traced::Complex { re, im, dtype })
            }
            (Traced::Complex { re: ar, im: ai, .. }, Traced::Complex { re: br, im: bi, .. }) => {
                Ok(Traced::Complex {
                    re: self.tape.sub(ar, br)?,
                    im: self.tape.sub(ai, bi)?,
                    dtype,
                })
            }
        }
    }

    pub fn mul(&self, a: &Traced, b: &Traced) -> Result<Traced> {
        let dtype = a.dtype().promote(b.dtype());
        let t = &self.tape;
        match (*a, *b) {
            (Traced::Real { var: x, .. }, Traced::Real { var: y, .. }) => Ok(Traced::Real {
                var: t.mul(x, y)?,
                dtype,
            }),
            (Traced::Real { var: x, .. }, Traced::Complex { re, im, .. })
            | (Traced::Complex { re, im, .. }, Traced::Real { var: x, .. }) => Ok(Traced::Complex {
                re: t.mul(re, x)?,
                im: t.mul(im, x)?,
                dtype,
            }),
            (Traced::Complex { re: ar, im: ai, .. }, Traced::Complex { re: br, im: bi, .. }) => {
                // (ar + i ai)(br + i bi) = (ar br - ai bi) + i (ar bi + ai br)
                let re = t.sub(t.mul(ar, br)?, t.mul(ai, bi)?)?;
                let im = t.add(t.mul(ar, bi)?, t.mul(ai, br)?)?;
                Ok(Traced::Complex { re, im, dtype })
            }
        }
    }

    pub fn div(&self, a: &Traced, b: &Traced) -> Result<Traced> {
        let dtype = floating(a.dtype().promote(b.dtype()));
        let t = &self.tape;
        match (*a, *b) {
            (Traced::Real { var: x, .. }, Traced::Real { var: y, .. }) => Ok(Traced::Real {
                var: t.div(x, y)?,
                dtype,
            }),
            (Traced::Complex { re, im, .. }, Traced::Real { var: y, .. }) => Ok(Traced::Complex {
                re: t.div(re, y)?,
                im: t.div(im, y)?,
                dtype,
            }),
            (_, Traced::Complex { re: br, im: bi, .. }) => {
                // a / b = a·conj(b) / |b|^2
                let den = t.add(t.mul(br, br)?, t.mul(bi, bi)?)?;
                let (num_re, num_im) = match *a {
                    Traced::Real { var: x, .. } => (t.mul(x, br)?, t.neg(t.mul(x, bi)?)?),
                    Traced::Complex { re: ar, im: ai, .. } => (
                        t.add(t.mul(ar, br)?, t.mul(ai, bi)?)?,
                        t.sub(t.mul(ai, br)?, t.mul(ar, bi)?)?,
                    ),
                };
                Ok(Traced::Complex {
                    re: t.div(num_re, den)?,
                    im: t.div(num_im, den)?,
                    dtype,
                })
            }
        }
    }

    pub fn neg(&self, x: &Traced) -> Result<Traced> {
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: self.tape.neg(var)?,
                dtype,
            }),
            Traced::Complex { re, im, dtype } => Ok(Traced::Complex {
                re: self.tape.neg(re)?,
                im: self.tape.neg(im)?,
                dtype,
            }),
        }
    }

    /// Multiply by a real constant
    pub fn scale(&self, x: &Traced, factor: f64) -> Result<Traced> {
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: self.tape.scale(var, factor)?,
                dtype: floating(dtype),
            }),
            Traced::Complex { re, im, dtype } => Ok(Traced::Complex {
                re: self.tape.scale(re, factor)?,
                im: self.tape.scale(im, factor)?,
                dtype,
            }),
        }
    }

    // ===== Elementary functions =====

    fn cosh_sinh(&self, v: Var) -> Result<(Var, Var)> {
        let t = &self.tape;
        let ep = t.exp(v)?;
        let en = t.exp(t.neg(v)?)?;
        Ok((t.scale(t.add(ep, en)?, 0.5)?, t.scale(t.sub(ep, en)?, 0.5)?))
    }

    pub fn exp(&self, x: &Traced) -> Result<Traced> {
        let t = &self.tape;
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: t.exp(var)?,
                dtype: floating(dtype),
            }),
            Traced::Complex { re, im, dtype } => {
                // exp(a + ib) = e^a (cos b + i sin b)
                let ea = t.exp(re)?;
                Ok(Traced::Complex {
                    re: t.mul(ea, t.cos(im)?)?,
                    im: t.mul(ea, t.sin(im)?)?,
                    dtype,
                })
            }
        }
    }

    pub fn sin(&self, x: &Traced) -> Result<Traced> {
        let t = &self.tape;
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: t.sin(var)?,
                dtype: floating(dtype),
            }),
            Traced::Complex { re, im, dtype } => {
                // sin(a + ib) = sin a cosh b + i cos a sinh b
                let (cosh, sinh) = self.cosh_sinh(im)?;
                Ok(Traced::Complex {
                    re: t.mul(t.sin(re)?, cosh)?,
                    im: t.mul(t.cos(re)?, sinh)?,
                    dtype,
                })
            }
        }
    }

    pub fn cos(&self, x: &Traced) -> Result<Traced> {
        let t = &self.tape;
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: t.cos(var)?,
                dtype: floating(dtype),
            }),
            Traced::Complex { re, im, dtype } => {
                // cos(a + ib) = cos a cosh b - i sin a sinh b
                let (cosh, sinh) = self.cosh_sinh(im)?;
                Ok(Traced::Complex {
                    re: t.mul(t.cos(re)?, cosh)?,
                    im: t.neg(t.mul(t.sin(re)?, sinh)?)?,
                    dtype,
                })
            }
        }
    }

    /// Natural logarithm of a real value
    pub fn log(&self, x: &Traced) -> Result<Traced> {
        let var = self.real_only(x, "log")?;
        Ok(Traced::Real {
            var: self.tape.log(var)?,
            dtype: floating(x.dtype()),
        })
    }

    /// Hyperbolic tangent of a real value
    pub fn tanh(&self, x: &Traced) -> Result<Traced> {
        let var = self.real_only(x, "tanh")?;
        Ok(Traced::Real {
            var: self.tape.tanh(var)?,
            dtype: floating(x.dtype()),
        })
    }

    /// Square root of a real value
    pub fn sqrt(&self, x: &Traced) -> Result<Traced> {
        let var = self.real_only(x, "sqrt")?;
        Ok(Traced::Real {
            var: self.tape.sqrt(var)?,
            dtype: floating(x.dtype()),
        })
    }

    /// Real power of a real value
    pub fn pow(&self, x: &Traced, exponent: f64) -> Result<Traced> {
        let var = self.real_only(x, "pow")?;
        Ok(Traced::Real {
            var: self.tape.pow(var, exponent)?,
            dtype: floating(x.dtype()),
        })
    }

    // ===== Complex structure =====

    /// Squared modulus `|x|^2`, always real
    pub fn abs2(&self, x: &Traced) -> Result<Traced> {
        let t = &self.tape;
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: t.mul(var, var)?,
                dtype,
            }),
            Traced::Complex { re, im, dtype } => Ok(Traced::Real {
                var: t.add(t.mul(re, re)?, t.mul(im, im)?)?,
                dtype: dtype.to_real(),
            }),
        }
    }

    /// Modulus `|x|`, always real
    pub fn abs(&self, x: &Traced) -> Result<Traced> {
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: self.tape.abs(var)?,
                dtype,
            }),
            Traced::Complex { .. } => self.sqrt(&self.abs2(x)?),
        }
    }

    /// Real part; real values are returned unchanged
    pub fn real(&self, x: &Traced) -> Result<Traced> {
        match *x {
            Traced::Real { .. } => Ok(*x),
            Traced::Complex { re, dtype, .. } => Ok(Traced::Real {
                var: re,
                dtype: dtype.to_real(),
            }),
        }
    }

    /// Imaginary part; zeros for real values
    pub fn imag(&self, x: &Traced) -> Result<Traced> {
        match *x {
            Traced::Real { .. } => self.zeros_like(x),
            Traced::Complex { im, dtype, .. } => Ok(Traced::Real {
                var: im,
                dtype: dtype.to_real(),
            }),
        }
    }

    pub fn conj(&self, x: &Traced) -> Result<Traced> {
        match *x {
            Traced::Real { .. } => Ok(*x),
            Traced::Complex { re, im, dtype } => Ok(Traced::Complex {
                re,
                im: self.tape.neg(im)?,
                dtype,
            }),
        }
    }

    /// Assemble `re + i·im` from two real values
    pub fn complex(&self, re: &Traced, im: &Traced) -> Result<Traced> {
        let (r, i) = match (*re, *im) {
            (Traced::Real { var: r, .. }, Traced::Real { var: i, .. }) => (r, i),
            _ => {
                return Err(WirtingerError::DtypeMismatch(format!(
                    "complex() expects real parts, got {} and {}",
                    re.dtype(),
                    im.dtype()
                )))
            }
        };
        let dtype = floating(re.dtype().promote(im.dtype())).to_complex()?;
        let r_shape = self.tape.shape(r)?;
        let i_shape = self.tape.shape(i)?;
        let (r, i) = if r_shape == i_shape {
            (r, i)
        } else if r_shape.is_empty() {
            (self.pad_to(r, &i_shape)?, i)
        } else if i_shape.is_empty() {
            (r, self.pad_to(i, &r_shape)?)
        } else {
            return Err(WirtingerError::ShapeInference(format!(
                "complex(): real part {:?} and imaginary part {:?} differ",
                r_shape, i_shape
            )));
        };
        Ok(Traced::Complex { re: r, im: i, dtype })
    }

    // ===== Shape operations =====

    /// Sum over one axis, or everything when `axis` is `None`
    pub fn sum(&self, x: &Traced, axis: Option<usize>) -> Result<Traced> {
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: self.tape.sum(var, axis)?,
                dtype,
            }),
            Traced::Complex { re, im, dtype } => Ok(Traced::Complex {
                re: self.tape.sum(re, axis)?,
                im: self.tape.sum(im, axis)?,
                dtype,
            }),
        }
    }

    pub fn reshape(&self, x: &Traced, shape: &[usize]) -> Result<Traced> {
        match *x {
            Traced::Real { var, dtype } => Ok(Traced::Real {
                var: self.tape.reshape(var, shape)?,
                dtype,
            }),
            Traced::Complex { re, im, dtype } => Ok(Traced::Complex {
                re: self.tape.reshape(re, shape)?,
                im: self.tape.reshape(im, shape)?,
                dtype,
            }),
        }
    }

    /// Matrix product of two 2-d values
    pub fn matmul(&self, a: &Traced, b: &Traced) -> Result<Traced> {
        let dtype = a.dtype().promote(b.dtype());
        let t = &self.tape;
        match (*a, *b) {
            (Traced::Real { var: x, .. }, Traced::Real { var: y, .. }) => Ok(Traced::Real {
                var: t.matmul(x, y)?,
                dtype,
            }),
            (Traced::Real { var: x, .. }, Traced::Complex { re, im, .. }) => Ok(Traced::Complex {
                re: t.matmul(x, re)?,
                im: t.matmul(x, im)?,
                dtype,
            }),
            (Traced::Complex { re, im, .. }, Traced::Real { var: y, .. }) => Ok(Traced::Complex {
                re: t.matmul(re, y)?,
                im: t.matmul(im, y)?,
                dtype,
            }),
            (Traced::Complex { re: ar, im: ai, .. }, Traced::Complex { re: br, im: bi, .. }) => {
                let re = t.sub(t.matmul(ar, br)?, t.matmul(ai, bi)?)?;
                let im = t.add(t.matmul(ar, bi)?, t.matmul(ai, br)?)?;
                Ok(Traced::Complex { re, im, dtype })
            }
        }
    }
}
