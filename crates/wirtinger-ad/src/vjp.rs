//! Vector-Jacobian products across real and complex domains
//!
//! The native pullback is real-linear and follows the holomorphic
//! convention. That is exactly right when both the inputs and the outputs
//! of a function are complex, but not in the mixed cases. This module picks
//! a strategy from the reality of the inputs and outputs:
//!
//! | inputs  | outputs | strategy                            | native calls |
//! |---------|---------|-------------------------------------|--------------|
//! | complex | complex | [`vjp_cc`]: native, optional conj   | 1            |
//! | real    | real    | [`vjp_rr`]: split complex cotangent | 1 or 2       |
//! | real    | complex | [`vjp_rc`]: real/imag decomposition | 4            |
//! | complex | real    | rejected                            | -            |
//!
//! # Overview
//!
//! For `y = f(x)` and a cotangent `ȳ`, the real→real and real→complex
//! pullbacks both compute
//!
//! ```text
//! vjp(ȳ) = ∂/∂x Σ conj(ȳ)·f(x)
//! ```
//!
//! The real→complex case gets there from two real functions `u = Re f`
//! and `v = Im f` and four real pullback evaluations:
//!
//! ```text
//! vr_jr = pb_u(Re ȳ)   vj_jr = pb_u(Im ȳ)
//! vr_jj = pb_v(Re ȳ)   vj_jj = pb_v(Im ȳ)
//!
//! vjp(ȳ) = (vr_jr - i·vj_jr) + i·(vr_jj - i·vj_jj)
//!        = (vr_jr + vj_jj) + i·(vr_jj - vj_jr)
//! ```
//!
//! Setting [`VjpOptions::conjugate`] conjugates every gradient leaf, which
//! is the convention stochastic-reconfiguration style optimizers expect.
//!
//! # Example
//!
//! ```
//! use wirtinger_ad::trace::{arg, traced_fn};
//! use wirtinger_ad::vjp::{vjp, Domain, VjpOp, VjpOptions};
//! use wirtinger_core::{Tensor, Tree};
//! use scirs2_core::numeric::Complex64;
//!
//! // f(x) = x + i·x
//! let f = traced_fn(|t, p| {
//!     let x = arg(p, 0)?;
//!     t.complex(x, x)
//! });
//!
//! let res = vjp(&f, &[Tree::leaf(Tensor::scalar(2.0))], VjpOptions::default()).unwrap();
//! assert_eq!(res.pullback.domain(), Domain::RealComplex);
//!
//! let ct = Tree::leaf(Tensor::complex_scalar(Complex64::new(1.0, 0.0)));
//! let grad = res.pullback.vjp(&ct).unwrap();
//! let expected = Tree::leaf(Tensor::complex_scalar(Complex64::new(1.0, 1.0)));
//! assert!(grad[0].allclose(&expected, 0.0, 1e-12));
//! ```

use crate::native::{native_vjp, ImagPart, NativePullback, RealPart};
use crate::partial::HashablePartial;
use crate::shape::{eval_shape, ShapeCache};
use crate::trace::TracedFn;
use rayon::prelude::*;
use std::fmt;
use wirtinger_core::{HasDType, Reality, Result, ShapeDtype, Tensor, Tree, WirtingerError};

/// Trait for pullbacks (backward differentiation)
pub trait VjpOp {
    /// Compute the VJP given a cotangent of the output
    ///
    /// # Arguments
    ///
    /// * `cotangent` - Tree with the structure and shapes of the output;
    ///   real or complex independently of the output
    ///
    /// # Returns
    ///
    /// One gradient tree per primal, each mirroring its primal's structure
    fn vjp(&self, cotangent: &Tree<Tensor>) -> Result<Vec<Tree<Tensor>>>;
}

/// Reality of a function's inputs and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Domain {
    RealReal,
    RealComplex,
    ComplexComplex,
    /// Complex inputs with real outputs
    Unsupported,
}

impl Domain {
    pub fn classify(inputs: Reality, outputs: Reality) -> Self {
        match (inputs, outputs) {
            (Reality::Real, Reality::Real) => Domain::RealReal,
            (Reality::Real, Reality::Complex) => Domain::RealComplex,
            (Reality::Complex, Reality::Complex) => Domain::ComplexComplex,
            (Reality::Complex, Reality::Real) => Domain::Unsupported,
        }
    }

    /// Classify from the primals and the probed output
    pub fn of<L: HasDType>(primals: &[Tree<L>], out: &Tree<ShapeDtype>) -> Self {
        Self::classify(Reality::of_primals(primals), Reality::of(out))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::RealReal => write!(f, "real -> real"),
            Domain::RealComplex => write!(f, "real -> complex"),
            Domain::ComplexComplex => write!(f, "complex -> complex"),
            Domain::Unsupported => write!(f, "complex -> real"),
        }
    }
}

/// Flags accepted by every VJP entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VjpOptions {
    /// The function returns an auxiliary payload next to its value
    pub has_aux: bool,
    /// Conjugate every gradient leaf
    pub conjugate: bool,
}

impl VjpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aux(mut self) -> Self {
        self.has_aux = true;
        self
    }

    pub fn conjugated(mut self) -> Self {
        self.conjugate = true;
        self
    }
}

/// Primal output, pullback and aux payload of one VJP call
#[derive(Debug, Clone)]
pub struct VjpResult {
    pub primals_out: Tree<Tensor>,
    pub pullback: Pullback,
    pub aux: Option<Tree<Tensor>>,
}

fn conj_all(grads: Vec<Tree<Tensor>>, conjugate: bool) -> Vec<Tree<Tensor>> {
    if conjugate {
        grads.iter().map(Tree::conj).collect()
    } else {
        grads
    }
}

/// Leaf-wise `re + i·sign·im` over per-primal gradient lists
fn assemble(re: &[Tree<Tensor>], im: &[Tree<Tensor>], sign: f64) -> Result<Vec<Tree<Tensor>>> {
    re.iter()
        .zip(im)
        .map(|(r, i)| Tree::from_parts(r, i, sign))
        .collect()
}

// ===== Complex -> complex =====

/// Pullback of a complex→complex function
#[derive(Debug, Clone)]
pub struct CcPullback {
    native: NativePullback,
    conjugate: bool,
}

impl VjpOp for CcPullback {
    fn vjp(&self, cotangent: &Tree<Tensor>) -> Result<Vec<Tree<Tensor>>> {
        Ok(conj_all(self.native.apply(cotangent)?, self.conjugate))
    }
}

/// VJP of a complex→complex function: the native pullback, conjugated on
/// request.
///
/// Only meaningful for holomorphic functions, or when the caller accepts
/// the native convention.
pub fn vjp_cc<F>(fun: &F, primals: &[Tree<Tensor>], options: VjpOptions) -> Result<VjpResult>
where
    F: TracedFn + ?Sized,
{
    let native = native_vjp(fun, primals, options.has_aux)?;
    Ok(VjpResult {
        primals_out: native.primals_out,
        pullback: Pullback::ComplexComplex(CcPullback {
            native: native.pullback,
            conjugate: options.conjugate,
        }),
        aux: native.aux,
    })
}

// ===== Real -> real =====

/// Pullback of a real→real function, accepting complex cotangents
#[derive(Debug, Clone)]
pub struct RrPullback {
    native: NativePullback,
    conjugate: bool,
}

impl VjpOp for RrPullback {
    fn vjp(&self, cotangent: &Tree<Tensor>) -> Result<Vec<Tree<Tensor>>> {
        if !cotangent.is_complex() {
            return self.native.apply(cotangent);
        }
        let out_r = self.native.apply(&cotangent.real_part())?;
        let out_i = self.native.apply(&cotangent.imag_part().neg())?;
        let sign = if self.conjugate { -1.0 } else { 1.0 };
        assemble(&out_r, &out_i, sign)
    }
}

/// VJP of a real→real function.
///
/// A real cotangent goes straight through the native pullback. A complex
/// cotangent `ȳ` is split: the native pullback runs on `Re ȳ` and on
/// `-Im ȳ`, and the results are combined as `out_r + i·out_i`
/// (`out_r - i·out_i` when conjugating).
pub fn vjp_rr<F>(fun: &F, primals: &[Tree<Tensor>], options: VjpOptions) -> Result<VjpResult>
where
    F: TracedFn + ?Sized,
{
    let native = native_vjp(fun, primals, options.has_aux)?;
    let domain = Domain::classify(
        Reality::of_primals(primals),
        Reality::of(&native.primals_out),
    );
    if domain != Domain::RealReal {
        return Err(WirtingerError::InvalidArgument(format!(
            "vjp_rr called on a {} function",
            domain
        )));
    }
    Ok(VjpResult {
        primals_out: native.primals_out,
        pullback: Pullback::RealReal(RrPullback {
            native: native.pullback,
            conjugate: options.conjugate,
        }),
        aux: native.aux,
    })
}

// ===== Real -> complex =====

/// The four real pullback evaluations of a real→complex VJP
#[derive(Debug, Clone, PartialEq)]
pub struct RcComponents {
    /// Real-part pullback at `Re ȳ`
    pub vr_jr: Vec<Tree<Tensor>>,
    /// Real-part pullback at `Im ȳ`
    pub vj_jr: Vec<Tree<Tensor>>,
    /// Imaginary-part pullback at `Re ȳ`
    pub vr_jj: Vec<Tree<Tensor>>,
    /// Imaginary-part pullback at `Im ȳ`
    pub vj_jj: Vec<Tree<Tensor>>,
}

impl RcComponents {
    /// `(vr_jr - i·vj_jr) + i·(vr_jj - i·vj_jj)`, conjugated on request
    pub fn recombine(&self, conjugate: bool) -> Result<Vec<Tree<Tensor>>> {
        let sign = if conjugate { -1.0 } else { 1.0 };
        let n = self.vr_jr.len();
        if [&self.vj_jr, &self.vr_jj, &self.vj_jj]
            .iter()
            .any(|c| c.len() != n)
        {
            return Err(WirtingerError::StructureMismatch(
                "pullback components disagree on the number of primals".to_string(),
            ));
        }
        (0..n)
            .map(|k| {
                let re = self.vr_jr[k].add(&self.vj_jj[k])?;
                let im = self.vr_jj[k].sub(&self.vj_jr[k])?;
                Tree::from_parts(&re, &im, sign)
            })
            .collect()
    }
}

/// Pullback of a real→complex function: two native pullbacks, one for the
/// real part of the output and one for the imaginary part
#[derive(Debug, Clone)]
pub struct RcPullback {
    real: NativePullback,
    imag: NativePullback,
    conjugate: bool,
}

impl RcPullback {
    /// Run the four real pullback evaluations for `cotangent`
    pub fn components(&self, cotangent: &Tree<Tensor>) -> Result<RcComponents> {
        let ct_r = cotangent.real_part();
        let ct_j = cotangent.imag_part();

        log::trace!("real -> complex pullback: evaluating 4 real pullbacks");
        Ok(RcComponents {
            vr_jr: self.real.apply(&ct_r)?,
            vj_jr: self.real.apply(&ct_j)?,
            vr_jj: self.imag.apply(&ct_r)?,
            vj_jj: self.imag.apply(&ct_j)?,
        })
    }
}

impl VjpOp for RcPullback {
    fn vjp(&self, cotangent: &Tree<Tensor>) -> Result<Vec<Tree<Tensor>>> {
        self.components(cotangent)?.recombine(self.conjugate)
    }
}

/// VJP of a real→complex function.
///
/// Differentiates `Re∘f` and `Im∘f` separately at the same point; the
/// primal output is reassembled as `vals_r + i·vals_j`. The aux payload is
/// the one `fun` produced for these primals.
pub fn vjp_rc<F>(fun: &F, primals: &[Tree<Tensor>], options: VjpOptions) -> Result<VjpResult>
where
    F: TracedFn + ?Sized,
{
    if Reality::of_primals(primals) == Reality::Complex {
        return Err(WirtingerError::InvalidArgument(
            "vjp_rc called with complex primals".to_string(),
        ));
    }
    let real = native_vjp(&RealPart(fun), primals, options.has_aux)?;
    let imag = native_vjp(&ImagPart(fun), primals, options.has_aux)?;

    Ok(VjpResult {
        primals_out: Tree::from_parts(&real.primals_out, &imag.primals_out, 1.0)?,
        pullback: Pullback::RealComplex(RcPullback {
            real: real.pullback,
            imag: imag.pullback,
            conjugate: options.conjugate,
        }),
        aux: real.aux,
    })
}

// ===== Dispatch =====

/// A pullback from any of the three strategies
#[derive(Debug, Clone)]
pub enum Pullback {
    ComplexComplex(CcPullback),
    RealReal(RrPullback),
    RealComplex(RcPullback),
}

impl Pullback {
    pub fn domain(&self) -> Domain {
        match self {
            Pullback::ComplexComplex(_) => Domain::ComplexComplex,
            Pullback::RealReal(_) => Domain::RealReal,
            Pullback::RealComplex(_) => Domain::RealComplex,
        }
    }

    /// Number of tape nodes recorded for this pullback, over all its native
    /// traces
    pub fn tape_len(&self) -> usize {
        match self {
            Pullback::ComplexComplex(pb) => pb.native.tape_len(),
            Pullback::RealReal(pb) => pb.native.tape_len(),
            Pullback::RealComplex(pb) => pb.real.tape_len() + pb.imag.tape_len(),
        }
    }

    /// Apply this pullback to many cotangents in parallel
    pub fn vjp_batch(&self, cotangents: &[Tree<Tensor>]) -> Result<Vec<Vec<Tree<Tensor>>>> {
        if cotangents.len() > 1 {
            cotangents.par_iter().map(|ct| self.vjp(ct)).collect()
        } else {
            cotangents.iter().map(|ct| self.vjp(ct)).collect()
        }
    }
}

impl VjpOp for Pullback {
    fn vjp(&self, cotangent: &Tree<Tensor>) -> Result<Vec<Tree<Tensor>>> {
        match self {
            Pullback::ComplexComplex(pb) => pb.vjp(cotangent),
            Pullback::RealReal(pb) => pb.vjp(cotangent),
            Pullback::RealComplex(pb) => pb.vjp(cotangent),
        }
    }
}

fn dispatch<F>(
    fun: &F,
    primals: &[Tree<Tensor>],
    options: VjpOptions,
    out: &Tree<ShapeDtype>,
) -> Result<VjpResult>
where
    F: TracedFn + ?Sized,
{
    let domain = Domain::of(primals, out);
    log::debug!(
        "vjp: {} function, {} primal(s), {} output leaf(s), conjugate={}",
        domain,
        primals.len(),
        out.num_leaves(),
        options.conjugate
    );
    let res = match domain {
        Domain::ComplexComplex => vjp_cc(fun, primals, options),
        Domain::RealReal => vjp_rr(fun, primals, options),
        Domain::RealComplex => vjp_rc(fun, primals, options),
        Domain::Unsupported => Err(WirtingerError::UnsupportedDomainCodomain {
            domain: Reality::Complex,
            codomain: Reality::Real,
        }),
    }?;
    log::debug!("vjp: recorded {} tape node(s)", res.pullback.tape_len());
    Ok(res)
}

/// Compute the value of `fun` at `primals` and a pullback for it.
///
/// The output reality is probed with [`eval_shape`] first, then the call is
/// routed to [`vjp_cc`], [`vjp_rr`] or [`vjp_rc`]. Complex inputs with real
/// outputs fail with [`WirtingerError::UnsupportedDomainCodomain`].
pub fn vjp<F>(fun: &F, primals: &[Tree<Tensor>], options: VjpOptions) -> Result<VjpResult>
where
    F: TracedFn + ?Sized,
{
    let out = eval_shape(fun, primals, options.has_aux)?;
    dispatch(fun, primals, options, &out)
}

/// [`vjp`] with the output probe memoized in `cache`
pub fn vjp_cached<F>(
    cache: &ShapeCache,
    fun: &HashablePartial<F>,
    primals: &[Tree<Tensor>],
    options: VjpOptions,
) -> Result<VjpResult>
where
    HashablePartial<F>: TracedFn,
{
    let out = cache.eval_shape(fun, primals, options.has_aux)?;
    dispatch(fun, primals, options, &out)
}

/// Value, gradients and aux payload of `fun`
#[derive(Debug, Clone)]
pub struct ValueAndGrad {
    pub value: Tree<Tensor>,
    pub grads: Vec<Tree<Tensor>>,
    pub aux: Option<Tree<Tensor>>,
}

/// Evaluate `fun` and pull back a cotangent of ones (`1 + 0i` for complex
/// output leaves)
pub fn value_and_grad<F>(fun: &F, primals: &[Tree<Tensor>], options: VjpOptions) -> Result<ValueAndGrad>
where
    F: TracedFn + ?Sized,
{
    let res = vjp(fun, primals, options)?;
    let ones = res.primals_out.shape_dtypes().ones();
    let grads = res.pullback.vjp(&ones)?;
    Ok(ValueAndGrad {
        value: res.primals_out,
        grads,
        aux: res.aux,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{arg, traced_fn, FnOutput};
    use scirs2_core::numeric::Complex64;
    use wirtinger_core::DType;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn cscalar(re: f64, im: f64) -> Tree<Tensor> {
        Tree::leaf(Tensor::complex_scalar(c(re, im)))
    }

    fn scalar(x: f64) -> Tree<Tensor> {
        Tree::leaf(Tensor::scalar(x))
    }

    #[test]
    fn test_classify_all_combinations() {
        assert_eq!(Domain::classify(Reality::Real, Reality::Real), Domain::RealReal);
        assert_eq!(
            Domain::classify(Reality::Real, Reality::Complex),
            Domain::RealComplex
        );
        assert_eq!(
            Domain::classify(Reality::Complex, Reality::Complex),
            Domain::ComplexComplex
        );
        assert_eq!(
            Domain::classify(Reality::Complex, Reality::Real),
            Domain::Unsupported
        );
    }

    #[test]
    fn test_real_to_complex_known_function() {
        // f(x) = x + i·x, cotangent 1 + 0i gives 1 + 1i
        let f = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            t.complex(x, x)
        });
        let res = vjp(&f, &[scalar(0.7)], VjpOptions::default()).unwrap();
        assert_eq!(res.pullback.domain(), Domain::RealComplex);
        assert!(res.primals_out.allclose(&cscalar(0.7, 0.7), 0.0, 1e-12));

        let g = res.pullback.vjp(&cscalar(1.0, 0.0)).unwrap();
        assert!(g[0].allclose(&cscalar(1.0, 1.0), 0.0, 1e-12));
    }

    #[test]
    fn test_rc_components_recombine() {
        // u = 2x, v = 3x
        let f = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            t.complex(&t.scale(x, 2.0)?, &t.scale(x, 3.0)?)
        });
        let res = vjp_rc(&f, &[scalar(1.0)], VjpOptions::default()).unwrap();
        let pb = match &res.pullback {
            Pullback::RealComplex(pb) => pb.clone(),
            other => panic!("unexpected pullback {:?}", other.domain()),
        };
        let comps = pb.components(&cscalar(0.5, -1.0)).unwrap();
        assert_eq!(comps.vr_jr[0], scalar(1.0));
        assert_eq!(comps.vj_jr[0], scalar(-2.0));
        assert_eq!(comps.vr_jj[0], scalar(1.5));
        assert_eq!(comps.vj_jj[0], scalar(-3.0));

        // real: vr_jr + vj_jj = -2, imag: vr_jj - vj_jr = 3.5
        let g = comps.recombine(false).unwrap();
        assert!(g[0].allclose(&cscalar(-2.0, 3.5), 0.0, 1e-12));
        let g = comps.recombine(true).unwrap();
        assert!(g[0].allclose(&cscalar(-2.0, -3.5), 0.0, 1e-12));
    }

    #[test]
    fn test_real_to_real_real_cotangent_is_native() {
        let f = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            t.mul(x, x)
        });
        let x = Tree::leaf(Tensor::from_vec(vec![1.0, -2.0], &[2]).unwrap());
        let res = vjp(&f, std::slice::from_ref(&x), VjpOptions::default()).unwrap();
        assert_eq!(res.pullback.domain(), Domain::RealReal);

        let ct = Tree::leaf(Tensor::from_vec(vec![1.0, 0.5], &[2]).unwrap());
        let g = res.pullback.vjp(&ct).unwrap();
        let native = native_vjp(&f, &[x], false).unwrap().pullback.apply(&ct).unwrap();
        assert_eq!(g, native);
        assert_eq!(g[0].as_leaf().unwrap().dtype(), DType::Float64);
    }

    #[test]
    fn test_real_to_real_complex_cotangent() {
        // f(x) = 3x, cotangent a + ib gives 3a - 3ib
        let f = traced_fn(|t, p| t.scale(arg(p, 0)?, 3.0));
        let res = vjp(&f, &[scalar(1.0)], VjpOptions::default()).unwrap();
        let g = res.pullback.vjp(&cscalar(2.0, 1.0)).unwrap();
        assert!(g[0].allclose(&cscalar(6.0, -3.0), 0.0, 1e-12));

        let res = vjp(&f, &[scalar(1.0)], VjpOptions::default().conjugated()).unwrap();
        let g = res.pullback.vjp(&cscalar(2.0, 1.0)).unwrap();
        assert!(g[0].allclose(&cscalar(6.0, 3.0), 0.0, 1e-12));
    }

    #[test]
    fn test_complex_to_complex_conjugate() {
        // f(z) = z^2 at z = 1 + i, f'(z) = 2 + 2i
        let f = traced_fn(|t, p| {
            let z = arg(p, 0)?;
            t.mul(z, z)
        });
        let z = cscalar(1.0, 1.0);
        let plain = vjp(&f, std::slice::from_ref(&z), VjpOptions::default()).unwrap();
        let conj = vjp(&f, &[z], VjpOptions::default().conjugated()).unwrap();
        assert_eq!(plain.pullback.domain(), Domain::ComplexComplex);

        let g = plain.pullback.vjp(&cscalar(1.0, 0.0)).unwrap();
        let h = conj.pullback.vjp(&cscalar(1.0, 0.0)).unwrap();
        assert!(g[0].allclose(&cscalar(2.0, 2.0), 0.0, 1e-12));
        assert!(h[0].allclose(&cscalar(2.0, -2.0), 0.0, 1e-12));
    }

    #[test]
    fn test_complex_to_real_is_rejected() {
        let f = traced_fn(|t, p| t.abs(arg(p, 0)?));
        let err = vjp(&f, &[cscalar(3.0, 4.0)], VjpOptions::default()).unwrap_err();
        assert_eq!(
            err,
            WirtingerError::UnsupportedDomainCodomain {
                domain: Reality::Complex,
                codomain: Reality::Real,
            }
        );
    }

    #[test]
    fn test_aux_passes_through_every_route() {
        let f = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            Ok(FnOutput::with_aux(t.complex(x, x)?, t.scale(x, 4.0)?))
        });
        let res = vjp(&f, &[scalar(2.0)], VjpOptions::default().with_aux()).unwrap();
        assert_eq!(res.aux, Some(scalar(8.0)));

        let g = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            Ok(FnOutput::with_aux(t.neg(x)?, Tree::list([Tree::leaf(*x)])))
        });
        let res = vjp(&g, &[scalar(2.0)], VjpOptions::default().with_aux()).unwrap();
        assert_eq!(res.aux, Some(Tree::list([scalar(2.0)])));

        let h = traced_fn(|t, p| {
            let z = arg(p, 0)?;
            Ok(FnOutput::with_aux(t.mul(z, z)?, t.abs2(z)?))
        });
        let res = vjp(&h, &[cscalar(1.0, 2.0)], VjpOptions::default().with_aux()).unwrap();
        assert_eq!(res.pullback.domain(), Domain::ComplexComplex);
        assert_eq!(res.aux, Some(scalar(5.0)));
    }

    #[test]
    fn test_direct_strategies_check_their_domain() {
        let f = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            t.complex(x, x)
        });
        assert!(vjp_rr(&f, &[scalar(1.0)], VjpOptions::default()).is_err());
        assert!(vjp_rc(&f, &[cscalar(1.0, 0.0)], VjpOptions::default()).is_err());
    }

    #[test]
    fn test_value_and_grad_uses_ones() {
        let f = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            t.sum(&t.mul(x, x)?, None)
        });
        let x = Tree::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap());
        let vg = value_and_grad(&f, &[x], VjpOptions::default()).unwrap();
        assert_eq!(vg.value, scalar(14.0));
        assert_eq!(
            vg.grads[0],
            Tree::leaf(Tensor::from_vec(vec![2.0, 4.0, 6.0], &[3]).unwrap())
        );
    }

    #[test]
    fn test_vjp_batch_matches_sequential() {
        let f = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            t.complex(&t.sin(x)?, &t.mul(x, x)?)
        });
        let x = Tree::leaf(Tensor::from_vec(vec![0.1, 0.2], &[2]).unwrap());
        let res = vjp(&f, &[x], VjpOptions::default()).unwrap();
        let cts: Vec<_> = (0..8)
            .map(|k| {
                Tree::leaf(
                    Tensor::from_complex_vec(vec![c(k as f64, 1.0), c(1.0, -(k as f64))], &[2])
                        .unwrap(),
                )
            })
            .collect();
        let batch = res.pullback.vjp_batch(&cts).unwrap();
        for (ct, g) in cts.iter().zip(&batch) {
            assert_eq!(&res.pullback.vjp(ct).unwrap(), g);
        }
    }

    #[test]
    fn test_cached_dispatch() {
        use crate::partial::{HashablePartial, PartialKey};
        use crate::trace::{Traced, Tracer};

        fn rotate(t: &Tracer, p: &[Tree<Traced>], key: &PartialKey) -> Result<Traced> {
            let x = arg(p, 0)?;
            let theta = key.kwarg("theta")?.as_f64()?;
            let phase = t.complex_scalar(Complex64::from_polar(1.0, theta));
            t.mul(x, &phase)
        }

        let cache = ShapeCache::new();
        let f = HashablePartial::new("rotate", rotate).with_kwarg("theta", 0.5);
        for _ in 0..3 {
            let res = vjp_cached(&cache, &f, &[scalar(1.0)], VjpOptions::default()).unwrap();
            assert_eq!(res.pullback.domain(), Domain::RealComplex);
        }
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_cached_dispatch_keeps_same_name_functions_apart() {
        use crate::partial::{HashablePartial, PartialKey};
        use crate::trace::{Traced, Tracer};

        fn amplitude(t: &Tracer, p: &[Tree<Traced>], _key: &PartialKey) -> Result<Traced> {
            let x = arg(p, 0)?;
            t.complex(x, x)
        }

        fn energy(t: &Tracer, p: &[Tree<Traced>], _key: &PartialKey) -> Result<Traced> {
            let x = arg(p, 0)?;
            t.mul(x, x)
        }

        let cache = ShapeCache::new();
        let f = HashablePartial::new("model", amplitude);
        let g = HashablePartial::new("model", energy);

        let res = vjp_cached(&cache, &f, &[scalar(1.0)], VjpOptions::default()).unwrap();
        assert_eq!(res.pullback.domain(), Domain::RealComplex);

        let res = vjp_cached(&cache, &g, &[scalar(1.0)], VjpOptions::default()).unwrap();
        assert_eq!(res.pullback.domain(), Domain::RealReal);
        assert_eq!(res.primals_out, scalar(1.0));
        assert_eq!(cache.stats().misses, 2);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_tape_len_counts_every_native_trace() {
        let f = traced_fn(|t, p| {
            let x = arg(p, 0)?;
            t.complex(x, &t.mul(x, x)?)
        });
        let rc = vjp(&f, &[scalar(1.0)], VjpOptions::default()).unwrap();
        let native = crate::native::native_vjp(&f, &[scalar(1.0)], false).unwrap();
        assert!(rc.pullback.tape_len() > 0);
        assert!(rc.pullback.tape_len() > native.pullback.tape_len());

        let g = traced_fn(|t, p| t.neg(arg(p, 0)?));
        let rr = vjp(&g, &[scalar(1.0)], VjpOptions::default()).unwrap();
        let native = crate::native::native_vjp(&g, &[scalar(1.0)], false).unwrap();
        assert_eq!(rr.pullback.tape_len(), native.pullback.tape_len());
    }
}
