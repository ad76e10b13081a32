//! Gradient checking utilities
//!
//! This module verifies VJPs against finite differences, one route at a
//! time. Every check evaluates the function at perturbed primals and
//! contracts the output with the cotangent `c`:
//!
//! - **real → real / real → complex**: `S(x) = Σ conj(c)·f(x)`, and the
//!   expected VJP is `∂S/∂x` (complex whenever `S` is).
//! - **complex → complex**: `S(z) = Re Σ c·f(z)`, and the expected VJP of a
//!   complex leaf `z = x + iy` is `∂S/∂x - i·∂S/∂y`.
//!
//! Primals are widened to `Float64`/`Complex128` before perturbing, so
//! single-precision inputs are checked at double precision.
//!
//! # Example
//!
//! ```
//! use wirtinger_ad::gradcheck::{check_vjp, GradCheckConfig};
//! use wirtinger_ad::trace::{arg, traced_fn};
//! use wirtinger_ad::vjp::VjpOptions;
//! use wirtinger_core::{DType, Tensor, Tree};
//!
//! let f = traced_fn(|t, p| {
//!     let x = arg(p, 0)?;
//!     t.complex(&t.sin(x)?, &t.mul(x, x)?)
//! });
//! let x = Tree::leaf(Tensor::from_vec(vec![0.3, -1.2], &[2]).unwrap());
//! let ct = Tree::leaf(Tensor::ones(&[2], DType::Complex128));
//!
//! let result = check_vjp(&f, &[x], &ct, VjpOptions::default(), &GradCheckConfig::default()).unwrap();
//! assert!(result.passed);
//! ```

use crate::native::evaluate;
use crate::shape::eval_shape;
use crate::trace::TracedFn;
use crate::vjp::{vjp, Domain, VjpOp, VjpOptions};
use anyhow::{anyhow, Result};
use scirs2_core::ndarray_ext::ArrayD;
use scirs2_core::numeric::Complex64;
use wirtinger_core::{DType, Tensor, TensorData, Tree};

/// Gradient checking configuration
#[derive(Debug, Clone)]
pub struct GradCheckConfig {
    /// Step size for finite differences (default: 1e-5)
    pub epsilon: f64,

    /// Relative tolerance for gradient comparison (default: 1e-3)
    pub rtol: f64,

    /// Absolute tolerance for gradient comparison (default: 1e-5)
    pub atol: f64,

    /// Use central difference (more accurate but 2x slower)
    pub use_central_diff: bool,

    /// Log every mismatching element
    pub verbose: bool,
}

impl Default for GradCheckConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            rtol: 1e-3,
            atol: 1e-5,
            use_central_diff: true,
            verbose: false,
        }
    }
}

/// Result of gradient checking
#[derive(Debug, Clone)]
pub struct GradCheckResult {
    /// Maximum absolute difference between analytical and numerical gradients
    pub max_abs_diff: f64,

    /// Maximum relative difference
    pub max_rel_diff: f64,

    /// Whether the gradient check passed
    pub passed: bool,

    /// Number of elements checked
    pub num_elements: usize,

    /// Number of elements that failed the check
    pub num_failures: usize,
}

/// Check the dispatched VJP of `fun` against finite differences
///
/// # Arguments
///
/// * `fun` - Function to differentiate
/// * `primals` - Point to check gradients at
/// * `cotangent` - Cotangent of the output
/// * `options` - Options forwarded to [`vjp`]; `conjugate` is honored by
///   the numerical side too
/// * `config` - Gradient checking configuration
pub fn check_vjp<F>(
    fun: &F,
    primals: &[Tree<Tensor>],
    cotangent: &Tree<Tensor>,
    options: VjpOptions,
    config: &GradCheckConfig,
) -> Result<GradCheckResult>
where
    F: TracedFn + ?Sized,
{
    let analytical = vjp(fun, primals, options)?.pullback.vjp(cotangent)?;
    let numerical = numerical_vjp(fun, primals, cotangent, options, config)?;

    if analytical.len() != numerical.len() {
        return Err(anyhow!(
            "{} analytical gradients but {} numerical ones",
            analytical.len(),
            numerical.len()
        ));
    }
    let mut pairs = Vec::new();
    for (a, n) in analytical.iter().zip(&numerical) {
        if a.structure() != n.structure() {
            return Err(anyhow!(
                "gradient structure {} doesn't match {}",
                a.structure(),
                n.structure()
            ));
        }
        for (la, ln) in a.leaves().into_iter().zip(n.leaves()) {
            if la.shape() != ln.shape() {
                return Err(anyhow!(
                    "Gradient shape {:?} doesn't match input shape {:?}",
                    la.shape(),
                    ln.shape()
                ));
            }
            pairs.push((la.to_complex_array(), ln.to_complex_array()));
        }
    }
    Ok(compare_gradients(&pairs, config))
}

/// Finite-difference VJP of `fun` at `primals`, following the same
/// conventions as [`vjp`] on each route
pub fn numerical_vjp<F>(
    fun: &F,
    primals: &[Tree<Tensor>],
    cotangent: &Tree<Tensor>,
    options: VjpOptions,
    config: &GradCheckConfig,
) -> Result<Vec<Tree<Tensor>>>
where
    F: TracedFn + ?Sized,
{
    let out = eval_shape(fun, primals, options.has_aux)?;
    let domain = Domain::of(primals, &out);
    let holomorphic = match domain {
        Domain::ComplexComplex => true,
        Domain::RealReal | Domain::RealComplex => false,
        Domain::Unsupported => {
            return Err(anyhow!("no finite-difference convention for {} functions", domain))
        }
    };

    let wide: Vec<Tree<Tensor>> = primals
        .iter()
        .map(|p| {
            p.map(|t| {
                t.astype(if t.is_complex() {
                    DType::Complex128
                } else {
                    DType::Float64
                })
            })
        })
        .collect();

    let objective =
        |point: &[Tree<Tensor>]| contract(fun, point, cotangent, options.has_aux, holomorphic);
    let base = if config.use_central_diff {
        None
    } else {
        Some(objective(wide.as_slice())?)
    };
    let h = config.epsilon;

    // derivative of the objective along one real direction
    let directional = |i: usize, leaf: usize, k: usize, step: Complex64| -> Result<Complex64> {
        let plus = objective(perturb(&wide, i, leaf, k, step * h)?.as_slice())?;
        match base {
            Some(s0) => Ok((plus - s0) / h),
            None => {
                let minus = objective(perturb(&wide, i, leaf, k, -step * h)?.as_slice())?;
                Ok((plus - minus) / (2.0 * h))
            }
        }
    };

    let real_result = !holomorphic && !cotangent.is_complex() && !out.is_complex();
    let mut grads = Vec::with_capacity(wide.len());
    for (i, primal) in wide.iter().enumerate() {
        let (leaves, def) = primal.clone().flatten();
        let mut leaf_grads = Vec::with_capacity(leaves.len());
        for (j, t) in leaves.iter().enumerate() {
            let n = t.size();
            let mut values = Vec::with_capacity(n);
            for k in 0..n {
                let dx = directional(i, j, k, Complex64::new(1.0, 0.0))?;
                let g = if !holomorphic {
                    dx
                } else if t.is_complex() {
                    let dy = directional(i, j, k, Complex64::new(0.0, 1.0))?;
                    Complex64::new(dx.re, -dy.re)
                } else {
                    Complex64::new(dx.re, 0.0)
                };
                values.push(if options.conjugate { g.conj() } else { g });
            }

            let grad = if real_result || (holomorphic && !t.is_complex()) {
                Tensor::from_vec(values.iter().map(|z| z.re).collect(), t.shape())?
            } else {
                Tensor::from_complex_vec(values, t.shape())?
            };
            leaf_grads.push(grad);
        }
        grads.push(def.unflatten(leaf_grads)?);
    }
    Ok(grads)
}

/// `Σ conj(c)·f`, or `Re Σ c·f` for the holomorphic convention
fn contract<F>(
    fun: &F,
    primals: &[Tree<Tensor>],
    cotangent: &Tree<Tensor>,
    has_aux: bool,
    holomorphic: bool,
) -> Result<Complex64>
where
    F: TracedFn + ?Sized,
{
    let (out, _aux) = evaluate(fun, primals, has_aux)?;
    out.check_matches(cotangent)?;

    let mut total = Complex64::new(0.0, 0.0);
    for (y, c) in out.leaves().into_iter().zip(cotangent.leaves()) {
        let y = y.to_complex_array();
        let c = c.to_complex_array();
        for (yv, cv) in y.iter().zip(c.iter()) {
            total += if holomorphic { cv * yv } else { cv.conj() * yv };
        }
    }
    Ok(if holomorphic {
        Complex64::new(total.re, 0.0)
    } else {
        total
    })
}

/// Copy of `primals` with element `k` of leaf `leaf` of primal `i` shifted
/// by `delta` (only the real part of `delta` for real leaves)
fn perturb(
    primals: &[Tree<Tensor>],
    i: usize,
    leaf: usize,
    k: usize,
    delta: Complex64,
) -> Result<Vec<Tree<Tensor>>> {
    let mut out = primals.to_vec();
    let (mut leaves, def) = primals[i].clone().flatten();
    let target = leaves
        .get_mut(leaf)
        .ok_or_else(|| anyhow!("Index error"))?;
    *target = match target.data() {
        TensorData::Real(a) => Tensor::from_real(shift(a, k, delta.re)?),
        TensorData::Complex(a) => Tensor::from_complex(shift(a, k, delta)?),
    };
    out[i] = def.unflatten(leaves)?;
    Ok(out)
}

fn shift<T>(array: &ArrayD<T>, k: usize, delta: T) -> Result<ArrayD<T>>
where
    T: Clone + std::ops::AddAssign,
{
    let mut shifted = array.clone();
    let value = shifted
        .iter_mut()
        .nth(k)
        .ok_or_else(|| anyhow!("Index error"))?;
    *value += delta;
    Ok(shifted)
}

/// Compare analytical and numerical gradients element-wise
fn compare_gradients(
    pairs: &[(ArrayD<Complex64>, ArrayD<Complex64>)],
    config: &GradCheckConfig,
) -> GradCheckResult {
    let mut max_abs_diff = 0.0_f64;
    let mut max_rel_diff = 0.0_f64;
    let mut num_failures = 0;
    let mut num_elements = 0;

    for (leaf, (analytical, numerical)) in pairs.iter().enumerate() {
        for (idx, (a_val, n_val)) in analytical.iter().zip(numerical.iter()).enumerate() {
            num_elements += 1;
            let abs_diff = (a_val - n_val).norm();
            let rel_diff = if n_val.norm() > f64::EPSILON {
                abs_diff / n_val.norm()
            } else {
                abs_diff
            };

            max_abs_diff = max_abs_diff.max(abs_diff);
            max_rel_diff = max_rel_diff.max(rel_diff);

            if abs_diff > config.atol && rel_diff > config.rtol {
                num_failures += 1;
                if config.verbose {
                    log::warn!(
                        "gradient mismatch at leaf {} element {}: analytical={}, numerical={}, abs_diff={:.2e}, rel_diff={:.2e}",
                        leaf,
                        idx,
                        a_val,
                        n_val,
                        abs_diff,
                        rel_diff
                    );
                }
            }
        }
    }

    let passed = num_failures == 0;
    if config.verbose {
        if passed {
            log::info!("gradient check passed ({} elements)", num_elements);
        } else {
            log::info!(
                "gradient check failed: {}/{} elements exceeded tolerance",
                num_failures,
                num_elements
            );
        }
        log::info!("  max absolute difference: {:.2e}", max_abs_diff);
        log::info!("  max relative difference: {:.2e}", max_rel_diff);
    }

    GradCheckResult {
        max_abs_diff,
        max_rel_diff,
        passed,
        num_elements,
        num_failures,
    }
}
