//! Native real-linear pullbacks
//!
//! [`native_vjp`] traces a function once on a concrete tape and returns its
//! value together with a [`NativePullback`]. This is the primitive the
//! dispatch strategies in [`vjp`](crate::vjp) are built on, and it follows
//! the holomorphic convention:
//!
//! - a complex cotangent `c` on a complex output seeds the real and
//!   imaginary nodes with `(Re c, -Im c)`;
//! - a real input leaf receives the gradient of its node;
//! - a complex input leaf receives `g_re - i·g_im`.
//!
//! For a holomorphic `f` the pullback of `c` is therefore `c·f'(z)`. A real
//! output leaf cannot absorb a complex cotangent; that case is the job of
//! the real→real strategy, which splits the cotangent first.

use crate::tape::{FrozenTape, TapeMode, Var};
use crate::trace::{FnOutput, Traced, TracedFn, Tracer};
use scirs2_core::ndarray_ext::{ArrayD, Zip};
use scirs2_core::numeric::Complex64;
use std::sync::Arc;
use wirtinger_core::{Result, ShapeDtype, Tensor, TensorData, Tree, WirtingerError};

/// Split a traced output, checking it agrees with `has_aux`
pub(crate) fn split_output(
    out: FnOutput,
    has_aux: bool,
) -> Result<(Tree<Traced>, Option<Tree<Traced>>)> {
    match (out.aux, has_aux) {
        (Some(aux), true) => Ok((out.value, Some(aux))),
        (None, false) => Ok((out.value, None)),
        (None, true) => Err(WirtingerError::InvalidArgument(
            "has_aux is set but the function returned no auxiliary payload".to_string(),
        )),
        (Some(_), false) => Err(WirtingerError::InvalidArgument(
            "the function returned an auxiliary payload but has_aux is not set".to_string(),
        )),
    }
}

/// Result of [`native_vjp`]
#[derive(Debug, Clone)]
pub struct NativeVjp {
    pub primals_out: Tree<Tensor>,
    pub pullback: NativePullback,
    pub aux: Option<Tree<Tensor>>,
}

/// Pullback of one traced evaluation
///
/// Holds the frozen tape behind an `Arc`; cloning is cheap and every call
/// to [`apply`](Self::apply) works on its own gradient buffer.
#[derive(Debug, Clone)]
pub struct NativePullback {
    tape: Arc<FrozenTape>,
    inputs: Vec<Tree<Traced>>,
    outputs: Tree<Traced>,
    out_avals: Tree<ShapeDtype>,
}

impl NativePullback {
    /// Shapes and dtypes of the output this pullback was derived from
    pub fn out_avals(&self) -> &Tree<ShapeDtype> {
        &self.out_avals
    }

    /// Number of nodes on the underlying tape
    pub fn tape_len(&self) -> usize {
        self.tape.len()
    }

    /// Map a cotangent to one gradient tree per primal
    pub fn apply(&self, cotangent: &Tree<Tensor>) -> Result<Vec<Tree<Tensor>>> {
        self.out_avals.check_matches(cotangent)?;

        let mut seeds: Vec<(Var, ArrayD<f64>)> = Vec::new();
        self.outputs.zip_map(cotangent, |out, ct| {
            match (*out, ct.data()) {
                (Traced::Real { var, .. }, TensorData::Real(c)) => seeds.push((var, c.clone())),
                (Traced::Real { dtype, .. }, TensorData::Complex(_)) => {
                    return Err(WirtingerError::DtypeMismatch(format!(
                        "complex cotangent for a {} output",
                        dtype
                    )))
                }
                (Traced::Complex { re, .. }, TensorData::Real(c)) => seeds.push((re, c.clone())),
                (Traced::Complex { re, im, .. }, TensorData::Complex(c)) => {
                    seeds.push((re, c.mapv(|z| z.re)));
                    seeds.push((im, c.mapv(|z| -z.im)));
                }
            }
            Ok(())
        })?;

        let mut wrt = Vec::new();
        for leaf in self.inputs.iter().flat_map(|t| t.leaves()) {
            match *leaf {
                Traced::Real { var, .. } => wrt.push(var),
                Traced::Complex { re, im, .. } => {
                    wrt.push(re);
                    wrt.push(im);
                }
            }
        }

        let mut grads = self.tape.backward(&seeds, &wrt)?.into_iter();
        let mut next = || {
            grads.next().ok_or_else(|| {
                WirtingerError::InvalidOperation("backward returned too few gradients".to_string())
            })
        };
        self.inputs
            .iter()
            .map(|input| {
                input.try_map(|leaf| match *leaf {
                    Traced::Real { dtype, .. } => {
                        Tensor::new(TensorData::Real(next()?), dtype.gradient_dtype())
                    }
                    Traced::Complex { dtype, .. } => {
                        let g_re = next()?;
                        let g_im = next()?;
                        let mut out = ArrayD::zeros(g_re.raw_dim());
                        Zip::from(&mut out)
                            .and(&g_re)
                            .and(&g_im)
                            .for_each(|o, &r, &i| *o = Complex64::new(r, -i));
                        Tensor::new(TensorData::Complex(out), dtype)
                    }
                })
            })
            .collect()
    }
}

fn materialize(tracer: &Tracer, tree: &Tree<Traced>) -> Result<Tree<Tensor>> {
    tree.try_map(|x| tracer.value(x))
}

/// Trace `fun` at `primals` and return its value with a native pullback
pub fn native_vjp<F>(fun: &F, primals: &[Tree<Tensor>], has_aux: bool) -> Result<NativeVjp>
where
    F: TracedFn + ?Sized,
{
    let tracer = Tracer::new(TapeMode::Concrete);
    let inputs = primals
        .iter()
        .map(|p| p.try_map(|t| tracer.input(t)))
        .collect::<Result<Vec<_>>>()?;

    let (outputs, aux) = split_output(fun.trace(&tracer, &inputs)?, has_aux)?;
    let primals_out = materialize(&tracer, &outputs)?;
    let aux = aux.map(|a| materialize(&tracer, &a)).transpose()?;
    let out_avals = primals_out.shape_dtypes();

    let tape = tracer.into_tape();
    if log::log_enabled!(log::Level::Trace) {
        let stats = tape.stats();
        log::trace!(
            "native vjp: {} node(s), {} on a gradient path, ops {:?}",
            stats.num_nodes,
            stats.num_requires_grad,
            stats.ops_count
        );
    }
    let tape = Arc::new(tape.freeze());
    Ok(NativeVjp {
        primals_out,
        pullback: NativePullback {
            tape,
            inputs,
            outputs,
            out_avals,
        },
        aux,
    })
}

/// Forward evaluation only: the value and aux payload of `fun`
pub fn evaluate<F>(
    fun: &F,
    primals: &[Tree<Tensor>],
    has_aux: bool,
) -> Result<(Tree<Tensor>, Option<Tree<Tensor>>)>
where
    F: TracedFn + ?Sized,
{
    let tracer = Tracer::new(TapeMode::Concrete);
    let inputs = primals
        .iter()
        .map(|p| p.map(|t| tracer.constant(t)))
        .collect::<Vec<_>>();
    let (value, aux) = split_output(fun.trace(&tracer, &inputs)?, has_aux)?;
    Ok((
        materialize(&tracer, &value)?,
        aux.map(|a| materialize(&tracer, &a)).transpose()?,
    ))
}

/// The real part of `fun`'s output, leaf-wise, with `fun`'s aux payload
pub struct RealPart<'a, F: ?Sized>(pub &'a F);

/// The imaginary part of `fun`'s output, leaf-wise, with `fun`'s aux payload
pub struct ImagPart<'a, F: ?Sized>(pub &'a F);

impl<F: TracedFn + ?Sized> TracedFn for RealPart<'_, F> {
    fn trace(&self, tracer: &Tracer, primals: &[Tree<Traced>]) -> Result<FnOutput> {
        let out = self.0.trace(tracer, primals)?;
        Ok(FnOutput {
            value: out.value.try_map(|x| tracer.real(x))?,
            aux: out.aux,
        })
    }
}

impl<F: TracedFn + ?Sized> TracedFn for ImagPart<'_, F> {
    fn trace(&self, tracer: &Tracer, primals: &[Tree<Traced>]) -> Result<FnOutput> {
        let out = self.0.trace(tracer, primals)?;
        Ok(FnOutput {
            value: out.value.try_map(|x| tracer.imag(x))?,
            aux: out.aux,
        })
    }
}
