//! Integration tests for wirtinger-ad
//!
//! These tests drive the public dispatcher end to end and check each route
//! against finite differences.

use anyhow::Result;
use scirs2_core::numeric::Complex64;
use wirtinger_ad::gradcheck::{check_vjp, numerical_vjp, GradCheckConfig};
use wirtinger_ad::partial::{HashablePartial, PartialKey};
use wirtinger_ad::prelude::*;
use wirtinger_core::{derive_worker_key, DType, PrngKey, Reality, Tensor, Tree, WirtingerError};

fn config() -> GradCheckConfig {
    GradCheckConfig {
        rtol: 1e-6,
        atol: 1e-8,
        ..Default::default()
    }
}

fn cvec(values: &[(f64, f64)]) -> Tensor {
    let data = values.iter().map(|&(re, im)| Complex64::new(re, im)).collect();
    Tensor::from_complex_vec(data, &[values.len()]).unwrap()
}

/// Log-amplitude of a toy wavefunction with real parameters `{a, b}`:
/// `log ψ = a + tanh(a·b) + i·b/2`
fn log_psi(t: &Tracer, p: &[Tree<Traced>]) -> wirtinger_core::Result<Traced> {
    let params = &p[0];
    let (a, b) = match params {
        Tree::Dict(map) => (
            map.get("a").and_then(Tree::as_leaf),
            map.get("b").and_then(Tree::as_leaf),
        ),
        _ => (None, None),
    };
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(WirtingerError::InvalidArgument(
                "expected parameters {a, b}".to_string(),
            ))
        }
    };
    let re = t.add(a, &t.tanh(&t.mul(a, b)?)?)?;
    let im = t.scale(b, 0.5)?;
    t.complex(&re, &im)
}

#[test]
fn test_real_to_complex_wavefunction_gradients() -> Result<()> {
    let params = Tree::dict([
        ("a", Tree::leaf(Tensor::from_vec(vec![0.3, -0.2], &[2])?)),
        ("b", Tree::leaf(Tensor::from_vec(vec![1.1, 0.4], &[2])?)),
    ]);
    let ct = Tree::leaf(cvec(&[(1.0, 0.5), (-0.25, 2.0)]));

    let res = vjp(&log_psi, std::slice::from_ref(&params), VjpOptions::default())?;
    assert_eq!(res.pullback.domain(), Domain::RealComplex);
    assert_eq!(Reality::of(&res.primals_out), Reality::Complex);

    let grads = res.pullback.vjp(&ct)?;
    assert_eq!(grads[0].structure(), params.structure());
    assert!(grads[0].is_complex());

    for options in [VjpOptions::default(), VjpOptions::default().conjugated()] {
        let result = check_vjp(&log_psi, std::slice::from_ref(&params), &ct, options, &config())?;
        assert!(result.passed, "{:?}", result);
    }
    Ok(())
}

#[test]
fn test_known_real_to_complex_gradient() -> Result<()> {
    let f = traced_fn(|t, p| {
        let x = arg(p, 0)?;
        t.complex(x, x)
    });
    let res = vjp(&f, &[Tree::leaf(Tensor::scalar(-3.0))], VjpOptions::default())?;
    let g = res
        .pullback
        .vjp(&Tree::leaf(Tensor::complex_scalar(Complex64::new(1.0, 0.0))))?;
    let value = g[0].as_leaf().and_then(Tensor::as_complex).map(|a| a.sum());
    assert_eq!(value, Some(Complex64::new(1.0, 1.0)));
    Ok(())
}

#[test]
fn test_real_to_real_complex_cotangent_decomposition() -> Result<()> {
    let f = traced_fn(|t, p| {
        let x = arg(p, 0)?;
        t.mul(&t.sin(x)?, x)
    });
    let x = Tree::leaf(Tensor::from_vec(vec![0.5, 1.5, -2.0], &[3])?);
    let a = Tensor::from_vec(vec![1.0, -1.0, 0.25], &[3])?;
    let b = Tensor::from_vec(vec![2.0, 0.5, -3.0], &[3])?;
    let ct = Tree::leaf(Tensor::from_parts(&a, &b, 1.0)?);

    let res = vjp(&f, std::slice::from_ref(&x), VjpOptions::default())?;
    let pb_a = res.pullback.vjp(&Tree::leaf(a))?;
    let pb_b = res.pullback.vjp(&Tree::leaf(b))?;

    let plain = res.pullback.vjp(&ct)?;
    assert!(plain[0].allclose(&Tree::from_parts(&pb_a[0], &pb_b[0], -1.0)?, 1e-12, 1e-12));

    let res = vjp(&f, &[x], VjpOptions::default().conjugated())?;
    let conj = res.pullback.vjp(&ct)?;
    assert!(conj[0].allclose(&Tree::from_parts(&pb_a[0], &pb_b[0], 1.0)?, 1e-12, 1e-12));
    Ok(())
}

#[test]
fn test_complex_to_complex_matches_finite_differences() -> Result<()> {
    // f(z, w) = z·w + exp(z)
    let f = traced_fn(|t, p| {
        let z = arg(p, 0)?;
        let w = arg(p, 1)?;
        t.add(&t.mul(z, w)?, &t.exp(z)?)
    });
    let z = Tree::leaf(cvec(&[(0.1, 0.2), (-0.5, 1.0)]));
    let w = Tree::leaf(cvec(&[(1.0, -1.0), (0.3, 0.3)]));
    let ct = Tree::leaf(cvec(&[(0.5, 0.5), (1.0, -2.0)]));

    for options in [VjpOptions::default(), VjpOptions::default().conjugated()] {
        let result = check_vjp(&f, &[z.clone(), w.clone()], &ct, options, &config())?;
        assert!(result.passed, "{:?}", result);
        assert_eq!(result.num_elements, 4);
    }
    Ok(())
}

#[test]
fn test_non_holomorphic_complex_to_complex_uses_native_convention() -> Result<()> {
    // f(z) = conj(z): the native pullback gives ∂x Re(c f) - i ∂y Re(c f)
    let f = traced_fn(|t, p| t.conj(arg(p, 0)?));
    let z = Tree::leaf(Tensor::complex_scalar(Complex64::new(0.2, 0.7)));
    let ct = Tree::leaf(Tensor::complex_scalar(Complex64::new(1.0, 2.0)));

    let analytical = vjp(&f, std::slice::from_ref(&z), VjpOptions::default())?
        .pullback
        .vjp(&ct)?;
    let numerical = numerical_vjp(&f, &[z], &ct, VjpOptions::default(), &config())?;
    assert!(analytical[0].allclose(&numerical[0], 1e-6, 1e-8));
    Ok(())
}

#[test]
fn test_complex_to_real_rejected() {
    let f = traced_fn(|t, p| t.sum(&t.abs2(arg(p, 0)?)?, None));
    let z = Tree::leaf(Tensor::ones(&[3], DType::Complex64));
    match vjp(&f, &[z], VjpOptions::default()) {
        Err(WirtingerError::UnsupportedDomainCodomain { domain, codomain }) => {
            assert_eq!(domain, Reality::Complex);
            assert_eq!(codomain, Reality::Real);
        }
        other => panic!("expected rejection, got {:?}", other.map(|r| r.primals_out)),
    }
}

#[test]
fn test_conjugate_flag_is_an_involution() -> Result<()> {
    let f = traced_fn(|t, p| {
        let x = arg(p, 0)?;
        t.complex(&t.cos(x)?, &t.mul(x, x)?)
    });
    let x = [Tree::leaf(Tensor::from_vec(vec![0.1, 0.9], &[2])?)];
    let ct = Tree::leaf(cvec(&[(1.0, -1.0), (0.5, 2.0)]));

    let plain = vjp(&f, &x, VjpOptions::default())?.pullback.vjp(&ct)?;
    let conj = vjp(&f, &x, VjpOptions::default().conjugated())?
        .pullback
        .vjp(&ct)?;
    assert!(plain[0].allclose(&conj[0].conj(), 0.0, 1e-12));
    Ok(())
}

#[test]
fn test_aux_and_structure_preserved() -> Result<()> {
    let f = traced_fn(|t, p| {
        let w = arg(p, 0)?;
        let bias = arg(p, 1)?;
        let y = t.add(&t.sum(&t.mul(w, w)?, None)?, bias)?;
        Ok(FnOutput::with_aux(
            Tree::tuple([Tree::leaf(y), Tree::leaf(t.neg(bias)?)]),
            Tree::dict([("norm", Tree::leaf(t.sum(w, None)?))]),
        ))
    });
    let w = Tree::leaf(Tensor::from_vec(vec![1.0, 2.0], &[2])?);
    let bias = Tree::leaf(Tensor::scalar(0.5));
    let res = vjp(&f, &[w, bias], VjpOptions::default().with_aux())?;

    assert_eq!(
        res.aux,
        Some(Tree::dict([("norm", Tree::leaf(Tensor::scalar(3.0)))]))
    );
    let ct = Tree::tuple([
        Tree::leaf(Tensor::scalar(1.0)),
        Tree::leaf(Tensor::scalar(1.0)),
    ]);
    let grads = res.pullback.vjp(&ct)?;
    assert_eq!(grads.len(), 2);
    assert_eq!(grads[0], Tree::leaf(Tensor::from_vec(vec![2.0, 4.0], &[2])?));
    assert_eq!(grads[1], Tree::leaf(Tensor::scalar(0.0)));

    // wrong cotangent structure
    let bad = Tree::list([Tree::leaf(Tensor::scalar(1.0))]);
    assert!(matches!(
        res.pullback.vjp(&bad),
        Err(WirtingerError::StructureMismatch(_))
    ));
    Ok(())
}

#[test]
fn test_single_precision_inputs() -> Result<()> {
    let f = traced_fn(|t, p| {
        let x = arg(p, 0)?;
        t.complex(x, &t.scale(x, 2.0)?)
    });
    let x = Tree::leaf(Tensor::ones(&[2], DType::Float32));
    let res = vjp(&f, &[x], VjpOptions::default())?;
    assert_eq!(
        res.primals_out.as_leaf().map(Tensor::dtype),
        Some(DType::Complex64)
    );
    let ct = Tree::leaf(Tensor::ones(&[2], DType::Complex64));
    let g = res.pullback.vjp(&ct)?;
    assert_eq!(g[0].as_leaf().map(Tensor::dtype), Some(DType::Complex64));
    Ok(())
}

fn amplitude(t: &Tracer, p: &[Tree<Traced>], key: &PartialKey) -> wirtinger_core::Result<Traced> {
    let x = arg(p, 0)?;
    let scale = key.kwarg("scale")?.as_f64()?;
    let phase = t.scale(x, scale)?;
    t.complex(&t.cos(&phase)?, &t.sin(&phase)?)
}

#[test]
fn test_cached_dispatch_over_many_calls() -> Result<()> {
    let cache = ShapeCache::new();
    let f = HashablePartial::new("amplitude", amplitude).with_kwarg("scale", 0.5);
    let ct = Tree::leaf(Tensor::ones(&[4], DType::Complex128));

    for seed in 0..5 {
        let x = Tree::leaf(Tensor::random_uniform(
            &[4],
            DType::Float64,
            PrngKey::new(seed),
            -1.0,
            1.0,
        ));
        let res = vjp_cached(&cache, &f, std::slice::from_ref(&x), VjpOptions::default())?;
        assert_eq!(res.pullback.domain(), Domain::RealComplex);
        let result = check_vjp(&f, &[x], &ct, VjpOptions::default(), &config())?;
        assert!(result.passed);
    }
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.stats().hits, 4);
    Ok(())
}

#[test]
fn test_per_worker_keys_give_distinct_streams() -> Result<()> {
    let root = PrngKey::new(1234);
    let keys = (0..4)
        .map(|rank| derive_worker_key(root, rank, 4))
        .collect::<wirtinger_core::Result<Vec<_>>>()?;
    let samples: Vec<Tensor> = keys
        .iter()
        .map(|&k| Tensor::random_uniform(&[8], DType::Float64, k, 0.0, 1.0))
        .collect();
    for i in 0..samples.len() {
        for j in (i + 1)..samples.len() {
            assert_ne!(samples[i], samples[j]);
        }
    }
    assert_eq!(keys[2], derive_worker_key(root, 2, 4)?);
    Ok(())
}

#[test]
fn test_value_and_grad_on_complex_output() -> Result<()> {
    let f = traced_fn(|t, p| {
        let x = arg(p, 0)?;
        t.complex(&t.sum(x, None)?, &t.sum(&t.mul(x, x)?, None)?)
    });
    let x = Tree::leaf(Tensor::from_vec(vec![1.0, 2.0], &[2])?);
    let vg = value_and_grad(&f, &[x], VjpOptions::default())?;
    assert_eq!(
        vg.value,
        Tree::leaf(Tensor::complex_scalar(Complex64::new(3.0, 5.0)))
    );
    // cotangent 1: real part 1, imaginary part 2x
    let expected = Tree::leaf(cvec(&[(1.0, 2.0), (1.0, 4.0)]));
    assert!(vg.grads[0].allclose(&expected, 0.0, 1e-12));
    Ok(())
}
