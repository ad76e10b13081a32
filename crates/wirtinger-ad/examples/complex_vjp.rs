//! Complex-Aware VJP Example
//!
//! This example walks through the three differentiation routes of the
//! dispatcher on a toy variational wavefunction. The real -> complex
//! gradients are also checked against finite differences.

use anyhow::Result;
use scirs2_core::numeric::Complex64;
use wirtinger_ad::gradcheck::{check_vjp, GradCheckConfig};
use wirtinger_ad::partial::{HashablePartial, PartialKey};
use wirtinger_ad::prelude::*;
use wirtinger_core::{derive_worker_key, DType, PrngKey, Tensor, Tree};

fn main() -> Result<()> {
    println!("=== Complex-Aware Vector-Jacobian Products ===\n");

    // Example 1: Real parameters, complex log-amplitude
    println!("Example 1: Real -> Complex");
    real_to_complex()?;

    // Example 2: Real loss, complex cotangent
    println!("\nExample 2: Real -> Real with a complex cotangent");
    real_to_real()?;

    // Example 3: Holomorphic complex function
    println!("\nExample 3: Complex -> Complex");
    complex_to_complex()?;

    // Example 4: Cached dispatch over per-worker samples
    println!("\nExample 4: Cached dispatch");
    cached_dispatch()?;

    println!("\n=== All examples completed successfully! ===");
    Ok(())
}

/// log ψ(σ) = Σ_i (w_i σ_i) + i·Σ_i (θ_i σ_i) for one configuration σ
fn log_psi(t: &Tracer, p: &[Tree<Traced>], key: &PartialKey) -> wirtinger_core::Result<Traced> {
    let w = arg(p, 0)?;
    let theta = arg(p, 1)?;
    let spins = key.arg(0)?.as_shape()?;
    let sigma = t.constant(&Tensor::from_vec(
        spins.iter().map(|&s| s as f64 * 2.0 - 1.0).collect(),
        &[spins.len()],
    )?);
    let amplitude = t.sum(&t.mul(w, &sigma)?, None)?;
    let phase = t.sum(&t.mul(theta, &sigma)?, None)?;
    t.complex(&amplitude, &phase)
}

fn real_to_complex() -> Result<()> {
    let f = HashablePartial::new("log_psi", log_psi).with_arg(vec![1usize, 0, 1]);
    let w = Tree::leaf(Tensor::from_vec(vec![0.1, -0.3, 0.2], &[3])?);
    let theta = Tree::leaf(Tensor::from_vec(vec![0.5, 0.5, -1.0], &[3])?);
    let primals = [w, theta];

    let res = vjp(&f, &primals, VjpOptions::default())?;
    println!("  route: {}", res.pullback.domain());
    println!("  log ψ = {:?}", res.primals_out.as_leaf().and_then(Tensor::as_complex));

    let ct = Tree::leaf(Tensor::complex_scalar(Complex64::new(1.0, 0.0)));
    let grads = res.pullback.vjp(&ct)?;
    println!("  ∂/∂w     = {:?}", grads[0].as_leaf().and_then(Tensor::as_complex));
    println!("  ∂/∂theta = {:?}", grads[1].as_leaf().and_then(Tensor::as_complex));

    let check = check_vjp(&f, &primals, &ct, VjpOptions::default(), &GradCheckConfig::default())?;
    println!("  gradcheck passed: {} (max abs diff {:.2e})", check.passed, check.max_abs_diff);
    Ok(())
}

fn real_to_real() -> Result<()> {
    let f = traced_fn(|t, p| {
        let x = arg(p, 0)?;
        t.sum(&t.mul(x, x)?, None)
    });
    let x = [Tree::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3])?)];

    for options in [VjpOptions::default(), VjpOptions::default().conjugated()] {
        let res = vjp(&f, &x, options)?;
        let ct = Tree::leaf(Tensor::complex_scalar(Complex64::new(1.0, 1.0)));
        let grads = res.pullback.vjp(&ct)?;
        println!(
            "  conjugate={}: {:?}",
            options.conjugate,
            grads[0].as_leaf().and_then(Tensor::as_complex)
        );
    }
    Ok(())
}

fn complex_to_complex() -> Result<()> {
    let f = traced_fn(|t, p| {
        let z = arg(p, 0)?;
        t.mul(z, &t.exp(z)?)
    });
    let z = [Tree::leaf(Tensor::complex_scalar(Complex64::new(0.5, -0.25)))];
    let vg = value_and_grad(&f, &z, VjpOptions::default())?;
    println!("  f(z)  = {:?}", vg.value.as_leaf().and_then(Tensor::as_complex));
    println!("  f'(z) = {:?}", vg.grads[0].as_leaf().and_then(Tensor::as_complex));

    // complex in, real out is rejected
    let norm = traced_fn(|t, p| t.abs2(arg(p, 0)?));
    match vjp(&norm, &z, VjpOptions::default()) {
        Ok(_) => println!("  |z|^2: unexpectedly accepted"),
        Err(e) => println!("  |z|^2: {}", e),
    }
    Ok(())
}

fn cached_dispatch() -> Result<()> {
    let cache = ShapeCache::new();
    let root = PrngKey::new(42);
    let workers = 4;

    for rank in 0..workers {
        let key = derive_worker_key(root, rank, workers)?;
        let sample = Tensor::random_uniform(&[3], DType::Float64, key, 0.0, 1.0);
        let config: Vec<usize> = sample
            .as_real()
            .map(|a| a.iter().map(|&u| usize::from(u > 0.5)).collect())
            .unwrap_or_default();

        let f = HashablePartial::new("log_psi", log_psi).with_arg(config.clone());
        let primals = [
            Tree::leaf(Tensor::ones(&[3], DType::Float64)),
            Tree::leaf(Tensor::zeros(&[3], DType::Float64)),
        ];
        let res = vjp_cached(&cache, &f, &primals, VjpOptions::default().conjugated())?;
        println!(
            "  worker {} sample {:?}: log ψ = {:?}",
            rank,
            config,
            res.primals_out.as_leaf().and_then(Tensor::as_complex)
        );
    }

    let stats = cache.stats();
    println!("  probe cache: {} hits, {} misses", stats.hits, stats.misses);
    Ok(())
}
