//! Integration tests for wirtinger-core
//!
//! These tests exercise pytrees, dtypes and keys together, the way the
//! VJP layer combines them.

use anyhow::Result;
use scirs2_core::numeric::Complex64;
use wirtinger_core::{
    derive_worker_key, maybe_promote_to_complex, primals_are_complex, DType, PrngKey, Reality,
    ShapeDtype, Tensor, Tree, WirtingerError,
};

fn params() -> Result<Tree<Tensor>> {
    Ok(Tree::dict([
        (
            "dense",
            Tree::tuple([
                Tree::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2])?),
                Tree::leaf(Tensor::from_vec(vec![0.5, -0.5], &[2])?),
            ]),
        ),
        ("scale", Tree::leaf(Tensor::scalar(2.0))),
    ]))
}

#[test]
fn test_tree_reality_and_sizes() -> Result<()> {
    let real = params()?;
    assert_eq!(real.num_leaves(), 3);
    assert_eq!(real.size(), 7);
    assert_eq!(Reality::of(&real), Reality::Real);

    let complex = real.map(|t| t.astype(DType::Complex64));
    assert_eq!(complex.structure(), real.structure());
    assert_eq!(Reality::of(&complex), Reality::Complex);
    assert!(primals_are_complex(&[real.clone(), complex]));
    assert!(!primals_are_complex(&[real]));

    let empty: Tree<Tensor> = Tree::list([]);
    assert_eq!(Reality::of(&empty), Reality::Real);
    assert_eq!(empty.size(), 0);
    Ok(())
}

#[test]
fn test_shape_dtypes_mirror_leaves() -> Result<()> {
    let avals = params()?.shape_dtypes();
    assert_eq!(
        avals.leaves(),
        vec![
            &ShapeDtype::new(&[2, 2], DType::Float64),
            &ShapeDtype::new(&[2], DType::Float64),
            &ShapeDtype::new(&[], DType::Float64),
        ]
    );
    let ones = avals.ones();
    assert_eq!(ones.structure(), avals.structure());
    assert!(ones.leaves().iter().all(|t| t
        .as_real()
        .map(|a| a.iter().all(|&v| v == 1.0))
        .unwrap_or(false)));
    Ok(())
}

#[test]
fn test_zip_map_requires_identical_structure() -> Result<()> {
    let a = params()?;
    let b = a.scale(3.0);
    let sum = a.add(&b)?;
    assert!(sum.allclose(&a.scale(4.0), 0.0, 1e-12));

    let other = Tree::list([Tree::leaf(Tensor::scalar(1.0))]);
    assert!(matches!(
        a.add(&other),
        Err(WirtingerError::StructureMismatch(_))
    ));

    let reshaped = a.map(|t| Tensor::zeros(&[t.size()], t.dtype()));
    assert!(matches!(
        a.check_matches(&reshaped),
        Err(WirtingerError::StructureMismatch(_))
    ));
    Ok(())
}

#[test]
fn test_parts_and_conjugation() -> Result<()> {
    let z = Tree::leaf(Tensor::from_complex_vec(
        vec![Complex64::new(1.0, 2.0), Complex64::new(-3.0, 0.5)],
        &[2],
    )?);
    let re = z.real_part();
    let im = z.imag_part();
    assert_eq!(re.as_leaf().map(Tensor::dtype), Some(DType::Float64));

    assert!(Tree::from_parts(&re, &im, 1.0)?.allclose(&z, 0.0, 0.0));
    assert!(Tree::from_parts(&re, &im, -1.0)?.allclose(&z.conj(), 0.0, 0.0));
    assert!(z.neg().add(&z)?.allclose(&z.scale(0.0), 0.0, 0.0));
    Ok(())
}

#[test]
fn test_dtype_promotion_rules() -> Result<()> {
    assert_eq!(DType::Float32.to_complex()?, DType::Complex64);
    assert_eq!(DType::Float64.to_complex()?, DType::Complex128);
    assert_eq!(DType::Complex64.to_complex()?, DType::Complex64);
    assert!(matches!(
        DType::Int32.to_complex(),
        Err(WirtingerError::UnknownDtype(DType::Int32))
    ));

    assert_eq!(
        maybe_promote_to_complex(DType::Float32, &[DType::Complex128])?,
        DType::Complex64
    );
    assert_eq!(
        maybe_promote_to_complex(DType::Float64, &[DType::Float32])?,
        DType::Float64
    );
    assert_eq!(DType::Int64.gradient_dtype(), DType::Float64);
    assert_eq!(DType::Float32.gradient_dtype(), DType::Float32);
    Ok(())
}

#[test]
fn test_single_precision_rounding() {
    let t = Tensor::scalar(0.1).astype(DType::Float32);
    assert_eq!(t.dtype(), DType::Float32);
    let x = t.as_real().map(|a| a.sum()).unwrap_or(0.0);
    assert_eq!(x, 0.1_f32 as f64);
}

#[test]
fn test_worker_keys() -> Result<()> {
    let root = PrngKey::new(7);
    let keys = (0..8)
        .map(|rank| derive_worker_key(root, rank, 8))
        .collect::<wirtinger_core::Result<Vec<_>>>()?;
    for (i, a) in keys.iter().enumerate() {
        for b in &keys[i + 1..] {
            assert_ne!(a, b);
        }
    }
    assert_eq!(keys, root.split(8));
    assert!(matches!(
        derive_worker_key(root, 8, 8),
        Err(WirtingerError::InvalidArgument(_))
    ));

    let a = Tensor::random_uniform(&[16], DType::Complex128, keys[0], -1.0, 1.0);
    let b = Tensor::random_uniform(&[16], DType::Complex128, keys[0], -1.0, 1.0);
    assert_eq!(a, b);
    Ok(())
}
