//! # Wirtinger - Complex-Aware VJPs for Variational Monte Carlo
//!
//! Gradients of expectation values with respect to variational parameters
//! must be right whether the parameters and the log-amplitude are real or
//! complex. This is the **meta crate** that re-exports the Wirtinger
//! components for convenient access.
//!
//! ## Quick Start
//!
//! ```
//! use wirtinger::prelude::*;
//! use scirs2_core::numeric::Complex64;
//!
//! // log ψ(θ) = θ + i·θ² for a real parameter θ
//! let log_psi = traced_fn(|t, p| {
//!     let theta = arg(p, 0)?;
//!     t.complex(theta, &t.mul(theta, theta)?)
//! });
//!
//! let theta = Tree::leaf(Tensor::scalar(0.5));
//! let res = vjp(&log_psi, &[theta], VjpOptions::default().conjugated())?;
//! assert_eq!(res.pullback.domain(), Domain::RealComplex);
//!
//! let grad = res.pullback.vjp(&Tree::leaf(Tensor::complex_scalar(Complex64::new(1.0, 0.0))))?;
//! let expected = Tree::leaf(Tensor::complex_scalar(Complex64::new(1.0, -1.0)));
//! assert!(grad[0].allclose(&expected, 0.0, 1e-12));
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Components
//!
//! ### Core Types ([`core`])
//!
//! Tensors with nominal dtypes, pytrees, reality classification, PRNG keys.
//!
//! ```
//! use wirtinger::core::{DType, Reality, Tensor, Tree};
//!
//! let tree = Tree::tuple([
//!     Tree::leaf(Tensor::ones(&[3], DType::Float32)),
//!     Tree::leaf(Tensor::zeros(&[2, 2], DType::Complex64)),
//! ]);
//! assert_eq!(Reality::of(&tree), Reality::Complex);
//! assert_eq!(tree.size(), 7);
//! ```
//!
//! ### Differentiation ([`ad`])
//!
//! The tape engine, the complex tracer, the shape prober, the three VJP
//! strategies and their dispatcher, hashable partials and gradient
//! checking.
//!
//! ```
//! use wirtinger::ad::{eval_shape, traced_fn, arg};
//! use wirtinger::core::{DType, ShapeDtype, Tree};
//!
//! let f = traced_fn(|t, p| t.abs2(arg(p, 0)?));
//! let out = eval_shape(&f, &[Tree::leaf(ShapeDtype::new(&[4], DType::Complex128))], false)?;
//! assert_eq!(out, Tree::leaf(ShapeDtype::new(&[4], DType::Float64)));
//! # Ok::<(), wirtinger::core::WirtingerError>(())
//! ```

#![deny(warnings)]

// Re-export all components
pub use wirtinger_ad as ad;
pub use wirtinger_core as core;

pub mod prelude {
    //! Prelude module for convenient imports
    //!
    //! # Example
    //!
    //! ```
    //! use wirtinger::prelude::*;
    //!
    //! let x = Tree::leaf(Tensor::ones(&[2], DType::Float64));
    //! assert_eq!(Reality::of(&x), Reality::Real);
    //! ```

    // Core types
    pub use crate::core::{
        derive_worker_key, DType, PrngKey, Reality, ShapeDtype, Tensor, Tree, WirtingerError,
    };

    // Differentiation
    pub use crate::ad::prelude::*;
}
