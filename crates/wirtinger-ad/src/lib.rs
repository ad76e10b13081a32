//! # wirtinger-ad
//!
//! Complex-aware vector-Jacobian products.
//!
//! This crate provides:
//! - A recording tape with real pullbacks ([`tape`])
//! - A tracer lifting complex arithmetic onto real/imaginary tape pairs ([`trace`])
//! - The native pullback and its holomorphic convention ([`native`])
//! - Shape/dtype probing with an optional memo cache ([`shape`])
//! - Hashable partial application of traced functions ([`partial`])
//! - Domain dispatch between real→real, real→complex and complex→complex
//!   strategies ([`vjp`])
//! - Finite-difference verification of every route ([`gradcheck`])
//!
//! ## Quick Start
//!
//! ```
//! use wirtinger_ad::prelude::*;
//! use wirtinger_core::{DType, Tensor, Tree};
//!
//! // f(x) = sin(x) + i·x², real input, complex output
//! let f = traced_fn(|t, p| {
//!     let x = arg(p, 0)?;
//!     t.complex(&t.sin(x)?, &t.mul(x, x)?)
//! });
//!
//! let x = Tree::leaf(Tensor::from_vec(vec![0.0, 1.0], &[2])?);
//! let res = vjp(&f, &[x], VjpOptions::default())?;
//! assert_eq!(res.pullback.domain(), Domain::RealComplex);
//!
//! let grads = res.pullback.vjp(&Tree::leaf(Tensor::ones(&[2], DType::Complex128)))?;
//! assert_eq!(grads.len(), 1);
//! # Ok::<(), wirtinger_core::WirtingerError>(())
//! ```

#![deny(warnings)]

pub mod gradcheck;
pub mod native;
pub mod partial;
pub mod shape;
pub mod tape;
pub mod trace;
pub mod vjp;

pub use native::{evaluate, native_vjp, NativePullback, NativeVjp};
pub use partial::{BoundArg, HashablePartial, PartialKey};
pub use shape::{eval_shape, CacheStats, ShapeCache};
pub use trace::{arg, traced_fn, FnOutput, Traced, TracedFn, Tracer};
pub use vjp::*;

/// Items most callers need
pub mod prelude {
    pub use crate::partial::{HashablePartial, PartialKey};
    pub use crate::shape::{eval_shape, ShapeCache};
    pub use crate::trace::{arg, traced_fn, FnOutput, Traced, TracedFn, Tracer};
    pub use crate::vjp::{
        value_and_grad, vjp, vjp_cached, vjp_cc, vjp_rc, vjp_rr, Domain, Pullback, VjpOp,
        VjpOptions, VjpResult,
    };
}
