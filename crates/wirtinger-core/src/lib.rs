//! # wirtinger-core
//!
//! Core data types for complex-aware reverse-mode differentiation.
//!
//! This crate provides the values that flow through a vector-Jacobian
//! product:
//!
//! - **Element types** ([`DType`]) with complex/real counterparts and promotion
//! - **Tensor leaves** ([`Tensor`]) backed by real or complex arrays
//! - **Pytrees** ([`Tree`], [`TreeDef`]) preserving nesting through every transformation
//! - **Reality classification** ([`Reality`]) of whole trees
//! - **Reproducible keys** ([`PrngKey`], [`derive_worker_key`])
//! - **Errors** ([`WirtingerError`]) shared by the whole workspace
//!
//! ## SciRS2 Integration
//!
//! Arrays, complex numbers and random generators all come from
//! `scirs2-core` (`ndarray_ext`, `numeric`, `random`).
//!
//! ## Quick Start
//!
//! ```
//! use wirtinger_core::{DType, Reality, Tensor, Tree};
//!
//! let real = Tree::leaf(Tensor::ones(&[4], DType::Float64));
//! let complex = Tree::list([real.clone(), Tree::leaf(Tensor::zeros(&[2], DType::Complex64))]);
//!
//! assert_eq!(Reality::of(&real), Reality::Real);
//! assert_eq!(Reality::of(&complex), Reality::Complex);
//! ```

#![deny(warnings)]

pub mod dtype;
pub mod error;
pub mod random;
pub mod tensor;
pub mod tree;


pub use dtype::{maybe_promote_to_complex, DType};
pub use error::{Result, WirtingerError};
pub use random::{derive_worker_key, PrngKey};
pub use tensor::{ShapeDtype, Tensor, TensorData};
pub use tree::{primals_are_complex, HasDType, Reality, Tree, TreeDef};
