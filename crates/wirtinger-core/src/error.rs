//! Error taxonomy shared by every Wirtinger crate
//!
//! All fallible operations return [`Result`], whose error type is
//! [`WirtingerError`]. None of these errors are transient: they signal a
//! programming error or an unsupported configuration, so callers propagate
//! them with `?` instead of retrying.
//!
//! # Examples
//!
//! ```
//! use wirtinger_core::{DType, WirtingerError};
//!
//! let err = DType::Int64.to_complex().unwrap_err();
//! assert!(matches!(err, WirtingerError::UnknownDtype(DType::Int64)));
//! ```

use crate::dtype::DType;
use crate::tree::Reality;
use thiserror::Error;

/// Top-level error type for pytree, engine and VJP operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WirtingerError {
    /// Complex inputs with real outputs: no recombination rule exists
    #[error("{domain} -> {codomain} functions are not supported by the VJP dispatcher")]
    UnsupportedDomainCodomain { domain: Reality, codomain: Reality },

    /// The output shape or dtype of a function could not be determined
    /// without evaluating it
    #[error("Shape inference failed: {0}")]
    ShapeInference(String),

    /// Two pytrees that must match leaf-by-leaf do not
    #[error("Structure mismatch: {0}")]
    StructureMismatch(String),

    /// A dtype has no complex counterpart
    #[error("Unknown complex type for {0}")]
    UnknownDtype(DType),

    /// A cotangent or operand has the wrong element type for an operation
    #[error("Dtype mismatch: {0}")]
    DtypeMismatch(String),

    /// The engine was asked to do something it cannot do
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// An argument is out of its valid range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, WirtingerError>;
