//! Error types for fusor

use crate::dtype::DType;
use thiserror::Error;

/// Result type alias using fusor's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building a compound kernel
#[derive(Error, Debug)]
pub enum Error {
    /// Two reduction ops in one fused sequence declare different axes
    #[error("Conflicting reduction axes in fused sequence: axis {first} vs axis {second}")]
    ConflictingReductionAxes {
        /// Axis declared by the first reduction encountered
        first: usize,
        /// Axis declared by a later reduction
        second: usize,
    },

    /// Unsupported dtype for kernel generation
    #[error("Unsupported dtype {dtype:?} for operation '{op}'")]
    UnsupportedDType {
        /// The unsupported dtype
        dtype: DType,
        /// The operation name
        op: &'static str,
    },

    /// Op sequence dependencies do not form a DAG
    #[error("Cyclic dependency detected at op index {index}")]
    CyclicDependency {
        /// Index of the op at which the cycle was detected
        index: usize,
    },

    /// Internal invariant violation - indicates a bug in fusor, not bad input
    #[error("Internal error: {0}")]
    Internal(String),

    /// Backend-specific error (device compiler, driver)
    #[error("Backend error: {0}")]
    Backend(String),
}
