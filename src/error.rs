//! Error types for Lanzar
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Lanzar operations
pub type Result<T> = std::result::Result<T, LanzarError>;

/// Error type for all Lanzar operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LanzarError {
    /// A symbolic extent could not be evaluated
    #[error("Could not infer {symbol} for buffer {buffer}")]
    ShapeUnresolved {
        /// Printed form of the unresolved symbol
        symbol: String,
        /// Buffer whose shape needed the symbol
        buffer: String,
    },

    /// Allocation-to-logical transform produced an inconsistent frontier
    #[error("Rank mismatch while transforming {buffer}: {reason}")]
    RankMismatch {
        /// Buffer under transformation
        buffer: String,
        /// What went wrong
        reason: String,
    },

    /// The allocation domain contains a transform other than split or merge
    #[error("Unsupported transformation in allocation domain of {buffer}")]
    UnsupportedAllocTransform {
        /// Buffer under transformation
        buffer: String,
    },

    /// A kernel precondition evaluated to false
    #[error("{0}")]
    InvalidProgram(String),

    /// Argument width requires 64-bit indexing but 32-bit is demanded
    #[error("Index type conflict: {reason}")]
    IndexTypeConflict {
        /// Which constraints collided
        reason: String,
    },

    /// Target GPU capability is below the kernel minimum
    #[error(
        "Target compute capability is {actual_major}.{actual_minor} but this fusion requires at \
         least {required_major}.{required_minor}. Reason: {reason}"
    )]
    DeviceTooOld {
        /// Device major capability
        actual_major: u32,
        /// Device minor capability
        actual_minor: u32,
        /// Required major capability
        required_major: u32,
        /// Required minor capability
        required_minor: u32,
        /// Why the kernel needs the newer device
        reason: String,
    },

    /// Static plus dynamic shared memory exceeds the device limit
    #[error(
        "The total shared memory allocation is larger than available memory. Dynamic size: \
         {dynamic}. Static size: {static_size}. Required total size: {required}. Device limit \
         size: {limit}"
    )]
    SharedMemoryExceeded {
        /// Requested dynamic bytes
        dynamic: i64,
        /// Compiled static bytes
        static_size: i64,
        /// static + dynamic
        required: i64,
        /// Device limit in bytes
        limit: i64,
    },

    /// Local-memory allocations with non-constant sizes
    #[error(
        "Allocations must be based on constant integers for local memory. However, found: \
         {buffers:?} have dynamic allocations but are placed in local memory."
    )]
    DynamicLocalAllocation {
        /// Offending buffer names
        buffers: Vec<String>,
    },

    /// A cooperative launch would exceed resident-block capacity
    #[error(
        "Wanted to launch a cooperative kernel, however the number of blocks is greater than what \
         can be resident on the GPU at once. Need: {grid} but limited to {blocks_per_sm} * \
         {sm_count}"
    )]
    CooperativeTooLarge {
        /// Requested grid size
        grid: i64,
        /// Resident blocks per multiprocessor at the launch configuration
        blocks_per_sm: i64,
        /// Multiprocessor count
        sm_count: i64,
    },

    /// No NaN-fill sentinel is defined for the element type
    #[error("Unknown dtype for NaN fill: {dtype}")]
    UnknownDtype {
        /// Printed element type
        dtype: String,
    },

    /// CUDA driver or runtime failure (also raised when the `cuda`
    /// feature is disabled)
    #[error("Driver error: {0}")]
    Driver(String),

    /// NVRTC compilation failure
    #[error("Kernel compilation failed: {0}")]
    Compile(String),

    /// Persisted-state (de)serialization failure
    #[error("Serialization error: {0}")]
    Serde(String),

    /// The operation is outside what this executor supports
    #[error("Unsupported operation '{operation}': {reason}")]
    Unsupported {
        /// Operation name
        operation: String,
        /// Reason it is not supported
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LanzarError::ShapeUnresolved {
            symbol: "i7".to_string(),
            buffer: "T3".to_string(),
        };
        assert!(err.to_string().contains("i7"));
        assert!(err.to_string().contains("T3"));
    }

    #[test]
    fn test_error_equality() {
        let err1 = LanzarError::InvalidProgram("vectorization requires divisible extents".into());
        let err2 = LanzarError::InvalidProgram("vectorization requires divisible extents".into());
        assert_eq!(err1, err2);
    }

    #[test]
    fn test_smem_error_reports_budget() {
        let err = LanzarError::SharedMemoryExceeded {
            dynamic: 100_000,
            static_size: 4096,
            required: 104_096,
            limit: 101_376,
        };
        let msg = err.to_string();
        assert!(msg.contains("104096"));
        assert!(msg.contains("101376"));
    }
}
