//! # Lanzar
//!
//! GPU fusion executor runtime: takes a lowered kernel representation
//! of a fusion and turns it into an actual GPU launch producing output
//! tensors.
//!
//! Lanzar (Spanish: "to launch") sits between a fusion compiler and
//! the CUDA driver. It owns the hard runtime plumbing that has to stay
//! mutually consistent across repeated invocations with varying input
//! shapes:
//!
//! - **Shape inference**: symbolic extents resolved against concrete
//!   inputs, including the allocation-to-logical layout transform for
//!   tensors whose memory order differs from their logical order.
//! - **Shared-memory planning**: per-buffer offsets, the
//!   reduction/broadcast workspace, and static/dynamic budgets checked
//!   against the device limit.
//! - **Launch-parameter resolution**: parallel-dimension extents merged
//!   with explicit constraints into grid/block dimensions.
//! - **Buffer allocation**: outputs (fresh, aliased in place, or
//!   evaluator-derived views) and intermediates (zero-initialized from
//!   a shared pool, or raw with an optional NaN debug fill).
//! - **JIT compilation**: NVRTC compilation of the generated kernel
//!   text, recompiled only when a launch outgrows the block-size or
//!   register high-water marks.
//! - **Argument marshalling**: per-parameter byte buffers whose layout
//!   is fixed at compile time and whose pointer/shape/stride bytes are
//!   rewritten in place on shape changes.
//!
//! ## Example
//!
//! ```rust
//! use lanzar::args::{KernelArgumentHolder, TensorArg};
//! use lanzar::evaluator::EvalValue;
//! use lanzar::ir::{DataType, Fusion, FusionInput, FusionOutput, IterDomain, OutputAlias,
//!     TensorView};
//! use lanzar::executor::FusionExecutor;
//!
//! // A one-input, one-output fusion whose output mirrors the input
//! let mut fusion = Fusion::new();
//! let extent = fusion.named("i0");
//! let axis = fusion.domain(IterDomain::iteration(extent));
//! let t_in = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![axis]));
//! fusion.inputs.push(FusionInput::Tensor(t_in));
//! let t_out = fusion.tensor(TensorView::contiguous("T1", DataType::Float, vec![axis]));
//! fusion.outputs.push(FusionOutput { tensor: t_out, alias: OutputAlias::new_buffer() });
//!
//! // Dry-run shape inference needs no GPU
//! let arg = TensorArg {
//!     ptr: 0,
//!     sizes: vec![1024],
//!     strides: vec![1],
//!     dtype: DataType::Float,
//!     on_device: true,
//! };
//! let args = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(arg)]);
//! let outputs = FusionExecutor::infer_output_sizes(&fusion, &args).unwrap();
//! assert_eq!(outputs[0].sizes, vec![1024]);
//! ```
//!
//! ## CUDA feature
//!
//! The crate builds and its planning layers run without CUDA. Actual
//! compilation and launching require the `cuda` feature (backed by
//! `cudarc`); without it every driver entry point reports
//! [`error::LanzarError::Driver`].

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod allocate;
pub mod args;
pub mod compile;
pub mod driver;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod ir;
pub mod launch;
pub mod options;
pub mod pool;
pub mod rtc;
pub mod shape;
pub mod smem;
pub mod source;

// Re-exports for convenience
pub use error::{LanzarError, Result};
pub use executor::{ExecutorIds, FusionExecutor};
pub use launch::LaunchParams;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
