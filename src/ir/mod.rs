//! Read-only IR consumed by the executor
//!
//! The executor does not build or rewrite fusions; lowering happens
//! upstream and hands over a [`LoweredKernel`]: an arena of scalar
//! expressions, iteration domains, domain transforms and tensor views,
//! together with the kernel summary and the generated kernel body.
//!
//! Ownership is arena-style: the executor owns the lowered kernel, and
//! evaluators or executor entries refer into it with plain index ids
//! whose lifetimes are bounded by the executor instance.

mod domain;
mod kernel;
mod tensor;
mod val;

pub use domain::{DomainId, DomainTransform, IterDomain, IterType, ParallelType, TransformId};
pub use kernel::{
    Fusion, FusionInput, FusionOutput, GlobalAllocation, KernelParam, KernelSummary,
    LoweredKernel, SmemAllocation,
};
pub use tensor::{AllocationMode, OutputAlias, TensorDef, TensorId, TensorView};
pub use val::{BinaryOp, DataType, IndexType, ScalarExpr, ScalarId, UnaryOp};
