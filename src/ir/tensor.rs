//! Tensor views: logical and allocation domains plus output aliasing

use serde::{Deserialize, Serialize};

use super::domain::{DomainId, TransformId};
use super::val::DataType;

/// Handle to a tensor view in the fusion arena
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TensorId(pub u32);

/// A tensor view
///
/// The logical domain is the user-visible iteration-space ordering; the
/// allocation domain, when present, is the memory layout and relates to
/// the logical domain through the view's split/merge transforms.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorView {
    /// Display name, e.g. `T0`
    pub name: String,
    /// Element type
    pub dtype: DataType,
    /// Logical domain
    pub logical: Vec<DomainId>,
    /// Allocation domain; `None` means identical to the logical domain
    pub allocation: Option<Vec<DomainId>>,
    /// Transforms relating the allocation domain to the logical domain,
    /// in topological order
    pub transforms: Vec<TransformId>,
    /// Host-evaluable definition, if the tensor can be derived without
    /// running the kernel
    pub definition: Option<TensorDef>,
}

impl TensorView {
    /// View whose memory layout is the logical domain itself
    #[must_use]
    pub fn contiguous(name: impl Into<String>, dtype: DataType, logical: Vec<DomainId>) -> Self {
        Self {
            name: name.into(),
            dtype,
            logical,
            allocation: None,
            transforms: Vec::new(),
            definition: None,
        }
    }

    /// Whether the view carries an explicit allocation domain
    #[must_use]
    pub fn has_allocation(&self) -> bool {
        self.allocation.is_some()
    }

    /// Allocation domain when set, logical domain otherwise
    #[must_use]
    pub fn maybe_allocation_domain(&self) -> &[DomainId] {
        self.allocation.as_deref().unwrap_or(&self.logical)
    }
}

/// Host-evaluable tensor definitions
///
/// Covers the alias-producing operations the launch engine must resolve
/// without a kernel (reshape-like outputs, pure-evaluation fusions).
#[derive(Debug, Clone, PartialEq)]
pub enum TensorDef {
    /// The tensor is a view over another tensor's storage; its own
    /// inferred sizes/strides describe the view
    ViewOf {
        /// Storage provider
        source: TensorId,
    },
}

/// How a fusion output obtains its storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Allocate fresh storage
    New,
    /// Write in place into the aliased input/output tensor
    ReuseBuffer,
    /// Derive the tensor through the expression evaluator
    Evaluate,
}

/// Aliasing declaration attached to a fusion output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputAlias {
    /// Allocation mode
    pub mode: AllocationMode,
    /// Aliased fusion input or output; required for `ReuseBuffer`,
    /// optional assertion target for `Evaluate`
    pub aliased_io: Option<TensorId>,
}

impl OutputAlias {
    /// Plain freshly-allocated output
    #[must_use]
    pub fn new_buffer() -> Self {
        Self { mode: AllocationMode::New, aliased_io: None }
    }

    /// In-place update of `target`
    #[must_use]
    pub fn reuse(target: TensorId) -> Self {
        Self { mode: AllocationMode::ReuseBuffer, aliased_io: Some(target) }
    }

    /// Evaluator-derived output, optionally asserted to alias `target`
    #[must_use]
    pub fn evaluate(target: Option<TensorId>) -> Self {
        Self { mode: AllocationMode::Evaluate, aliased_io: target }
    }
}
