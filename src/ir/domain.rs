//! Iteration domains and the affine transforms between them

use super::val::ScalarId;

/// Handle to an iteration domain in the fusion arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

/// Handle to a domain transform in the fusion arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransformId(pub u32);

/// Parallelization of an iteration domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParallelType {
    /// Not parallelized
    Serial,
    /// Grid x
    BIDx,
    /// Grid y
    BIDy,
    /// Grid z
    BIDz,
    /// Block x
    TIDx,
    /// Block y
    TIDy,
    /// Block z
    TIDz,
    /// Device dimension (one rank of a multi-device mesh)
    DIDx,
}

impl ParallelType {
    /// Thread dimensions contribute to the block shape
    #[must_use]
    pub fn is_thread_dim(self) -> bool {
        matches!(self, ParallelType::TIDx | ParallelType::TIDy | ParallelType::TIDz)
    }

    /// Block dimensions contribute to the grid shape
    #[must_use]
    pub fn is_block_dim(self) -> bool {
        matches!(self, ParallelType::BIDx | ParallelType::BIDy | ParallelType::BIDz)
    }

    /// All launch-relevant parallel types, grid first
    #[must_use]
    pub fn launch_types() -> [ParallelType; 6] {
        [
            ParallelType::BIDx,
            ParallelType::BIDy,
            ParallelType::BIDz,
            ParallelType::TIDx,
            ParallelType::TIDy,
            ParallelType::TIDz,
        ]
    }
}

impl std::fmt::Display for ParallelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParallelType::Serial => "serial",
            ParallelType::BIDx => "gridDim.x",
            ParallelType::BIDy => "gridDim.y",
            ParallelType::BIDz => "gridDim.z",
            ParallelType::TIDx => "blockDim.x",
            ParallelType::TIDy => "blockDim.y",
            ParallelType::TIDz => "blockDim.z",
            ParallelType::DIDx => "deviceIdx.x",
        };
        write!(f, "{name}")
    }
}

/// Kind of an iteration domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterType {
    /// Ordinary data dimension
    Iteration,
    /// Reduced away by the kernel; absent from produced tensors
    Reduction,
    /// Broadcast dimension, possibly expanded
    Broadcast,
    /// Stride-only bookkeeping dimension; never materialized
    Stride,
}

/// One axis of a tensor domain
#[derive(Debug, Clone, PartialEq)]
pub struct IterDomain {
    /// Symbolic extent
    pub extent: ScalarId,
    /// Expanded extent; only meaningful for broadcast domains
    pub expanded_extent: Option<ScalarId>,
    /// Domain kind
    pub iter_type: IterType,
    /// Parallelization
    pub parallel: ParallelType,
}

impl IterDomain {
    /// Plain serial iteration domain
    #[must_use]
    pub fn iteration(extent: ScalarId) -> Self {
        Self {
            extent,
            expanded_extent: None,
            iter_type: IterType::Iteration,
            parallel: ParallelType::Serial,
        }
    }

    /// Whether this domain is reduced away
    #[must_use]
    pub fn is_reduction(&self) -> bool {
        self.iter_type == IterType::Reduction
    }

    /// Whether this domain is a broadcast
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.iter_type == IterType::Broadcast
    }

    /// Whether this domain is stride-only bookkeeping
    #[must_use]
    pub fn is_stride(&self) -> bool {
        self.iter_type == IterType::Stride
    }

    /// Whether this domain spans device ranks rather than data
    #[must_use]
    pub fn is_device_dim(&self) -> bool {
        self.parallel == ParallelType::DIDx
    }

    /// Whether the broadcast carries an expanded extent
    #[must_use]
    pub fn has_expanded_extent(&self) -> bool {
        self.expanded_extent.is_some()
    }

    /// Expanded extent when present, plain extent otherwise
    #[must_use]
    pub fn maybe_expanded_extent(&self) -> ScalarId {
        self.expanded_extent.unwrap_or(self.extent)
    }
}

/// An affine transform relating iteration domains
///
/// Split and merge are the only transforms the allocation-to-logical
/// walk understands; anything else in an allocation domain is rejected
/// with `UnsupportedAllocTransform`.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainTransform {
    /// `input -> (outer, inner)` where `inner` has extent `factor`
    Split {
        /// Source domain
        input: DomainId,
        /// Outer result domain
        outer: DomainId,
        /// Inner result domain (extent = factor)
        inner: DomainId,
        /// Split factor
        factor: ScalarId,
    },
    /// `(outer, inner) -> output`
    Merge {
        /// Outer source domain
        outer: DomainId,
        /// Inner source domain
        inner: DomainId,
        /// Merged result domain
        output: DomainId,
    },
    /// A transform the executor cannot traverse (resize, swizzle, ...).
    /// Lowering may attach these; the allocation-to-logical walk rejects
    /// them.
    Opaque {
        /// Transform kind for diagnostics
        name: String,
        /// Source-side domains
        inputs: Vec<DomainId>,
        /// Result-side domains
        outputs: Vec<DomainId>,
    },
}

impl DomainTransform {
    /// Source-side domains
    #[must_use]
    pub fn inputs(&self) -> Vec<DomainId> {
        match self {
            DomainTransform::Split { input, .. } => vec![*input],
            DomainTransform::Merge { outer, inner, .. } => vec![*outer, *inner],
            DomainTransform::Opaque { inputs, .. } => inputs.clone(),
        }
    }

    /// Result-side domains
    #[must_use]
    pub fn outputs(&self) -> Vec<DomainId> {
        match self {
            DomainTransform::Split { outer, inner, .. } => vec![*outer, *inner],
            DomainTransform::Merge { output, .. } => vec![*output],
            DomainTransform::Opaque { outputs, .. } => outputs.clone(),
        }
    }
}
