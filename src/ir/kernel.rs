//! The fusion arena and the lowered kernel handed to the executor

use std::collections::{BTreeMap, HashSet};

use super::domain::{DomainId, DomainTransform, IterDomain, ParallelType, TransformId};
use super::tensor::{OutputAlias, TensorId, TensorView};
use super::val::{BinaryOp, DataType, ScalarExpr, ScalarId, UnaryOp};

/// A fusion input value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionInput {
    /// Tensor input
    Tensor(TensorId),
    /// Scalar input
    Scalar(ScalarId),
}

/// A fusion output with its aliasing declaration
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutput {
    /// The produced tensor
    pub tensor: TensorId,
    /// How its storage is obtained
    pub alias: OutputAlias,
}

/// Arena holding the expression graph of one fusion
///
/// All nodes live in flat vectors and are addressed by index ids, so the
/// executor can own the graph while entries and evaluators hold plain
/// copies of ids.
#[derive(Debug, Default, Clone)]
pub struct Fusion {
    scalars: Vec<ScalarExpr>,
    domains: Vec<IterDomain>,
    transforms: Vec<DomainTransform>,
    tensors: Vec<TensorView>,
    /// Fusion inputs in argument order
    pub inputs: Vec<FusionInput>,
    /// Fusion outputs in declaration order
    pub outputs: Vec<FusionOutput>,
}

impl Fusion {
    /// Empty fusion
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push_scalar(&mut self, expr: ScalarExpr) -> ScalarId {
        let id = ScalarId(u32::try_from(self.scalars.len()).expect("arena overflow"));
        self.scalars.push(expr);
        id
    }

    /// Add an integer constant
    pub fn constant(&mut self, value: i64) -> ScalarId {
        self.push_scalar(ScalarExpr::Constant(value))
    }

    /// Add a named symbolic input
    pub fn named(&mut self, name: impl Into<String>) -> ScalarId {
        self.push_scalar(ScalarExpr::Input { name: name.into() })
    }

    /// Add a reference to a parallel-dimension extent
    pub fn parallel_extent(&mut self, parallel: ParallelType) -> ScalarId {
        self.push_scalar(ScalarExpr::Parallel(parallel))
    }

    /// Add a unary expression
    pub fn unary(&mut self, op: UnaryOp, a: ScalarId) -> ScalarId {
        self.push_scalar(ScalarExpr::Unary { op, a })
    }

    /// Add a binary expression
    pub fn binary(&mut self, op: BinaryOp, a: ScalarId, b: ScalarId) -> ScalarId {
        self.push_scalar(ScalarExpr::Binary { op, a, b })
    }

    /// Add an iteration domain
    pub fn domain(&mut self, domain: IterDomain) -> DomainId {
        let id = DomainId(u32::try_from(self.domains.len()).expect("arena overflow"));
        self.domains.push(domain);
        id
    }

    /// Add a split transform; returns `(transform, outer, inner)`
    pub fn split(
        &mut self,
        input: DomainId,
        factor: ScalarId,
        outer_extent: ScalarId,
    ) -> (TransformId, DomainId, DomainId) {
        let outer = self.domain(IterDomain::iteration(outer_extent));
        let inner = self.domain(IterDomain::iteration(factor));
        let id = self.push_transform(DomainTransform::Split { input, outer, inner, factor });
        (id, outer, inner)
    }

    /// Add a merge transform; returns `(transform, output)`
    pub fn merge(
        &mut self,
        outer: DomainId,
        inner: DomainId,
        merged_extent: ScalarId,
    ) -> (TransformId, DomainId) {
        let output = self.domain(IterDomain::iteration(merged_extent));
        let id = self.push_transform(DomainTransform::Merge { outer, inner, output });
        (id, output)
    }

    /// Add a transform the executor cannot traverse (resize, swizzle, ...)
    pub fn opaque_transform(
        &mut self,
        name: impl Into<String>,
        inputs: Vec<DomainId>,
        outputs: Vec<DomainId>,
    ) -> TransformId {
        self.push_transform(DomainTransform::Opaque { name: name.into(), inputs, outputs })
    }

    fn push_transform(&mut self, transform: DomainTransform) -> TransformId {
        let id = TransformId(u32::try_from(self.transforms.len()).expect("arena overflow"));
        self.transforms.push(transform);
        id
    }

    /// Add a tensor view
    pub fn tensor(&mut self, view: TensorView) -> TensorId {
        let id = TensorId(u32::try_from(self.tensors.len()).expect("arena overflow"));
        self.tensors.push(view);
        id
    }

    /// Scalar node accessor
    #[must_use]
    pub fn scalar(&self, id: ScalarId) -> &ScalarExpr {
        &self.scalars[id.0 as usize]
    }

    /// Domain accessor
    #[must_use]
    pub fn iter_domain(&self, id: DomainId) -> &IterDomain {
        &self.domains[id.0 as usize]
    }

    /// Transform accessor
    #[must_use]
    pub fn transform(&self, id: TransformId) -> &DomainTransform {
        &self.transforms[id.0 as usize]
    }

    /// Tensor accessor
    #[must_use]
    pub fn tensor_view(&self, id: TensorId) -> &TensorView {
        &self.tensors[id.0 as usize]
    }

    /// Number of tensors in the arena
    #[must_use]
    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Printable form of a scalar expression, for diagnostics
    #[must_use]
    pub fn scalar_to_string(&self, id: ScalarId) -> String {
        match self.scalar(id) {
            ScalarExpr::Constant(v) => v.to_string(),
            ScalarExpr::Input { name } => name.clone(),
            ScalarExpr::Parallel(p) => p.to_string(),
            ScalarExpr::Unary { op, a } => {
                let sym = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                };
                format!("{sym}{}", self.scalar_to_string(*a))
            }
            ScalarExpr::Binary { op, a, b } => {
                let sym = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::CeilDiv => "ceilDiv",
                    BinaryOp::Mod => "%",
                    BinaryOp::Min => "min",
                    BinaryOp::Max => "max",
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                };
                format!("({} {sym} {})", self.scalar_to_string(*a), self.scalar_to_string(*b))
            }
        }
    }

    /// Whether `root` transitively reads any scalar in `targets`
    #[must_use]
    pub fn scalar_depends_on(&self, root: ScalarId, targets: &HashSet<ScalarId>) -> bool {
        if targets.contains(&root) {
            return true;
        }
        match self.scalar(root) {
            ScalarExpr::Constant(_) | ScalarExpr::Input { .. } | ScalarExpr::Parallel(_) => false,
            ScalarExpr::Unary { a, .. } => self.scalar_depends_on(*a, targets),
            ScalarExpr::Binary { a, b, .. } => {
                self.scalar_depends_on(*a, targets) || self.scalar_depends_on(*b, targets)
            }
        }
    }

    /// Transforms of `tv` lying on a path from `from` to `to`, in
    /// topological order.
    ///
    /// Domains reachable forward from `from` are intersected with
    /// domains reaching backward into `to`; a transform is kept when it
    /// touches both sides. Transforms are stored in definition order,
    /// which is topological by construction.
    #[must_use]
    pub fn transforms_between(
        &self,
        tv: &TensorView,
        from: &[DomainId],
        to: &[DomainId],
    ) -> Vec<TransformId> {
        let ordered: Vec<TransformId> = tv
            .transforms
            .iter()
            .copied()
            .collect();

        // Descendants of `from`
        let mut descendants: HashSet<DomainId> = from.iter().copied().collect();
        for &tid in &ordered {
            let t = self.transform(tid);
            if t.inputs().iter().any(|d| descendants.contains(d)) {
                descendants.extend(t.outputs());
            }
        }

        // Ancestors of `to`
        let mut ancestors: HashSet<DomainId> = to.iter().copied().collect();
        for &tid in ordered.iter().rev() {
            let t = self.transform(tid);
            if t.outputs().iter().any(|d| ancestors.contains(d)) {
                ancestors.extend(t.inputs());
            }
        }

        ordered
            .into_iter()
            .filter(|&tid| {
                let t = self.transform(tid);
                t.inputs().iter().any(|d| descendants.contains(d))
                    && t.outputs().iter().any(|d| ancestors.contains(d))
            })
            .collect()
    }

    /// Logical domain of `tv` with reduction and stride axes removed
    #[must_use]
    pub fn no_reduction_logical(&self, tv: &TensorView) -> Vec<DomainId> {
        tv.logical
            .iter()
            .copied()
            .filter(|&d| {
                let id = self.iter_domain(d);
                !id.is_reduction() && !id.is_stride()
            })
            .collect()
    }

    /// Allocation domain of `tv` with reduction and stride axes removed
    #[must_use]
    pub fn no_reduction_allocation(&self, tv: &TensorView) -> Vec<DomainId> {
        tv.maybe_allocation_domain()
            .iter()
            .copied()
            .filter(|&d| {
                let id = self.iter_domain(d);
                !id.is_reduction() && !id.is_stride()
            })
            .collect()
    }
}

/// One global-memory allocation from the kernel summary
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalAllocation {
    /// Backing tensor
    pub tensor: TensorId,
    /// Allocation shape attached during lowering (source of truth for
    /// intermediates)
    pub shape: Vec<ScalarId>,
    /// Must be zero before the kernel runs
    pub zero_init: bool,
    /// The kernel guarantees the buffer is zero again on completion
    pub resets_to_zero: bool,
    /// Holds kernel-profile counters
    pub is_profile_buffer: bool,
}

/// One shared-memory allocation from the kernel summary
#[derive(Debug, Clone, PartialEq)]
pub struct SmemAllocation {
    /// Buffer name for diagnostics
    pub buffer_name: String,
    /// Element type
    pub dtype: DataType,
    /// Byte address within the shared-memory segment; must be set for
    /// non-aliased buffers
    pub address: Option<ScalarId>,
    /// Element count
    pub size: ScalarId,
    /// Index of the allocation this one aliases, if any
    pub alias_of: Option<usize>,
}

/// One kernel parameter, in signature order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelParam {
    /// Fusion input by position
    Input(usize),
    /// Fusion output by position
    Output(usize),
    /// Intermediate global buffer by position in
    /// `KernelSummary::global_allocations`
    GlobalBuffer(usize),
    /// Extra scalar parameter
    Scalar(ScalarId),
}

/// Compile-time facts about the lowered kernel
#[derive(Debug, Clone, Default)]
pub struct KernelSummary {
    /// Global buffers the kernel reads/writes beyond fusion I/O
    pub global_allocations: Vec<GlobalAllocation>,
    /// Statically placed shared-memory buffers
    pub static_smem_allocations: Vec<SmemAllocation>,
    /// Dynamically placed shared-memory buffers
    pub dynamic_smem_allocations: Vec<SmemAllocation>,
    /// Simplified extent per parallel type
    pub parallel_dimension_map: BTreeMap<ParallelType, ScalarId>,
    /// Iteration domains bound to parallel types, used to reconcile
    /// launch constraints
    pub parallel_bindings: Vec<DomainId>,
    /// Block reductions present
    pub has_block_reductions: bool,
    /// Grid reductions present
    pub has_grid_reductions: bool,
    /// Block broadcasts present
    pub has_block_broadcasts: bool,
    /// Grid broadcasts present
    pub has_grid_broadcasts: bool,
    /// Block welford present
    pub has_block_welford: bool,
    /// Grid welford present
    pub has_grid_welford: bool,
    /// Iteration-grouped reductions present
    pub has_iter_grouped_reductions: bool,
    /// Grouped-iteration factor for the reduction workspace
    pub num_grouped_iterations: i64,
    /// Outer-grouped grid welford present
    pub has_outer_grouped_grid_welford: bool,
    /// Workspace floor for outer-grouped grid welford, in bytes
    pub outer_grouped_grid_welford_largest_smem_size: i64,
    /// Widest type staged through shared memory
    pub largest_smem_data_type: Option<DataType>,
    /// Kernel uses cooperative grid synchronization
    pub has_cooperative_grid_reduction: bool,
    /// Kernel contains cp.async.bulk (TMA) expressions
    pub has_cp_async_bulk: bool,
    /// Kernel contains dynamically-sized local-memory allocations
    pub has_dynamic_local_memory_allocations: bool,
    /// Names of the dynamically-sized local buffers
    pub dynamic_lmem_buffer_names: Vec<String>,
    /// Minimum device capability
    pub min_device_version: (u32, u32),
    /// Why the minimum capability is required
    pub min_device_version_reason: String,
    /// Boolean preconditions with their failure messages
    pub validations: Vec<(ScalarId, String)>,
    /// Every output is host-evaluable; no kernel launch is needed
    pub is_expression_evaluated: bool,
    /// The kernel body contains no top-level expressions
    pub is_empty_kernel: bool,
    /// Every expression is a resharding communication; execution is
    /// delegated to the collective fallback
    pub is_communication_only: bool,
}

impl KernelSummary {
    /// Whether any reduction/broadcast needs a shared workspace
    #[must_use]
    pub fn has_workspace(&self) -> bool {
        self.has_block_reductions
            || self.has_grid_reductions
            || self.has_block_broadcasts
            || self.has_grid_broadcasts
    }
}

/// The lowered kernel the executor runs
///
/// Produced by lowering and code generation upstream; consumed
/// read-only here.
#[derive(Debug, Clone)]
pub struct LoweredKernel {
    /// Expression graph
    pub fusion: Fusion,
    /// Compile-time summary
    pub summary: KernelSummary,
    /// Kernel parameters in signature order
    pub parameters: Vec<KernelParam>,
    /// Generated kernel body text
    pub kernel_body: String,
    /// Entry-point name emitted by code generation
    pub kernel_name: String,
    /// Index type chosen during lowering
    pub index_type: super::val::IndexType,
}

impl LoweredKernel {
    /// Default parameter order: inputs, then outputs, then intermediate
    /// global buffers.
    #[must_use]
    pub fn default_parameters(fusion: &Fusion, summary: &KernelSummary) -> Vec<KernelParam> {
        let mut params = Vec::new();
        for i in 0..fusion.inputs.len() {
            params.push(KernelParam::Input(i));
        }
        for i in 0..fusion.outputs.len() {
            params.push(KernelParam::Output(i));
        }
        for i in 0..summary.global_allocations.len() {
            params.push(KernelParam::GlobalBuffer(i));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IterDomain;

    #[test]
    fn test_scalar_printing() {
        let mut fusion = Fusion::new();
        let a = fusion.named("i0");
        let b = fusion.constant(4);
        let c = fusion.binary(BinaryOp::Mul, a, b);
        assert_eq!(fusion.scalar_to_string(c), "(i0 * 4)");
    }

    #[test]
    fn test_scalar_dependency_walk() {
        let mut fusion = Fusion::new();
        let a = fusion.named("i0");
        let b = fusion.named("s0");
        let c = fusion.binary(BinaryOp::Add, a, b);
        let d = fusion.constant(1);

        let mut targets = HashSet::new();
        targets.insert(b);
        assert!(fusion.scalar_depends_on(c, &targets));
        assert!(!fusion.scalar_depends_on(a, &targets));
        assert!(!fusion.scalar_depends_on(d, &targets));
    }

    #[test]
    fn test_transforms_between_filters_unrelated() {
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let e1 = fusion.named("i1");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let d1 = fusion.domain(IterDomain::iteration(e1));
        let merged_extent = fusion.binary(BinaryOp::Mul, e0, e1);
        let (t, out) = fusion.merge(d0, d1, merged_extent);

        // Unrelated split on a third domain
        let e2 = fusion.named("i2");
        let d2 = fusion.domain(IterDomain::iteration(e2));
        let factor = fusion.constant(2);
        let outer_extent = fusion.binary(BinaryOp::CeilDiv, e2, factor);
        let (t2, ..) = fusion.split(d2, factor, outer_extent);

        let tv = TensorView {
            name: "T0".into(),
            dtype: DataType::Float,
            logical: vec![out],
            allocation: Some(vec![d0, d1]),
            transforms: vec![t, t2],
            definition: None,
        };

        let path = fusion.transforms_between(&tv, &[d0, d1], &[out]);
        assert_eq!(path, vec![t]);
    }
}
