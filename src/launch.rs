//! Launch parameters and their resolution
//!
//! A launch is six dimensions plus a dynamic shared-memory size. Any
//! dimension may start unbound and be inferred from the kernel's
//! parallelized iteration domains; explicit constraints pin dimensions
//! up front and win over inference.

use serde::{Deserialize, Serialize};

use crate::error::{LanzarError, Result};
use crate::evaluator::{EvalValue, ExpressionEvaluator};
use crate::ir::{IndexType, LoweredKernel, ParallelType, ScalarId};
use crate::options::warn_once;
use crate::smem;

/// Sentinel for a dimension that has not been bound
pub const UNINITIALIZED_VAL: i64 = -1;

/// Grid dims, block dims and dynamic shared-memory size of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    gdimx: i64,
    gdimy: i64,
    gdimz: i64,
    bdimx: i64,
    bdimy: i64,
    bdimz: i64,
    smem: i64,
}

impl Default for LaunchParams {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchParams {
    /// All dimensions unbound, no dynamic shared memory
    #[must_use]
    pub fn new() -> Self {
        Self {
            gdimx: UNINITIALIZED_VAL,
            gdimy: UNINITIALIZED_VAL,
            gdimz: UNINITIALIZED_VAL,
            bdimx: UNINITIALIZED_VAL,
            bdimy: UNINITIALIZED_VAL,
            bdimz: UNINITIALIZED_VAL,
            smem: 0,
        }
    }

    /// Fully specified launch shape (testing and RTC surface)
    #[must_use]
    pub fn from_dims(grid: (i64, i64, i64), block: (i64, i64, i64), smem: i64) -> Self {
        Self {
            gdimx: grid.0,
            gdimy: grid.1,
            gdimz: grid.2,
            bdimx: block.0,
            bdimy: block.1,
            bdimz: block.2,
            smem,
        }
    }

    fn slot(&self, p_type: ParallelType) -> Option<i64> {
        match p_type {
            ParallelType::BIDx => Some(self.gdimx),
            ParallelType::BIDy => Some(self.gdimy),
            ParallelType::BIDz => Some(self.gdimz),
            ParallelType::TIDx => Some(self.bdimx),
            ParallelType::TIDy => Some(self.bdimy),
            ParallelType::TIDz => Some(self.bdimz),
            ParallelType::Serial | ParallelType::DIDx => None,
        }
    }

    fn slot_mut(&mut self, p_type: ParallelType) -> Option<&mut i64> {
        match p_type {
            ParallelType::BIDx => Some(&mut self.gdimx),
            ParallelType::BIDy => Some(&mut self.gdimy),
            ParallelType::BIDz => Some(&mut self.gdimz),
            ParallelType::TIDx => Some(&mut self.bdimx),
            ParallelType::TIDy => Some(&mut self.bdimy),
            ParallelType::TIDz => Some(&mut self.bdimz),
            ParallelType::Serial | ParallelType::DIDx => None,
        }
    }

    /// Raw value of a dimension, `-1` when unbound
    #[must_use]
    pub fn raw_val(&self, p_type: ParallelType) -> i64 {
        self.slot(p_type).unwrap_or(UNINITIALIZED_VAL)
    }

    /// Bound value of a dimension, defaulting to 1 when unbound
    #[must_use]
    pub fn val(&self, p_type: ParallelType) -> i64 {
        let raw = self.raw_val(p_type);
        if raw == UNINITIALIZED_VAL {
            1
        } else {
            raw
        }
    }

    /// Whether a dimension has been bound
    #[must_use]
    pub fn has_dim(&self, p_type: ParallelType) -> bool {
        self.raw_val(p_type) != UNINITIALIZED_VAL
    }

    /// Bind a dimension; rebinding requires the same value
    pub fn bind(&mut self, val: i64, p_type: ParallelType) -> Result<()> {
        let Some(slot) = self.slot_mut(p_type) else {
            return Err(LanzarError::InvalidProgram(format!(
                "{p_type} is not a launch dimension"
            )));
        };
        if *slot != UNINITIALIZED_VAL && *slot != val {
            return Err(LanzarError::InvalidProgram(format!(
                "Tried to bind {p_type} to {val} but it is already set to {slot}"
            )));
        }
        *slot = val;
        Ok(())
    }

    /// Grid x, defaulting to 1
    #[must_use]
    pub fn gdimx(&self) -> i64 {
        self.val(ParallelType::BIDx)
    }

    /// Grid y, defaulting to 1
    #[must_use]
    pub fn gdimy(&self) -> i64 {
        self.val(ParallelType::BIDy)
    }

    /// Grid z, defaulting to 1
    #[must_use]
    pub fn gdimz(&self) -> i64 {
        self.val(ParallelType::BIDz)
    }

    /// Block x, defaulting to 1
    #[must_use]
    pub fn bdimx(&self) -> i64 {
        self.val(ParallelType::TIDx)
    }

    /// Block y, defaulting to 1
    #[must_use]
    pub fn bdimy(&self) -> i64 {
        self.val(ParallelType::TIDy)
    }

    /// Block z, defaulting to 1
    #[must_use]
    pub fn bdimz(&self) -> i64 {
        self.val(ParallelType::TIDz)
    }

    /// Threads per block
    #[must_use]
    pub fn n_threads(&self) -> i64 {
        self.bdimx() * self.bdimy() * self.bdimz()
    }

    /// Blocks per grid
    #[must_use]
    pub fn n_blocks(&self) -> i64 {
        self.gdimx() * self.gdimy() * self.gdimz()
    }

    /// Dynamic shared-memory bytes
    #[must_use]
    pub fn smem(&self) -> i64 {
        self.smem
    }

    /// Set the dynamic shared-memory bytes
    pub fn set_smem(&mut self, smem: i64) {
        self.smem = smem;
    }
}

impl std::fmt::Display for LaunchParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Launch Parameters: BlockDim.x = {}, BlockDim.y = {}, BlockDim.z = {}, GridDim.x = \
             {}, GridDim.y = {}, GridDim.z = {}, Smem Size = {}",
            self.raw_val(ParallelType::TIDx),
            self.raw_val(ParallelType::TIDy),
            self.raw_val(ParallelType::TIDz),
            self.raw_val(ParallelType::BIDx),
            self.raw_val(ParallelType::BIDy),
            self.raw_val(ParallelType::BIDz),
            self.smem
        )
    }
}

/// Resolve the launch parameters for one call
///
/// Pinned constraints are bound first: every parallelized iteration
/// domain of a pinned type either validates against the pin (a one-shot
/// warning on mismatch) or is bound to it. Remaining parallel types are
/// inferred from the kernel's parallel dimension map. The dynamic
/// shared-memory size is planned last, once all block dimensions are
/// final.
pub fn compute_launch_params(
    kernel: &LoweredKernel,
    ee: &mut ExpressionEvaluator<'_>,
    constraints: &LaunchParams,
    warp_size: i64,
    index_type: IndexType,
) -> Result<LaunchParams> {
    if warp_size <= 0 {
        return Err(LanzarError::InvalidProgram(format!(
            "WARP_SIZE should be larger than 0, found {warp_size}"
        )));
    }

    let mut launch_params = LaunchParams::new();
    let summary = &kernel.summary;

    // Parallel-binding iteration domains grouped by type
    let mut parallel_iter_extents: Vec<(ParallelType, Vec<ScalarId>)> = Vec::new();
    for &did in &summary.parallel_bindings {
        let id = kernel.fusion.iter_domain(did);
        let p_type = id.parallel;
        if !p_type.is_thread_dim() && !p_type.is_block_dim() {
            continue;
        }
        match parallel_iter_extents.iter_mut().find(|(p, _)| *p == p_type) {
            Some((_, extents)) => extents.push(id.extent),
            None => parallel_iter_extents.push((p_type, vec![id.extent])),
        }
    }

    // Dimensions set in the launch constraints: bind those values, or
    // make sure an independently inferable extent matches what was set.
    for (p_type, extents) in &parallel_iter_extents {
        if !constraints.has_dim(*p_type) {
            continue;
        }
        let pinned = constraints.val(*p_type);
        for &extent in extents {
            if let Some(inferred) = ee.evaluate(extent).and_then(|v| v.as_int()) {
                let valid = inferred == pinned || constraints.raw_val(*p_type) == -1;
                if !valid {
                    warn_once!(
                        "Cannot validate parallelization scheme, this may be due to mixed \
                         broadcast axes that are parallelized."
                    );
                }
            } else {
                ee.bind_scalar(extent, EvalValue::Int(pinned))?;
            }
        }
        if !launch_params.has_dim(*p_type) {
            launch_params.bind(pinned, *p_type)?;
            // The bound p-type must be the final launch value so the
            // smem planning below sees accurate dimensions.
            ee.bind_parallel(*p_type, pinned);
        }
    }

    // Infer the remaining parallel types from the simplified extents
    for (&p_type, &extent) in &summary.parallel_dimension_map {
        let val = ee.evaluate(extent).and_then(|v| v.as_int()).ok_or_else(|| {
            LanzarError::ShapeUnresolved {
                symbol: kernel.fusion.scalar_to_string(extent),
                buffer: format!("launch bounds for {p_type}"),
            }
        })?;
        if val > 0 {
            ee.bind_parallel(p_type, val);
            launch_params.bind(val, p_type)?;
        }
    }

    let dynamic_smem = smem::dynamic_smem_size(ee, summary, &launch_params, index_type)?;
    launch_params.set_smem(dynamic_smem);

    Ok(launch_params)
}
