//! Shared-memory planner
//!
//! Computes how many bytes of shared memory a launch needs: the
//! reduction/broadcast workspace at the base of the dynamic segment,
//! followed by the lowered dynamic allocations at their assigned
//! addresses.

use crate::error::{LanzarError, Result};
use crate::evaluator::ExpressionEvaluator;
use crate::ir::{IndexType, KernelSummary, SmemAllocation};
use crate::launch::LaunchParams;

/// Bytes of shared memory needed by `buffers`, starting from
/// `smem_offset`.
///
/// The offset is aligned up to 16 bytes before placing buffers; each
/// non-aliased buffer contributes `aligned_base + address +
/// size * sizeof(dtype)` and the maximum last byte wins. Aliased
/// buffers occupy no memory of their own.
pub fn compute_shared_memory(
    ee: &ExpressionEvaluator<'_>,
    buffers: &[SmemAllocation],
    index_type: IndexType,
    smem_offset: i64,
) -> Result<i64> {
    let mut total = smem_offset;
    // align smem_offset at 16 bytes
    let aligned = (smem_offset + 15) & !15;
    for alloc in buffers {
        if alloc.alias_of.is_some() {
            continue;
        }
        let address = alloc.address.ok_or_else(|| {
            LanzarError::InvalidProgram(format!(
                "Smem address is not set for buffer {}",
                alloc.buffer_name
            ))
        })?;
        let address = ee.evaluate(address).and_then(|v| v.as_int()).ok_or_else(|| {
            LanzarError::ShapeUnresolved {
                symbol: ee.fusion().scalar_to_string(address),
                buffer: alloc.buffer_name.clone(),
            }
        })?;
        let size = ee.evaluate(alloc.size).and_then(|v| v.as_int()).ok_or_else(|| {
            LanzarError::ShapeUnresolved {
                symbol: ee.fusion().scalar_to_string(alloc.size),
                buffer: alloc.buffer_name.clone(),
            }
        })?;
        let data_size = alloc.dtype.size_in_bytes(index_type) as i64;
        let last_byte = aligned + address + size * data_size;
        total = total.max(last_byte);
    }
    Ok(total)
}

/// Workspace bytes reductions and broadcasts stage through shared
/// memory, placed at the base of the dynamic segment.
pub fn reduction_broadcast_workspace(
    summary: &KernelSummary,
    launch_params: &LaunchParams,
    index_type: IndexType,
) -> Result<i64> {
    let Some(largest) = summary.largest_smem_data_type else {
        return Ok(0);
    };
    if !summary.has_workspace() {
        return Ok(0);
    }

    let welford_factor: i64 =
        if summary.has_block_welford || summary.has_grid_welford { 3 } else { 1 };
    if summary.has_iter_grouped_reductions && welford_factor == 3 {
        return Err(LanzarError::InvalidProgram(
            "can't have welford and iter grouped reductions at the same time! Should be handled \
             by grouped welford!"
                .to_string(),
        ));
    }
    // Outer reductions may group iteration domains, e.g. when vectorized.
    let grouped_iter_factor = summary.num_grouped_iterations.max(1);

    let mut workspace = largest.size_in_bytes(index_type) as i64
        * grouped_iter_factor
        * welford_factor
        * launch_params.bdimx()
        * launch_params.bdimy()
        * launch_params.bdimz();

    if summary.has_outer_grouped_grid_welford {
        workspace = workspace.max(summary.outer_grouped_grid_welford_largest_smem_size);
    }
    Ok(workspace)
}

/// Dynamic shared-memory total for a launch: the workspace plus the
/// lowered dynamic allocations.
pub fn dynamic_smem_size(
    ee: &ExpressionEvaluator<'_>,
    summary: &KernelSummary,
    launch_params: &LaunchParams,
    index_type: IndexType,
) -> Result<i64> {
    let workspace = reduction_broadcast_workspace(summary, launch_params, index_type)?;
    compute_shared_memory(ee, &summary.dynamic_smem_allocations, index_type, workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, Fusion, ParallelType};

    fn smem_alloc(
        fusion: &mut Fusion,
        name: &str,
        address: i64,
        size: i64,
        dtype: DataType,
    ) -> SmemAllocation {
        let address = fusion.constant(address);
        let size = fusion.constant(size);
        SmemAllocation {
            buffer_name: name.to_string(),
            dtype,
            address: Some(address),
            size,
            alias_of: None,
        }
    }

    #[test]
    fn test_compute_shared_memory_max_last_byte() {
        let mut fusion = Fusion::new();
        let buffers = vec![
            smem_alloc(&mut fusion, "T1", 0, 64, DataType::Float),
            smem_alloc(&mut fusion, "T2", 256, 32, DataType::Double),
        ];
        let ee = ExpressionEvaluator::new(&fusion);
        let total =
            compute_shared_memory(&ee, &buffers, IndexType::Int64, 0).expect("plan");
        // T2 ends last: 256 + 32*8
        assert_eq!(total, 512);
    }

    #[test]
    fn test_compute_shared_memory_aligns_base() {
        let mut fusion = Fusion::new();
        let buffers = vec![smem_alloc(&mut fusion, "T1", 0, 4, DataType::Float)];
        let ee = ExpressionEvaluator::new(&fusion);
        // Base 17 aligns to 32 before placing the buffer
        let total =
            compute_shared_memory(&ee, &buffers, IndexType::Int64, 17).expect("plan");
        assert_eq!(total, 32 + 16);
    }

    #[test]
    fn test_aliased_buffer_occupies_nothing() {
        let mut fusion = Fusion::new();
        let mut a = smem_alloc(&mut fusion, "T1", 0, 1024, DataType::Float);
        let b = smem_alloc(&mut fusion, "T2", 0, 16, DataType::Float);
        a.alias_of = Some(1);
        let ee = ExpressionEvaluator::new(&fusion);
        let total =
            compute_shared_memory(&ee, &[a, b], IndexType::Int64, 0).expect("plan");
        assert_eq!(total, 64);
    }

    #[test]
    fn test_missing_address_rejected() {
        let mut fusion = Fusion::new();
        let mut alloc = smem_alloc(&mut fusion, "T3", 0, 8, DataType::Float);
        alloc.address = None;
        let ee = ExpressionEvaluator::new(&fusion);
        let err = compute_shared_memory(&ee, &[alloc], IndexType::Int64, 0)
            .expect_err("must fail");
        assert!(matches!(err, LanzarError::InvalidProgram(_)));
    }

    fn block_128_launch() -> LaunchParams {
        let mut lp = LaunchParams::new();
        lp.bind(128, ParallelType::TIDx).expect("bind");
        lp
    }

    #[test]
    fn test_workspace_scales_with_block() {
        let summary = KernelSummary {
            has_block_reductions: true,
            largest_smem_data_type: Some(DataType::Float),
            num_grouped_iterations: 1,
            ..KernelSummary::default()
        };
        let ws = reduction_broadcast_workspace(&summary, &block_128_launch(), IndexType::Int64)
            .expect("workspace");
        assert_eq!(ws, 4 * 128);
    }

    #[test]
    fn test_workspace_welford_factor() {
        let summary = KernelSummary {
            has_block_reductions: true,
            has_block_welford: true,
            largest_smem_data_type: Some(DataType::Float),
            num_grouped_iterations: 1,
            ..KernelSummary::default()
        };
        let ws = reduction_broadcast_workspace(&summary, &block_128_launch(), IndexType::Int64)
            .expect("workspace");
        assert_eq!(ws, 3 * 4 * 128);
    }

    #[test]
    fn test_workspace_outer_grouped_floor() {
        let summary = KernelSummary {
            has_grid_reductions: true,
            has_grid_welford: true,
            has_outer_grouped_grid_welford: true,
            outer_grouped_grid_welford_largest_smem_size: 1 << 20,
            largest_smem_data_type: Some(DataType::Float),
            num_grouped_iterations: 1,
            ..KernelSummary::default()
        };
        let ws = reduction_broadcast_workspace(&summary, &block_128_launch(), IndexType::Int64)
            .expect("workspace");
        assert_eq!(ws, 1 << 20);
    }

    #[test]
    fn test_welford_with_iter_grouping_rejected() {
        let summary = KernelSummary {
            has_block_reductions: true,
            has_block_welford: true,
            has_iter_grouped_reductions: true,
            largest_smem_data_type: Some(DataType::Float),
            num_grouped_iterations: 2,
            ..KernelSummary::default()
        };
        let err = reduction_broadcast_workspace(&summary, &block_128_launch(), IndexType::Int64)
            .expect_err("must fail");
        assert!(matches!(err, LanzarError::InvalidProgram(_)));
    }

    #[test]
    fn test_no_workspace_without_reductions() {
        let summary = KernelSummary {
            largest_smem_data_type: Some(DataType::Float),
            ..KernelSummary::default()
        };
        let ws = reduction_broadcast_workspace(&summary, &block_128_launch(), IndexType::Int64)
            .expect("workspace");
        assert_eq!(ws, 0);
    }
}
