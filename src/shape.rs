//! Shape inference
//!
//! Resolves symbolic extents into concrete sizes and strides for output
//! and intermediate tensors. Intermediates take their shape from the
//! allocation expression attached during lowering; outputs walk their
//! allocation domain, resolve extents (expanded broadcasts included),
//! and, when the allocation domain differs from the logical domain,
//! replay the split/merge transforms between the two on a plain
//! `{sizes, strides}` descriptor.

use crate::error::{LanzarError, Result};
use crate::evaluator::ExpressionEvaluator;
use crate::ir::{
    DomainId, DomainTransform, Fusion, GlobalAllocation, ScalarId, TensorId, TensorView,
};

/// A strided layout: sizes plus strides of equal rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StridedLayout {
    /// Per-dimension sizes
    pub sizes: Vec<i64>,
    /// Per-dimension strides
    pub strides: Vec<i64>,
}

impl StridedLayout {
    /// Number of dimensions
    #[must_use]
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// View one dimension `[n]` as `[n / factor, factor]`
    fn view_split(&mut self, dim: usize, factor: i64, buffer: &str) -> Result<()> {
        let n = self.sizes[dim];
        if factor <= 0 || n % factor != 0 {
            return Err(LanzarError::RankMismatch {
                buffer: buffer.to_string(),
                reason: format!("cannot view extent {n} as a multiple of {factor}"),
            });
        }
        let stride = self.strides[dim];
        self.sizes[dim] = n / factor;
        self.sizes.insert(dim + 1, factor);
        self.strides[dim] = stride * factor;
        self.strides.insert(dim + 1, stride);
        Ok(())
    }

    /// View dimensions `dim` and `dim + 1` as one
    fn view_merge(&mut self, dim: usize, buffer: &str) -> Result<()> {
        let (outer_size, outer_stride) = (self.sizes[dim], self.strides[dim]);
        let (inner_size, inner_stride) = (self.sizes[dim + 1], self.strides[dim + 1]);
        let merged_size = outer_size * inner_size;
        let merged_stride = if merged_size == 0 || outer_size == 1 {
            inner_stride
        } else if inner_size == 1 {
            outer_stride
        } else if outer_stride == inner_stride * inner_size {
            inner_stride
        } else {
            return Err(LanzarError::RankMismatch {
                buffer: buffer.to_string(),
                reason: format!(
                    "cannot merge non-contiguous dimensions {outer_size}@{outer_stride} and \
                     {inner_size}@{inner_stride}"
                ),
            });
        };
        self.sizes[dim] = merged_size;
        self.strides[dim] = merged_stride;
        self.sizes.remove(dim + 1);
        self.strides.remove(dim + 1);
        Ok(())
    }

    /// Reorder dimensions; `dims[i]` is the old position of new dim `i`
    fn permute(&mut self, dims: &[usize]) {
        self.sizes = dims.iter().map(|&d| self.sizes[d]).collect();
        self.strides = dims.iter().map(|&d| self.strides[d]).collect();
    }
}

/// Contiguous strides over `sizes` in allocation order
///
/// Expanded dimensions get stride 0 and zero-sized dimensions get
/// stride 1; every other stride is the running product of the
/// following non-expanded, non-zero extents.
pub fn contiguous_strides(sizes: &[i64], expand_flags: &[bool]) -> Result<Vec<i64>> {
    debug_assert_eq!(sizes.len(), expand_flags.len());
    let mut strides = vec![0i64; sizes.len()];
    let mut cur_stride = 1i64;
    for i in (0..sizes.len()).rev() {
        let size = sizes[i];
        if size < 0 {
            return Err(LanzarError::InvalidProgram(format!(
                "size is assumed non-negative but received {size}"
            )));
        }
        strides[i] = if expand_flags[i] {
            0
        } else if size == 0 {
            1
        } else {
            let s = cur_stride;
            cur_stride *= size;
            s
        };
    }
    Ok(strides)
}

/// A symbolic size in an allocation walk
#[derive(Debug, Clone, Copy)]
enum ShapeSymbol {
    /// Resolve through the evaluator
    Value(ScalarId),
    /// Forced to one (device dimensions)
    One,
}

fn infer_shape(
    buffer: &str,
    symbols: &[ShapeSymbol],
    expand_flags: &[bool],
    ee: &ExpressionEvaluator<'_>,
) -> Result<(Vec<i64>, Vec<i64>)> {
    let mut sizes = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let size = match symbol {
            ShapeSymbol::One => 1,
            ShapeSymbol::Value(sid) => ee
                .evaluate(*sid)
                .and_then(|v| v.as_int())
                .ok_or_else(|| LanzarError::ShapeUnresolved {
                    symbol: ee.fusion().scalar_to_string(*sid),
                    buffer: buffer.to_string(),
                })?,
        };
        sizes.push(size);
    }
    let strides = contiguous_strides(&sizes, expand_flags)?;
    Ok((sizes, strides))
}

/// Infer the shape of an intermediate tensor from its allocation
/// expression. Broadcast expansion is not considered; the buffer is a
/// plain memory chunk of the lowered size.
pub fn infer_shape_of_intermediate(
    fusion: &Fusion,
    alloc: &GlobalAllocation,
    ee: &ExpressionEvaluator<'_>,
) -> Result<(Vec<i64>, Vec<i64>)> {
    let tv = fusion.tensor_view(alloc.tensor);
    let symbols: Vec<ShapeSymbol> = alloc.shape.iter().map(|&s| ShapeSymbol::Value(s)).collect();
    let expand_flags = vec![false; symbols.len()];
    infer_shape(&tv.name, &symbols, &expand_flags, ee)
}

/// Infer the sizes and strides of an output tensor
///
/// Walks the allocation domain (reduction and stride axes skipped,
/// device axes forced to one, expanded broadcasts taking their expanded
/// extent), then applies the allocation-to-logical transform when the
/// tensor has a non-trivial allocation domain.
pub fn infer_shape_of_output(
    fusion: &Fusion,
    tensor: TensorId,
    ee: &ExpressionEvaluator<'_>,
) -> Result<(Vec<i64>, Vec<i64>)> {
    let tv = fusion.tensor_view(tensor);

    let mut symbols = Vec::new();
    let mut expand_flags = Vec::new();
    for &did in tv.maybe_allocation_domain() {
        let id = fusion.iter_domain(did);
        if id.is_reduction() || id.is_stride() {
            continue;
        }
        if id.is_device_dim() {
            symbols.push(ShapeSymbol::One);
        } else {
            symbols.push(ShapeSymbol::Value(id.maybe_expanded_extent()));
        }
        if id.has_expanded_extent() {
            if !id.is_broadcast() {
                return Err(LanzarError::InvalidProgram(format!(
                    "Non-broadcast domain should not have an expanded extent in {}",
                    tv.name
                )));
            }
            expand_flags.push(true);
        } else {
            expand_flags.push(false);
        }
    }

    let (sizes, strides) = infer_shape(&tv.name, &symbols, &expand_flags, ee)?;
    if !tv.has_allocation() {
        return Ok((sizes, strides));
    }
    transform_from_allocation_to_logical(fusion, tv, StridedLayout { sizes, strides }, ee)
}

/// Replay the affine transforms between the allocation and logical
/// domains on `layout`, returning sizes/strides in logical order.
fn transform_from_allocation_to_logical(
    fusion: &Fusion,
    tv: &TensorView,
    mut layout: StridedLayout,
    ee: &ExpressionEvaluator<'_>,
) -> Result<(Vec<i64>, Vec<i64>)> {
    let logical = fusion.no_reduction_logical(tv);
    let alloc = fusion.no_reduction_allocation(tv);
    let mut frontier: Vec<DomainId> = alloc.clone();
    if layout.rank() != frontier.len() {
        return Err(LanzarError::RankMismatch {
            buffer: tv.name.clone(),
            reason: format!(
                "allocation rank {} does not match inferred rank {}",
                frontier.len(),
                layout.rank()
            ),
        });
    }

    // The allocation domain can sit before or after the logical domain
    // in the transform graph, so both a forward and a backward walk are
    // required.
    for tid in fusion.transforms_between(tv, &alloc, &logical) {
        apply_transform(fusion, tv, fusion.transform(tid), Direction::Forward, &mut frontier, &mut layout, ee)?;
    }
    let mut backward = fusion.transforms_between(tv, &logical, &alloc);
    backward.reverse();
    for tid in backward {
        apply_transform(fusion, tv, fusion.transform(tid), Direction::Backward, &mut frontier, &mut layout, ee)?;
    }

    if frontier.len() != logical.len() {
        return Err(LanzarError::RankMismatch {
            buffer: tv.name.clone(),
            reason: format!(
                "frontier has {} domains after traversal but the logical domain has {}",
                frontier.len(),
                logical.len()
            ),
        });
    }

    // All affine transforms handled; a final permutation lines the
    // frontier up with the logical order.
    let mut dims = Vec::with_capacity(logical.len());
    for &want in &logical {
        let pos = frontier.iter().position(|&d| d == want).ok_or_else(|| {
            LanzarError::RankMismatch {
                buffer: tv.name.clone(),
                reason: "traversed frontier is not a permutation of the logical domain".into(),
            }
        })?;
        dims.push(pos);
    }
    layout.permute(&dims);
    Ok((layout.sizes, layout.strides))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Allocation side is upstream of the transform
    Forward,
    /// Logical side is upstream; apply the inverse operation
    Backward,
}

/// Apply one split/merge to the frontier and layout.
///
/// The forward and backward walks differ only in which side of the
/// transform is already known, so both collapse onto two primitives:
/// an in-place split of one frontier entry, and a (permuting) merge of
/// two frontier entries.
fn apply_transform(
    fusion: &Fusion,
    tv: &TensorView,
    transform: &DomainTransform,
    direction: Direction,
    frontier: &mut Vec<DomainId>,
    layout: &mut StridedLayout,
    ee: &ExpressionEvaluator<'_>,
) -> Result<()> {
    match (transform, direction) {
        (DomainTransform::Split { input, outer, inner, factor }, Direction::Forward) => {
            split_frontier(tv, *input, *outer, *inner, *factor, frontier, layout, ee)
        }
        (DomainTransform::Merge { outer, inner, output }, Direction::Backward) => {
            let factor = fusion.iter_domain(*inner).extent;
            split_frontier(tv, *output, *outer, *inner, factor, frontier, layout, ee)
        }
        (DomainTransform::Merge { outer, inner, output }, Direction::Forward) => {
            merge_frontier(tv, *outer, *inner, *output, frontier, layout)
        }
        (DomainTransform::Split { input, outer, inner, .. }, Direction::Backward) => {
            merge_frontier(tv, *outer, *inner, *input, frontier, layout)
        }
        (DomainTransform::Opaque { .. }, _) => {
            Err(LanzarError::UnsupportedAllocTransform { buffer: tv.name.clone() })
        }
    }
}

/// Replace `source` in the frontier with `outer` then `inner`, viewing
/// the corresponding layout dimension as `[n / factor, factor]`.
#[allow(clippy::too_many_arguments)]
fn split_frontier(
    tv: &TensorView,
    source: DomainId,
    outer: DomainId,
    inner: DomainId,
    factor: ScalarId,
    frontier: &mut Vec<DomainId>,
    layout: &mut StridedLayout,
    ee: &ExpressionEvaluator<'_>,
) -> Result<()> {
    let Some(dim) = frontier.iter().position(|&d| d == source) else {
        // Allocation domain on both sides of the logical domain: the
        // frontier already represents this transform's endpoints.
        tracing::trace!(tensor = %tv.name, "skipping transform outside the frontier");
        return Ok(());
    };
    let factor = ee
        .evaluate(factor)
        .and_then(|v| v.as_int())
        .ok_or_else(|| LanzarError::ShapeUnresolved {
            symbol: ee.fusion().scalar_to_string(factor),
            buffer: tv.name.clone(),
        })?;
    layout.view_split(dim, factor, &tv.name)?;
    frontier[dim] = outer;
    frontier.insert(dim + 1, inner);
    Ok(())
}

/// Replace `outer` and `inner` in the frontier with `merged`, viewing
/// the two layout dimensions as one (permuting them together first if
/// they are not adjacent).
fn merge_frontier(
    tv: &TensorView,
    outer: DomainId,
    inner: DomainId,
    merged: DomainId,
    frontier: &mut Vec<DomainId>,
    layout: &mut StridedLayout,
) -> Result<()> {
    let (Some(outer_dim), Some(inner_dim)) = (
        frontier.iter().position(|&d| d == outer),
        frontier.iter().position(|&d| d == inner),
    ) else {
        tracing::trace!(tensor = %tv.name, "skipping transform outside the frontier");
        return Ok(());
    };
    let left = outer_dim.min(inner_dim);
    if outer_dim + 1 != inner_dim {
        // Permute so the pair is adjacent as [..., outer, inner, ...]
        let mut dims = Vec::with_capacity(layout.rank());
        let mut i = 0;
        while i < layout.rank() && i != left {
            dims.push(i);
            i += 1;
        }
        dims.push(outer_dim);
        dims.push(inner_dim);
        while i < layout.rank() {
            if i != outer_dim && i != inner_dim {
                dims.push(i);
            }
            i += 1;
        }
        layout.permute(&dims);
    }
    layout.view_merge(left, &tv.name)?;
    if inner_dim < outer_dim {
        frontier[inner_dim] = merged;
        frontier.remove(outer_dim);
    } else {
        frontier[outer_dim] = merged;
        frontier.remove(inner_dim);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalValue;
    use crate::ir::{BinaryOp, DataType, IterDomain, IterType, ParallelType, TensorView};

    fn bound_evaluator<'f>(
        fusion: &'f Fusion,
        bindings: &[(ScalarId, i64)],
    ) -> ExpressionEvaluator<'f> {
        let mut ee = ExpressionEvaluator::new(fusion);
        for &(sid, v) in bindings {
            ee.bind_scalar(sid, EvalValue::Int(v)).expect("bind");
        }
        ee
    }

    #[test]
    fn test_contiguous_strides_plain() {
        let strides = contiguous_strides(&[2, 3, 4], &[false; 3]).expect("strides");
        assert_eq!(strides, vec![12, 4, 1]);
    }

    #[test]
    fn test_contiguous_strides_expanded_and_zero() {
        // expanded => 0, zero-sized => 1
        let strides = contiguous_strides(&[5, 0, 7], &[true, false, false]).expect("strides");
        assert_eq!(strides, vec![0, 1, 1]);
    }

    #[test]
    fn test_output_shape_simple() {
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let e1 = fusion.named("i1");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let d1 = fusion.domain(IterDomain::iteration(e1));
        let tv =
            fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d0, d1]));

        let ee = bound_evaluator(&fusion, &[(e0, 6), (e1, 7)]);
        let (sizes, strides) = infer_shape_of_output(&fusion, tv, &ee).expect("infer");
        assert_eq!(sizes, vec![6, 7]);
        assert_eq!(strides, vec![7, 1]);
    }

    #[test]
    fn test_output_shape_unresolved_extent() {
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let tv = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d0]));

        let ee = ExpressionEvaluator::new(&fusion);
        let err = infer_shape_of_output(&fusion, tv, &ee).expect_err("must fail");
        assert!(matches!(err, LanzarError::ShapeUnresolved { .. }));
    }

    #[test]
    fn test_output_shape_skips_reduction_and_forces_device_dims() {
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let e1 = fusion.named("r0");
        let e2 = fusion.named("d0");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let d1 = fusion.domain(IterDomain {
            extent: e1,
            expanded_extent: None,
            iter_type: IterType::Reduction,
            parallel: ParallelType::Serial,
        });
        let d2 = fusion.domain(IterDomain {
            extent: e2,
            expanded_extent: None,
            iter_type: IterType::Iteration,
            parallel: ParallelType::DIDx,
        });
        let tv =
            fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d2, d0, d1]));

        // The device extent is deliberately left unbound: it must not be
        // evaluated at all.
        let ee = bound_evaluator(&fusion, &[(e0, 4)]);
        let (sizes, strides) = infer_shape_of_output(&fusion, tv, &ee).expect("infer");
        assert_eq!(sizes, vec![1, 4]);
        assert_eq!(strides, vec![4, 1]);
    }

    /// Broadcast-expanded output: logical `[B=expanded(5), N=7]` gives
    /// sizes `[5, 7]`, strides `[0, 1]`.
    #[test]
    fn test_output_shape_expanded_broadcast() {
        let mut fusion = Fusion::new();
        let one = fusion.constant(1);
        let expanded = fusion.named("b0");
        let e1 = fusion.named("i1");
        let b = fusion.domain(IterDomain {
            extent: one,
            expanded_extent: Some(expanded),
            iter_type: IterType::Broadcast,
            parallel: ParallelType::Serial,
        });
        let n = fusion.domain(IterDomain::iteration(e1));
        let tv = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![b, n]));

        let ee = bound_evaluator(&fusion, &[(expanded, 5), (e1, 7)]);
        let (sizes, strides) = infer_shape_of_output(&fusion, tv, &ee).expect("infer");
        assert_eq!(sizes, vec![5, 7]);
        assert_eq!(strides, vec![0, 1]);
    }

    /// Transposed-contiguous output: logical `[I1, I2]`, allocation
    /// `[I2*I1]`. With I1=3, I2=4 the result is sizes `[3, 4]`, strides
    /// `[1, 3]`.
    #[test]
    fn test_output_shape_merged_allocation() {
        let mut fusion = Fusion::new();
        let e1 = fusion.named("i1");
        let e2 = fusion.named("i2");
        let d1 = fusion.domain(IterDomain::iteration(e1));
        let d2 = fusion.domain(IterDomain::iteration(e2));
        let merged_extent = fusion.binary(BinaryOp::Mul, e2, e1);
        let (t, m) = fusion.merge(d2, d1, merged_extent);
        let tv = fusion.tensor(TensorView {
            name: "T0".into(),
            dtype: DataType::Float,
            logical: vec![d1, d2],
            allocation: Some(vec![m]),
            transforms: vec![t],
            definition: None,
        });

        let ee = bound_evaluator(&fusion, &[(e1, 3), (e2, 4)]);
        let (sizes, strides) = infer_shape_of_output(&fusion, tv, &ee).expect("infer");
        assert_eq!(sizes, vec![3, 4]);
        assert_eq!(strides, vec![1, 3]);
    }

    /// Logical `[I1*I2]` with allocation `[I1, I2]`: allocate `[I1, I2]`
    /// and view as the flat logical extent.
    #[test]
    fn test_output_shape_split_allocation() {
        let mut fusion = Fusion::new();
        let flat = fusion.named("i0");
        let factor = fusion.constant(4);
        let outer_extent = fusion.binary(BinaryOp::CeilDiv, flat, factor);
        let d_flat = fusion.domain(IterDomain::iteration(flat));
        let (t, outer, inner) = fusion.split(d_flat, factor, outer_extent);
        let tv = fusion.tensor(TensorView {
            name: "T0".into(),
            dtype: DataType::Float,
            logical: vec![d_flat],
            allocation: Some(vec![outer, inner]),
            transforms: vec![t],
            definition: None,
        });

        let ee = bound_evaluator(&fusion, &[(flat, 12)]);
        let (sizes, strides) = infer_shape_of_output(&fusion, tv, &ee).expect("infer");
        assert_eq!(sizes, vec![12]);
        assert_eq!(strides, vec![1]);
    }

    /// Allocation `[I2, I1]` (permuted logical): pure permutation, no
    /// split or merge involved.
    #[test]
    fn test_output_shape_permuted_allocation() {
        let mut fusion = Fusion::new();
        let e1 = fusion.named("i1");
        let e2 = fusion.named("i2");
        let d1 = fusion.domain(IterDomain::iteration(e1));
        let d2 = fusion.domain(IterDomain::iteration(e2));
        let tv = fusion.tensor(TensorView {
            name: "T0".into(),
            dtype: DataType::Float,
            logical: vec![d1, d2],
            allocation: Some(vec![d2, d1]),
            transforms: vec![],
            definition: None,
        });

        let ee = bound_evaluator(&fusion, &[(e1, 3), (e2, 5)]);
        let (sizes, strides) = infer_shape_of_output(&fusion, tv, &ee).expect("infer");
        assert_eq!(sizes, vec![3, 5]);
        assert_eq!(strides, vec![1, 3]);
    }

    #[test]
    fn test_opaque_transform_rejected() {
        let mut fusion = Fusion::new();
        let e = fusion.named("i0");
        let a = fusion.domain(IterDomain::iteration(e));
        let b = fusion.domain(IterDomain::iteration(e));
        let t = fusion.opaque_transform("resize", vec![a], vec![b]);
        let tv = fusion.tensor(TensorView {
            name: "T0".into(),
            dtype: DataType::Float,
            logical: vec![b],
            allocation: Some(vec![a]),
            transforms: vec![t],
            definition: None,
        });

        let ee = bound_evaluator(&fusion, &[(e, 8)]);
        let err = infer_shape_of_output(&fusion, tv, &ee).expect_err("must reject");
        assert!(matches!(err, LanzarError::UnsupportedAllocTransform { .. }));
    }

    #[test]
    fn test_intermediate_shape_from_allocation_expr() {
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let e1 = fusion.named("i1");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let tv = fusion.tensor(TensorView::contiguous("T5", DataType::Float, vec![d0]));
        let alloc = GlobalAllocation {
            tensor: tv,
            shape: vec![e0, e1],
            zero_init: false,
            resets_to_zero: false,
            is_profile_buffer: false,
        };

        let ee = bound_evaluator(&fusion, &[(e0, 3), (e1, 9)]);
        let (sizes, strides) = infer_shape_of_intermediate(&fusion, &alloc, &ee).expect("infer");
        assert_eq!(sizes, vec![3, 9]);
        assert_eq!(strides, vec![9, 1]);
    }
}
