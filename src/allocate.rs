//! Buffer allocation
//!
//! Materializes output tensors (fresh storage, in-place reuse of an
//! aliased tensor, or evaluator-derived views) and carries the typed
//! NaN-fill debug policy. Outputs are allocated non-aliased first so
//! aliased outputs can refer to them, duplicates share one tensor, and
//! every materialized tensor is bound into the evaluator as it appears.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::args::TensorArg;
use crate::driver::{DeviceBuffer, DeviceContext};
use crate::error::{LanzarError, Result};
use crate::evaluator::ExpressionEvaluator;
use crate::ir::{AllocationMode, DataType, Fusion, IndexType, TensorDef, TensorId};
use crate::options;
use crate::shape;

/// Allocation descriptor for one output or intermediate buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalBufferInfo {
    /// Backing tensor view
    pub tensor: TensorId,
    /// Concrete sizes
    pub sizes: Vec<i64>,
    /// Concrete strides
    pub strides: Vec<i64>,
    /// Element type, index already resolved
    pub dtype: DataType,
    /// Must be zero before the kernel runs
    pub zero_init: bool,
    /// The kernel restores zeros on completion
    pub resets_to_zero: bool,
    /// Holds kernel-profile counters
    pub is_profile_buffer: bool,
}

/// Where a tensor's bytes live
#[derive(Debug, Clone)]
enum TensorStorage {
    /// Storage this crate allocated (possibly pool-borrowed)
    Owned(Arc<DeviceBuffer>),
    /// Caller-owned storage referenced by raw address
    External(u64),
}

/// A device tensor: storage plus a strided view over it
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    storage: TensorStorage,
    sizes: Vec<i64>,
    strides: Vec<i64>,
    dtype: DataType,
}

/// Element span one strided view covers, in elements
fn span_elements(sizes: &[i64], strides: &[i64]) -> i64 {
    if sizes.iter().any(|&s| s == 0) {
        return 0;
    }
    1 + sizes
        .iter()
        .zip(strides.iter())
        .map(|(&size, &stride)| (size - 1) * stride.abs())
        .sum::<i64>()
}

impl DeviceTensor {
    /// Allocate raw storage for the given sizes/strides
    pub fn empty_strided(
        ctx: &DeviceContext,
        sizes: Vec<i64>,
        strides: Vec<i64>,
        dtype: DataType,
        index_type: IndexType,
    ) -> Result<Self> {
        let bytes =
            span_elements(&sizes, &strides) as usize * dtype.size_in_bytes(index_type);
        let buffer = DeviceBuffer::alloc_raw(ctx, bytes.max(1))?;
        Ok(Self { storage: TensorStorage::Owned(Arc::new(buffer)), sizes, strides, dtype })
    }

    /// Allocate zero-filled contiguous storage
    pub fn zeros(
        ctx: &DeviceContext,
        sizes: Vec<i64>,
        dtype: DataType,
        index_type: IndexType,
    ) -> Result<Self> {
        let strides = shape::contiguous_strides(&sizes, &vec![false; sizes.len()])?;
        let bytes =
            span_elements(&sizes, &strides) as usize * dtype.size_in_bytes(index_type);
        let buffer = DeviceBuffer::alloc_zeroed(ctx, bytes.max(1))?;
        Ok(Self { storage: TensorStorage::Owned(Arc::new(buffer)), sizes, strides, dtype })
    }

    /// Wrap a pool-borrowed (or otherwise shared) buffer as a
    /// contiguous tensor
    pub fn from_shared(
        buffer: Arc<DeviceBuffer>,
        sizes: Vec<i64>,
        dtype: DataType,
    ) -> Result<Self> {
        let strides = shape::contiguous_strides(&sizes, &vec![false; sizes.len()])?;
        Ok(Self { storage: TensorStorage::Owned(buffer), sizes, strides, dtype })
    }

    /// Wrap caller-owned storage described by `arg`
    #[must_use]
    pub fn external(arg: &TensorArg) -> Self {
        Self {
            storage: TensorStorage::External(arg.ptr),
            sizes: arg.sizes.clone(),
            strides: arg.strides.clone(),
            dtype: arg.dtype,
        }
    }

    /// Concrete sizes
    #[must_use]
    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    /// Concrete strides
    #[must_use]
    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    /// Element type
    #[must_use]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Base device address
    #[must_use]
    pub fn device_ptr(&self) -> u64 {
        match &self.storage {
            TensorStorage::Owned(buffer) => buffer.device_ptr(),
            TensorStorage::External(ptr) => *ptr,
        }
    }

    /// Descriptor for argument marshalling and evaluator binding
    #[must_use]
    pub fn arg(&self) -> TensorArg {
        TensorArg {
            ptr: self.device_ptr(),
            sizes: self.sizes.clone(),
            strides: self.strides.clone(),
            dtype: self.dtype,
            on_device: true,
        }
    }

    /// Whether both tensors view the same storage
    #[must_use]
    pub fn is_alias_of(&self, other: &DeviceTensor) -> bool {
        self.device_ptr() == other.device_ptr()
    }

    /// Logically expand size-1 dimensions to `target` with stride 0
    pub fn expand(&self, target: &[i64]) -> Result<Self> {
        if target.len() != self.sizes.len() {
            return Err(LanzarError::RankMismatch {
                buffer: "expand".to_string(),
                reason: format!(
                    "expand target rank {} does not match tensor rank {}",
                    target.len(),
                    self.sizes.len()
                ),
            });
        }
        let mut sizes = Vec::with_capacity(target.len());
        let mut strides = Vec::with_capacity(target.len());
        for ((&cur, &stride), &want) in
            self.sizes.iter().zip(self.strides.iter()).zip(target.iter())
        {
            if cur == want {
                sizes.push(cur);
                strides.push(stride);
            } else if cur == 1 {
                sizes.push(want);
                strides.push(0);
            } else {
                return Err(LanzarError::RankMismatch {
                    buffer: "expand".to_string(),
                    reason: format!("cannot expand dimension of size {cur} to {want}"),
                });
            }
        }
        Ok(Self { storage: self.storage.clone(), sizes, strides, dtype: self.dtype })
    }

    /// Read the backing allocation to the host (crate-owned storage
    /// only; caller-owned storage is read by the caller)
    pub fn copy_to_host(&self, ctx: &DeviceContext) -> Result<Vec<u8>> {
        match &self.storage {
            TensorStorage::Owned(buffer) => buffer.copy_to_host(ctx),
            TensorStorage::External(_) => Err(LanzarError::InvalidProgram(
                "cannot read caller-owned storage through the executor".to_string(),
            )),
        }
    }

    /// Fill with the typed NaN sentinel (debug policy)
    pub fn fill_with_nan(&mut self, ctx: &DeviceContext) -> Result<()> {
        let pattern = nan_sentinel_bytes(self.dtype)?;
        match &mut self.storage {
            TensorStorage::Owned(buffer) => {
                let buffer = Arc::get_mut(buffer).ok_or_else(|| {
                    LanzarError::InvalidProgram(
                        "cannot NaN-fill a buffer that is already shared".to_string(),
                    )
                })?;
                buffer.fill_pattern(ctx, &pattern)
            }
            TensorStorage::External(_) => Err(LanzarError::InvalidProgram(
                "cannot NaN-fill caller-owned storage".to_string(),
            )),
        }
    }
}

/// Per-element sentinel written by the NaN-fill debug policy
pub fn nan_sentinel_bytes(dtype: DataType) -> Result<Vec<u8>> {
    let bytes = match dtype {
        DataType::UInt8 => vec![0xFF],
        DataType::Int8 => vec![0x7F],
        DataType::Int16 => 0x7FFFi16.to_ne_bytes().to_vec(),
        DataType::Int32 => 0x7FFF_FFFFi32.to_ne_bytes().to_vec(),
        DataType::Int64 => 0x7FFF_FFFF_FFFF_FFFFi64.to_ne_bytes().to_vec(),
        DataType::Bool => vec![1],
        DataType::Half => half::f16::NAN.to_ne_bytes().to_vec(),
        DataType::BFloat16 => half::bf16::NAN.to_ne_bytes().to_vec(),
        DataType::Float => f32::NAN.to_ne_bytes().to_vec(),
        DataType::Double => f64::NAN.to_ne_bytes().to_vec(),
        DataType::ComplexFloat => {
            let mut v = f32::NAN.to_ne_bytes().to_vec();
            v.extend_from_slice(&f32::NAN.to_ne_bytes());
            v
        }
        DataType::ComplexDouble => {
            let mut v = f64::NAN.to_ne_bytes().to_vec();
            v.extend_from_slice(&f64::NAN.to_ne_bytes());
            v
        }
        DataType::Index => {
            return Err(LanzarError::UnknownDtype { dtype: dtype.to_string() });
        }
    };
    Ok(bytes)
}

/// Derive a tensor through its host-evaluable definition
///
/// Resolves view chains recursively; the result shares the source's
/// storage and carries this view's inferred sizes and strides.
pub fn evaluate_tensor_view(
    fusion: &Fusion,
    tensor: TensorId,
    ee: &ExpressionEvaluator<'_>,
) -> Result<TensorArg> {
    if let Some(bound) = ee.tensor(tensor) {
        return Ok(bound.clone());
    }
    let tv = fusion.tensor_view(tensor);
    match &tv.definition {
        Some(TensorDef::ViewOf { source }) => {
            let source_arg = evaluate_tensor_view(fusion, *source, ee)?;
            let (sizes, strides) = shape::infer_shape_of_output(fusion, tensor, ee)?;
            Ok(TensorArg {
                ptr: source_arg.ptr,
                sizes,
                strides,
                dtype: tv.dtype,
                on_device: source_arg.on_device,
            })
        }
        None => Err(LanzarError::InvalidProgram(format!(
            "{} cannot be evaluated on the host: it has no evaluable definition",
            tv.name
        ))),
    }
}

/// Allocate (or resolve) one fusion output
fn allocate_output(
    fusion: &Fusion,
    out_index: usize,
    info: &GlobalBufferInfo,
    ctx: &DeviceContext,
    ee: &ExpressionEvaluator<'_>,
    materialized: &HashMap<TensorId, DeviceTensor>,
    index_type: IndexType,
) -> Result<DeviceTensor> {
    let output = &fusion.outputs[out_index];
    let tv = fusion.tensor_view(output.tensor);

    // A fusion may list the same tensor as an output twice
    if let Some(existing) = materialized.get(&output.tensor) {
        return Ok(existing.clone());
    }

    let aliased = match output.alias.aliased_io {
        Some(aliased) => {
            let is_io = fusion.inputs.iter().any(|i| matches!(i, crate::ir::FusionInput::Tensor(t) if *t == aliased))
                || fusion.outputs.iter().any(|o| o.tensor == aliased);
            if !is_io {
                return Err(LanzarError::InvalidProgram(format!(
                    "{} is expected to be a fusion input/output; evaluating an intermediate \
                     tensor may involve GPU computation to materialize it",
                    fusion.tensor_view(aliased).name
                )));
            }
            Some(evaluate_tensor_view(fusion, aliased, ee)?)
        }
        None => None,
    };

    match output.alias.mode {
        AllocationMode::New => {
            let mut tensor = DeviceTensor::empty_strided(
                ctx,
                info.sizes.clone(),
                info.strides.clone(),
                info.dtype,
                index_type,
            )?;
            if options::should_fill_allocation_with_nan() {
                tensor.fill_with_nan(ctx)?;
            }
            Ok(tensor)
        }
        // Unlike Evaluate, the aliased tensor is used directly: it may
        // hold different data from what evaluation would produce, e.g.
        // an updated running mean.
        AllocationMode::ReuseBuffer => {
            let aliased = aliased.ok_or_else(|| {
                LanzarError::InvalidProgram(format!(
                    "{} reuses another buffer but declares no alias target",
                    tv.name
                ))
            })?;
            Ok(DeviceTensor::external(&aliased))
        }
        AllocationMode::Evaluate => {
            let out_arg = evaluate_tensor_view(fusion, output.tensor, ee)?;
            if let Some(aliased) = aliased {
                if out_arg.ptr != aliased.ptr {
                    return Err(LanzarError::InvalidProgram(format!(
                        "failed to evaluate {} as an alias of the declared target",
                        tv.name
                    )));
                }
                if out_arg.sizes != info.sizes {
                    return Err(LanzarError::RankMismatch {
                        buffer: tv.name.clone(),
                        reason: format!(
                            "evaluated sizes {:?} do not match inferred sizes {:?}",
                            out_arg.sizes, info.sizes
                        ),
                    });
                }
            }
            Ok(DeviceTensor::external(&out_arg))
        }
    }
}

/// Allocate every fusion output, aliased outputs after the tensors they
/// alias, binding each result into the evaluator.
pub fn allocate_outputs(
    fusion: &Fusion,
    output_infos: &[GlobalBufferInfo],
    ctx: &DeviceContext,
    ee: &mut ExpressionEvaluator<'_>,
    index_type: IndexType,
) -> Result<Vec<DeviceTensor>> {
    let num_outs = fusion.outputs.len();
    if output_infos.len() != num_outs {
        return Err(LanzarError::InvalidProgram(format!(
            "{} output infos for {} fusion outputs",
            output_infos.len(),
            num_outs
        )));
    }

    // Compute aliases after allocating non-aliases; the order among
    // aliases themselves is arbitrary because evaluation recurses.
    let mut order: Vec<usize> = (0..num_outs).collect();
    order.sort_by_key(|&i| fusion.outputs[i].alias.mode != AllocationMode::New);

    let mut materialized: HashMap<TensorId, DeviceTensor> = HashMap::new();
    let mut out_tensors: Vec<Option<DeviceTensor>> = vec![None; num_outs];
    for out_index in order {
        let tensor = allocate_output(
            fusion,
            out_index,
            &output_infos[out_index],
            ctx,
            ee,
            &materialized,
            index_type,
        )?;
        // Bind so duplicated outputs map to one tensor and aliasing
        // outputs can evaluate against it
        ee.bind_tensor(fusion.outputs[out_index].tensor, tensor.arg());
        materialized.insert(fusion.outputs[out_index].tensor, tensor.clone());
        out_tensors[out_index] = Some(tensor);
    }
    out_tensors
        .into_iter()
        .map(|t| {
            t.ok_or_else(|| {
                LanzarError::InvalidProgram("output allocation skipped an output".to_string())
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalValue;
    use crate::ir::{IterDomain, TensorView};

    #[test]
    fn test_nan_sentinels() {
        assert_eq!(nan_sentinel_bytes(DataType::UInt8).expect("u8"), vec![0xFF]);
        assert_eq!(nan_sentinel_bytes(DataType::Bool).expect("bool"), vec![1]);
        let half = nan_sentinel_bytes(DataType::Half).expect("half");
        assert_eq!(half.len(), 2);
        let f = nan_sentinel_bytes(DataType::Float).expect("f32");
        assert!(f32::from_ne_bytes([f[0], f[1], f[2], f[3]]).is_nan());
        let c = nan_sentinel_bytes(DataType::ComplexDouble).expect("c128");
        assert_eq!(c.len(), 16);
        assert!(matches!(
            nan_sentinel_bytes(DataType::Index),
            Err(LanzarError::UnknownDtype { .. })
        ));
    }

    #[test]
    fn test_span_elements() {
        assert_eq!(span_elements(&[2, 3], &[3, 1]), 6);
        // Transposed view still spans the full extent
        assert_eq!(span_elements(&[3, 4], &[1, 3]), 12);
        // Expanded dimension adds nothing
        assert_eq!(span_elements(&[5, 7], &[0, 1]), 7);
        assert_eq!(span_elements(&[0, 7], &[1, 1]), 0);
    }

    #[test]
    fn test_external_tensor_expand() {
        let arg = TensorArg {
            ptr: 0x100,
            sizes: vec![1, 7],
            strides: vec![7, 1],
            dtype: DataType::Float,
            on_device: true,
        };
        let t = DeviceTensor::external(&arg);
        let e = t.expand(&[5, 7]).expect("expand");
        assert_eq!(e.sizes(), &[5, 7]);
        assert_eq!(e.strides(), &[0, 1]);
        assert!(e.is_alias_of(&t));
        assert!(t.expand(&[5, 3]).is_err());
    }

    #[test]
    fn test_evaluate_tensor_view_chain() {
        // T1 = view(T0), T2 = view(T1): evaluating T2 reaches T0's
        // storage through the chain.
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let e1 = fusion.named("i1");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let d1 = fusion.domain(IterDomain::iteration(e1));
        let t0 = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d0, d1]));
        let mut v1 = TensorView::contiguous("T1", DataType::Float, vec![d1, d0]);
        v1.definition = Some(TensorDef::ViewOf { source: t0 });
        let t1 = fusion.tensor(v1);
        let mut v2 = TensorView::contiguous("T2", DataType::Float, vec![d1, d0]);
        v2.definition = Some(TensorDef::ViewOf { source: t1 });
        let t2 = fusion.tensor(v2);

        let mut ee = ExpressionEvaluator::new(&fusion);
        ee.bind_scalar(e0, EvalValue::Int(2)).expect("bind");
        ee.bind_scalar(e1, EvalValue::Int(3)).expect("bind");
        ee.bind_tensor(
            t0,
            TensorArg {
                ptr: 0xab00,
                sizes: vec![2, 3],
                strides: vec![3, 1],
                dtype: DataType::Float,
                on_device: true,
            },
        );

        let arg = evaluate_tensor_view(&fusion, t2, &ee).expect("evaluate");
        assert_eq!(arg.ptr, 0xab00);
        assert_eq!(arg.sizes, vec![3, 2]);
    }

    #[test]
    fn test_evaluate_without_definition_fails() {
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let t0 = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d0]));
        let ee = ExpressionEvaluator::new(&fusion);
        assert!(evaluate_tensor_view(&fusion, t0, &ee).is_err());
    }
}
