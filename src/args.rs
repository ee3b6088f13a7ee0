//! Kernel arguments and their byte-level marshalling
//!
//! A GPU-tensor parameter travels as `{pointer, shape[rank],
//! stride[rank]}` where shape and stride elements have the kernel's
//! index width (4 or 8 bytes). The per-parameter byte buffers are built
//! once per executor entry; later calls with the same rank rewrite the
//! pointer/shape/stride bytes in place.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{LanzarError, Result};
use crate::evaluator::EvalValue;
use crate::ir::{DataType, IndexType};

/// Descriptor of a tensor argument: base pointer plus logical sizes and
/// allocation strides
#[derive(Debug, Clone, PartialEq)]
pub struct TensorArg {
    /// Device (or host) base address
    pub ptr: u64,
    /// Logical sizes
    pub sizes: Vec<i64>,
    /// Allocation strides
    pub strides: Vec<i64>,
    /// Element type
    pub dtype: DataType,
    /// Whether the storage lives on the device
    pub on_device: bool,
}

impl TensorArg {
    /// Number of dimensions
    #[must_use]
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Element count
    #[must_use]
    pub fn numel(&self) -> i64 {
        self.sizes.iter().product()
    }

    /// Smallest index type able to address every element of this tensor
    #[must_use]
    pub fn required_index_type(&self) -> IndexType {
        let max_i32 = i64::from(i32::MAX);
        if self.numel() > max_i32 {
            return IndexType::Int64;
        }
        // Largest linear offset reachable through the strides
        let mut max_offset = 0i64;
        for (&size, &stride) in self.sizes.iter().zip(self.strides.iter()) {
            if size > 0 {
                max_offset += (size - 1) * stride.abs();
            }
        }
        if max_offset > max_i32 {
            IndexType::Int64
        } else {
            IndexType::Int32
        }
    }
}

/// Holder of one call's arguments, in fusion-input order, extended with
/// outputs and intermediates as they are materialized
#[derive(Debug, Clone, Default)]
pub struct KernelArgumentHolder {
    args: Vec<EvalValue>,
    device_index: usize,
    cache_id: Option<u64>,
}

impl KernelArgumentHolder {
    /// Empty holder for device 0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Holder seeded with the fusion inputs
    #[must_use]
    pub fn from_values(args: Vec<EvalValue>) -> Self {
        Self { args, device_index: 0, cache_id: None }
    }

    /// Append one argument
    pub fn push(&mut self, value: EvalValue) {
        self.args.push(value);
    }

    /// Number of arguments held
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the holder is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument accessor
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&EvalValue> {
        self.args.get(index)
    }

    /// Iterate over the held arguments
    pub fn iter(&self) -> impl Iterator<Item = &EvalValue> {
        self.args.iter()
    }

    /// Device the arguments live on
    #[must_use]
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// Set the device the arguments live on
    pub fn set_device_index(&mut self, device_index: usize) {
        self.device_index = device_index;
    }

    /// Opaque input-shape cache key, if assigned
    #[must_use]
    pub fn cache_id(&self) -> Option<u64> {
        self.cache_id
    }

    /// Assign the opaque input-shape cache key
    pub fn set_cache_id(&mut self, id: u64) {
        self.cache_id = Some(id);
    }

    /// Hash of the argument shapes (not data, not pointers), usable as
    /// the input-shape cache key
    #[must_use]
    pub fn shape_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for arg in &self.args {
            match arg {
                EvalValue::Tensor(t) => {
                    0u8.hash(&mut hasher);
                    t.sizes.hash(&mut hasher);
                    t.strides.hash(&mut hasher);
                }
                EvalValue::Int(v) => {
                    1u8.hash(&mut hasher);
                    v.hash(&mut hasher);
                }
                EvalValue::Bool(b) => {
                    2u8.hash(&mut hasher);
                    b.hash(&mut hasher);
                }
                EvalValue::Double(d) => {
                    3u8.hash(&mut hasher);
                    d.to_bits().hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }

    /// Widest index type any held tensor demands
    #[must_use]
    pub fn smallest_index_type(&self) -> IndexType {
        for arg in &self.args {
            if let EvalValue::Tensor(t) = arg {
                if t.required_index_type() == IndexType::Int64 {
                    return IndexType::Int64;
                }
            }
        }
        IndexType::Int32
    }

    /// Total bytes of all held tensors (profiling accounting)
    #[must_use]
    pub fn total_tensor_bytes(&self, index_type: IndexType) -> i64 {
        self.args
            .iter()
            .filter_map(|a| a.as_tensor())
            .map(|t| t.numel() * t.dtype.size_in_bytes(index_type) as i64)
            .sum()
    }
}

/// Byte size of a GPU-tensor parameter buffer at the given rank
#[must_use]
pub fn tensor_arg_size(rank: usize, index_type: IndexType) -> usize {
    std::mem::size_of::<u64>() + 2 * rank * index_type.size_in_bytes()
}

fn write_index(buf: &mut [u8], offset: usize, value: i64, index_type: IndexType) {
    match index_type {
        IndexType::Int64 => {
            buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
        }
        IndexType::Int32 => {
            // Host shapes/strides are 64-bit; the kernel was compiled
            // for 32-bit indexing, so each element is downcast.
            let v = value as i32;
            buf[offset..offset + 4].copy_from_slice(&v.to_ne_bytes());
        }
    }
}

/// Rewrite the pointer/shape/stride bytes of an existing tensor
/// parameter buffer in place.
pub fn rewrite_tensor_arg(buf: &mut [u8], arg: &TensorArg, index_type: IndexType) -> Result<()> {
    let expected = tensor_arg_size(arg.rank(), index_type);
    if buf.len() != expected {
        return Err(LanzarError::InvalidProgram(format!(
            "tensor parameter buffer holds {} bytes but rank {} needs {expected}",
            buf.len(),
            arg.rank()
        )));
    }
    let w = index_type.size_in_bytes();
    buf[0..8].copy_from_slice(&arg.ptr.to_ne_bytes());
    let shape_base = 8;
    let stride_base = 8 + arg.sizes.len() * w;
    for (i, &size) in arg.sizes.iter().enumerate() {
        write_index(buf, shape_base + i * w, size, index_type);
    }
    for (i, &stride) in arg.strides.iter().enumerate() {
        write_index(buf, stride_base + i * w, stride, index_type);
    }
    Ok(())
}

/// Serialize one kernel argument into its parameter byte buffer
pub fn encode_value(value: &EvalValue, index_type: IndexType) -> Result<Vec<u8>> {
    match value {
        EvalValue::Tensor(arg) => {
            if !arg.on_device {
                return Err(LanzarError::Unsupported {
                    operation: "encode_value".into(),
                    reason: "host tensors cannot be passed to the kernel".into(),
                });
            }
            let mut buf = vec![0u8; tensor_arg_size(arg.rank(), index_type)];
            rewrite_tensor_arg(&mut buf, arg, index_type)?;
            Ok(buf)
        }
        // Integer scalars travel at the kernel index width
        EvalValue::Int(v) => {
            let mut buf = vec![0u8; index_type.size_in_bytes()];
            write_index(&mut buf, 0, *v, index_type);
            Ok(buf)
        }
        EvalValue::Bool(b) => Ok(vec![u8::from(*b)]),
        EvalValue::Double(d) => Ok(d.to_ne_bytes().to_vec()),
    }
}
