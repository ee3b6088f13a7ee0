//! Raw-kernel testing surface
//!
//! Compiles caller-provided kernel text (structured or bare) and
//! launches it against plain tensor descriptors, bypassing the fusion
//! pipeline. Used by tests and by tooling that benchmarks hand-written
//! kernels.

use std::ffi::c_void;
use std::time::Instant;

use crate::args::{self, TensorArg};
use crate::driver::{self, DeviceContext, KernelFunction};
use crate::error::Result;
use crate::evaluator::EvalValue;
use crate::ir::IndexType;
use crate::launch::LaunchParams;
use crate::source;

/// A kernel compiled from raw source text
pub struct RtcKernel {
    ctx: DeviceContext,
    function: KernelFunction,
    name: String,
}

impl RtcKernel {
    /// Compile `code` for `device_index`. Bare kernel bodies are
    /// wrapped in the structured preamble first; pass `structured =
    /// true` when the code is already self-contained.
    pub fn compile(
        code: &str,
        name: &str,
        structured: bool,
        index_type: IndexType,
        device_index: usize,
    ) -> Result<Self> {
        let ctx = DeviceContext::new(device_index)?;
        let scode = if structured {
            code.to_string()
        } else {
            source::structured_code(code, index_type)
        };
        let (ptx, _compile_args) =
            driver::compile_to_ptx(&scode, ctx.properties().compute_capability, None)?;
        let function = driver::load_kernel(&ctx, &ptx, name)?;
        Ok(Self { ctx, function, name: name.to_string() })
    }

    /// Kernel entry-point name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launch against plain tensor descriptors and return the elapsed
    /// wall time in milliseconds (submission through completion).
    pub fn run(
        &self,
        launch_params: &LaunchParams,
        tensors: &[TensorArg],
        index_type: IndexType,
    ) -> Result<f64> {
        let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(tensors.len());
        for tensor in tensors {
            buffers.push(args::encode_value(&EvalValue::Tensor(tensor.clone()), index_type)?);
        }
        let arg_ptrs: Vec<*mut c_void> =
            buffers.iter_mut().map(|buf| buf.as_mut_ptr().cast::<c_void>()).collect();

        let spec = driver::launch_spec(launch_params, false)?;
        self.ctx.synchronize()?;
        let started = Instant::now();
        // SAFETY: arg_ptrs points into `buffers`, alive across the call
        unsafe {
            driver::launch(&self.ctx, &self.function, spec, &arg_ptrs)?;
        }
        self.ctx.synchronize()?;
        Ok(started.elapsed().as_secs_f64() * 1e3)
    }
}
