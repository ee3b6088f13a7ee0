//! Kernel compilation and recompilation
//!
//! Holds the structured source and the compiled artefact together with
//! the block-size and register-ceiling high-water marks. A kernel is
//! recompiled only when a launch demands a larger block than it was
//! compiled for, or a different register ceiling. The compiler also
//! owns the shared-memory attribute lifecycle: cached driver queries,
//! the device-limit validation, and the cooperative-launch capacity
//! check.

use crate::driver::{self, DeviceContext, KernelFunction};
use crate::error::{LanzarError, Result};
use crate::ir::IndexType;
use crate::launch::LaunchParams;
use crate::options::{self, DumpOption};
use crate::source;

/// Static shared-memory limit for lowered buffers, in bytes
const MAX_STATIC_SMEM: i64 = 48 * 1024;

/// Compilation knobs handed in by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileParams {
    /// Index type override; must be consistent with the arguments
    pub index_type: Option<IndexType>,
    /// Register-count ceiling passed to the compiler
    pub maxrregcount: Option<u32>,
    /// Magic-zero workaround; disabled when TMA is present
    pub enable_magic_zero: bool,
}

impl Default for CompileParams {
    fn default() -> Self {
        Self { index_type: None, maxrregcount: None, enable_magic_zero: true }
    }
}

/// One compiled artefact
#[derive(Debug)]
pub struct CompiledKernel {
    /// Loaded function handle
    pub function: KernelFunction,
    /// PTX text the module was loaded from
    pub ptx: String,
    /// Entry-point name
    pub kernel_name: String,
    /// Compiler flags used
    pub compile_args: Vec<String>,
    /// Block size the kernel was compiled for
    pub block_size: i64,
}

/// Compiler state for one fusion's kernel
#[derive(Debug)]
pub struct KernelCompiler {
    kernel_body: String,
    kernel_name: String,
    /// Identifier used for dump files, `lanzar_f<F>_c<C>_r<R>_g<G>`
    kernel_id: String,
    /// Global fusion number, indexes `LANZAR_EXTERNAL_SRC`
    fusion_number: u64,
    index_type: IndexType,
    device_smem_limit: i64,
    compiled: Option<CompiledKernel>,
    block_size_high_water_mark: i64,
    maxrregcount_high_water_mark: Option<u32>,
    /// Cached `CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES`
    available_dynamic_smem: Option<i64>,
    /// Cached `CU_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES`
    static_smem: Option<i64>,
}

impl KernelCompiler {
    /// Compiler for one generated kernel body
    #[must_use]
    pub fn new(
        kernel_body: String,
        kernel_name: String,
        kernel_id: String,
        fusion_number: u64,
        index_type: IndexType,
        device_smem_limit: i64,
    ) -> Self {
        Self {
            kernel_body,
            kernel_name,
            kernel_id,
            fusion_number,
            index_type,
            device_smem_limit,
            compiled: None,
            block_size_high_water_mark: 1,
            maxrregcount_high_water_mark: None,
            available_dynamic_smem: None,
            static_smem: None,
        }
    }

    /// Entry-point name
    #[must_use]
    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Dump-file identifier
    #[must_use]
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Block-size high-water mark
    #[must_use]
    pub fn block_size_high_water_mark(&self) -> i64 {
        self.block_size_high_water_mark
    }

    /// Register-ceiling high-water mark
    #[must_use]
    pub fn maxrregcount_high_water_mark(&self) -> Option<u32> {
        self.maxrregcount_high_water_mark
    }

    /// Whether an artefact is loaded
    #[must_use]
    pub fn has_compiled_kernel(&self) -> bool {
        self.compiled.is_some()
    }

    /// The loaded artefact
    #[must_use]
    pub fn compiled(&self) -> Option<&CompiledKernel> {
        self.compiled.as_ref()
    }

    fn compiled_or_err(&self) -> Result<&CompiledKernel> {
        self.compiled.as_ref().ok_or_else(|| {
            LanzarError::InvalidProgram("no compiled kernel is loaded".to_string())
        })
    }

    /// Structured source: the external override when configured, the
    /// generated code otherwise. Dumps per `LANZAR_DUMP`.
    #[must_use]
    pub fn structured_code(&self) -> String {
        let code = source::structured_code_from_external_files(self.fusion_number)
            .unwrap_or_else(|| source::structured_code(&self.kernel_body, self.index_type));
        source::maybe_dump_source(&code, &self.kernel_body, &self.kernel_name, &self.kernel_id);
        code
    }

    fn build_artifact(
        &self,
        ctx: &DeviceContext,
        compile_params: CompileParams,
        block_size: i64,
    ) -> Result<CompiledKernel> {
        let code = self.structured_code();
        let capability = ctx.properties().compute_capability;
        let (ptx, compile_args) =
            driver::compile_to_ptx(&code, capability, compile_params.maxrregcount)?;
        if options::is_dump_enabled(DumpOption::Ptx) {
            tracing::info!(kernel = %self.kernel_name, "\n{ptx}");
        }
        let function = driver::load_kernel(ctx, &ptx, &self.kernel_name)?;
        Ok(CompiledKernel {
            function,
            ptx,
            kernel_name: self.kernel_name.clone(),
            compile_args,
            block_size,
        })
    }

    /// First compilation. `block_size` comes from launch-parameter
    /// inference when arguments were provided; without it the kernel is
    /// compiled for a single thread and recompiled at first use.
    pub fn compile(
        &mut self,
        ctx: &DeviceContext,
        compile_params: CompileParams,
        block_size: Option<i64>,
    ) -> Result<()> {
        let block_size = block_size.unwrap_or(1);
        if block_size <= 0 {
            return Err(LanzarError::InvalidProgram(format!(
                "launch param inferred block size {block_size}"
            )));
        }
        self.block_size_high_water_mark = block_size.max(self.block_size_high_water_mark);
        self.maxrregcount_high_water_mark = compile_params.maxrregcount;
        let artifact =
            self.build_artifact(ctx, compile_params, self.block_size_high_water_mark)?;
        self.commit(artifact);
        Ok(())
    }

    /// Load a previously compiled artefact (deserialization path)
    pub fn restore(
        &mut self,
        ctx: &DeviceContext,
        ptx: &str,
        compile_args: Vec<String>,
        block_size: i64,
        maxrregcount: Option<u32>,
    ) -> Result<()> {
        let function = driver::load_kernel(ctx, ptx, &self.kernel_name)?;
        self.block_size_high_water_mark = block_size.max(self.block_size_high_water_mark);
        self.maxrregcount_high_water_mark = maxrregcount;
        self.commit(CompiledKernel {
            function,
            ptx: ptx.to_string(),
            kernel_name: self.kernel_name.clone(),
            compile_args,
            block_size,
        });
        Ok(())
    }

    fn commit(&mut self, artifact: CompiledKernel) {
        self.compiled = Some(artifact);
        // Driver-query caches describe the previous artefact
        self.available_dynamic_smem = None;
        self.static_smem = None;
    }

    /// Recompile iff the launch demands a larger block than the current
    /// high-water mark or a different register ceiling.
    ///
    /// For cooperative kernels the fresh artefact is capacity-checked
    /// before it replaces the current one, so a failed check leaves the
    /// compiler (marks included) untouched.
    pub fn recompile_if_needed(
        &mut self,
        ctx: &DeviceContext,
        launch_params: &LaunchParams,
        compile_params: CompileParams,
        cooperative: bool,
    ) -> Result<()> {
        if launch_params.n_threads() <= self.block_size_high_water_mark
            && compile_params.maxrregcount == self.maxrregcount_high_water_mark
        {
            return Ok(());
        }
        let new_block_size = launch_params.n_threads();
        let artifact = self.build_artifact(ctx, compile_params, new_block_size)?;
        // Budget and capacity checks run against the candidate; only a
        // kernel that passes them replaces the current artefact.
        let static_size = artifact.function.static_smem_bytes()?;
        if static_size + launch_params.smem() >= self.device_smem_limit {
            return Err(LanzarError::SharedMemoryExceeded {
                dynamic: launch_params.smem(),
                static_size,
                required: static_size + launch_params.smem(),
                limit: self.device_smem_limit,
            });
        }
        if cooperative {
            // The dynamic-smem attribute must be raised before the
            // occupancy query or the check reports false positives
            ensure_smem_on(&artifact.function, launch_params.smem(), self.device_smem_limit)?;
            validate_cooperative_launch(&artifact.function, launch_params, ctx)?;
        }
        self.block_size_high_water_mark = new_block_size;
        self.maxrregcount_high_water_mark = compile_params.maxrregcount;
        self.commit(artifact);
        Ok(())
    }

    /// Compiled static shared-memory usage, cached
    pub fn static_smem_size(&mut self) -> Result<i64> {
        if let Some(size) = self.static_smem {
            return Ok(size);
        }
        let size = self.compiled_or_err()?.function.static_smem_bytes()?;
        self.static_smem = Some(size);
        Ok(size)
    }

    /// Available dynamic shared memory of the loaded function, cached
    pub fn available_dynamic_smem_size(&mut self) -> Result<i64> {
        if let Some(size) = self.available_dynamic_smem {
            return Ok(size);
        }
        let size = self.compiled_or_err()?.function.max_dynamic_smem_bytes()?;
        self.available_dynamic_smem = Some(size);
        Ok(size)
    }

    /// Check that static plus requested dynamic fits the device limit
    pub fn validate_dynamic_smem_size(&mut self, dynamic_smem_size: i64) -> Result<()> {
        let static_size = self.static_smem_size()?;
        if static_size + dynamic_smem_size >= self.device_smem_limit {
            return Err(LanzarError::SharedMemoryExceeded {
                dynamic: dynamic_smem_size,
                static_size,
                required: static_size + dynamic_smem_size,
                limit: self.device_smem_limit,
            });
        }
        Ok(())
    }

    /// Raise the function's dynamic shared-memory attribute to at least
    /// `dynamic_smem_size`, validating the budget first.
    pub fn ensure_available_dynamic_smem_size(&mut self, dynamic_smem_size: i64) -> Result<i64> {
        if dynamic_smem_size > self.available_dynamic_smem_size()? {
            self.validate_dynamic_smem_size(dynamic_smem_size)?;
            self.compiled_or_err()?.function.set_max_dynamic_smem_bytes(dynamic_smem_size)?;
            self.available_dynamic_smem = Some(dynamic_smem_size);
        }
        self.available_dynamic_smem_size()
    }

    /// Capacity-check a cooperative launch against the loaded artefact
    pub fn validate_cooperative_launch(
        &mut self,
        ctx: &DeviceContext,
        launch_params: &LaunchParams,
    ) -> Result<()> {
        validate_cooperative_launch(&self.compiled_or_err()?.function, launch_params, ctx)
    }

    /// Early static shared-memory budget check against the lowered
    /// allocations (run before any compilation)
    pub fn validate_static_smem(static_smem_size: i64) -> Result<()> {
        if static_smem_size >= MAX_STATIC_SMEM {
            return Err(LanzarError::SharedMemoryExceeded {
                dynamic: 0,
                static_size: static_smem_size,
                required: static_smem_size,
                limit: MAX_STATIC_SMEM,
            });
        }
        Ok(())
    }
}

fn ensure_smem_on(function: &KernelFunction, needed: i64, limit: i64) -> Result<()> {
    if needed > function.max_dynamic_smem_bytes()? {
        let static_size = function.static_smem_bytes()?;
        if static_size + needed >= limit {
            return Err(LanzarError::SharedMemoryExceeded {
                dynamic: needed,
                static_size,
                required: static_size + needed,
                limit,
            });
        }
        function.set_max_dynamic_smem_bytes(needed)?;
    }
    Ok(())
}

/// All blocks of a cooperative launch must be resident at once
fn validate_cooperative_launch(
    function: &KernelFunction,
    launch_params: &LaunchParams,
    ctx: &DeviceContext,
) -> Result<()> {
    let blocks_per_sm = function
        .occupancy_max_active_blocks(launch_params.n_threads(), launch_params.smem())?;
    let sm_count = ctx.properties().multiprocessor_count;
    let grid = launch_params.n_blocks();
    if blocks_per_sm * sm_count < grid {
        return Err(LanzarError::CooperativeTooLarge { grid, blocks_per_sm, sm_count });
    }
    Ok(())
}
