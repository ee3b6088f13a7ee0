//! Fusion executor
//!
//! Per-invocation orchestrator: binds inputs, consults or initializes a
//! per-cache-key executor entry, triggers recompilation when the launch
//! outgrows the compiled kernel, builds the argument buffer, and issues
//! the launch. Host-side work is synchronous on the calling thread; the
//! kernel itself runs asynchronously on the device stream. One executor
//! instance per calling thread.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::allocate::{self, DeviceTensor, GlobalBufferInfo};
use crate::args::{self, KernelArgumentHolder, TensorArg};
use crate::compile::{CompileParams, KernelCompiler};
use crate::driver::{self, DeviceContext};
use crate::error::{LanzarError, Result};
use crate::evaluator::{EvalValue, ExpressionEvaluator};
use crate::ir::{
    DataType, Fusion, FusionInput, IndexType, KernelParam, LoweredKernel, TensorId,
};
use crate::launch::{self, LaunchParams};
use crate::options::{self, DumpOption};
use crate::pool;
use crate::shape;
use crate::smem;

/// Identifiers naming one compiled fusion segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorIds {
    /// Fusion id
    pub fusion_id: i64,
    /// Concretized fusion id
    pub concrete_id: i64,
    /// Runtime id
    pub runtime_id: i64,
    /// Segment group id
    pub group_id: i64,
}

impl ExecutorIds {
    /// Identifier used for dump files and diagnostics
    #[must_use]
    pub fn kernel_id(&self) -> String {
        format!(
            "lanzar_f{}_c{}_r{}_g{}",
            self.fusion_id, self.concrete_id, self.runtime_id, self.group_id
        )
    }
}

static GLOBAL_FUSION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of fusions compiled by this process so far
#[must_use]
pub fn global_fusion_count() -> u64 {
    GLOBAL_FUSION_COUNT.load(Ordering::Relaxed)
}

/// Hand-off for fusions that lower entirely to resharding
/// communications. Implemented by the distributed layer; this crate
/// only delegates.
pub trait CollectiveFallback: Send {
    /// Execute the communication-only fusion and produce its outputs
    fn post(&self, kernel: &LoweredKernel, args: &KernelArgumentHolder)
        -> Result<Vec<TensorArg>>;
}

/// Per-input-shape cache of launch parameters, buffer descriptors, and
/// the marshalled argument buffers
#[derive(Debug, Default)]
pub struct ExecutorEntry {
    /// Whether the entry has been initialized
    pub init: bool,
    /// Resolved launch parameters
    pub launch_params: LaunchParams,
    /// Output allocation descriptors
    pub outputs: Vec<GlobalBufferInfo>,
    /// Intermediate allocation descriptors
    pub intermediates: Vec<GlobalBufferInfo>,
    /// Per-parameter argument byte buffers
    args: Vec<Vec<u8>>,
    /// Pointers into `args`, what the launch call consumes
    arg_ptrs: Vec<*mut c_void>,
    /// Last evaluated value per non-tensor parameter; unchanged scalars
    /// are not re-serialized
    scalar_cache: Vec<Option<EvalValue>>,
}

/// Placeholder descriptor from the dry-run path: no storage attached
#[derive(Debug, Clone, PartialEq)]
pub struct TensorProxy {
    /// Inferred sizes
    pub sizes: Vec<i64>,
    /// Inferred strides
    pub strides: Vec<i64>,
    /// Element type, index resolved
    pub dtype: DataType,
}

/// The fusion executor
pub struct FusionExecutor {
    kernel: LoweredKernel,
    ids: ExecutorIds,
    /// `None` for host-evaluated fusions that never touch the device
    ctx: Option<DeviceContext>,
    compiler: Option<KernelCompiler>,
    warp_size: i64,
    resolved_index_type: IndexType,
    entries: HashMap<u64, ExecutorEntry>,
    /// Sticky: output shapes depend on non-tensor inputs, so the
    /// input-shape cache key cannot be trusted
    disable_parameter_cache: bool,
    collective: Option<Box<dyn CollectiveFallback>>,
}

impl std::fmt::Debug for FusionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionExecutor")
            .field("kernel", &self.kernel)
            .field("ids", &self.ids)
            .field("ctx", &self.ctx)
            .field("compiler", &self.compiler)
            .field("warp_size", &self.warp_size)
            .field("resolved_index_type", &self.resolved_index_type)
            .field("entries", &self.entries)
            .field("disable_parameter_cache", &self.disable_parameter_cache)
            .field("collective", &self.collective.is_some())
            .finish()
    }
}

impl FusionExecutor {
    /// Whether any CUDA device is usable
    #[must_use]
    pub fn is_available() -> bool {
        driver::is_available()
    }

    /// Number of visible CUDA devices
    #[must_use]
    pub fn num_devices() -> usize {
        driver::device_count()
    }

    /// Compile a lowered fusion for execution.
    ///
    /// Resolves the index type against the arguments (TMA forces
    /// 32-bit), validates device capability and lowered shared/local
    /// memory budgets, and JIT-compiles the kernel text. Host-evaluated
    /// fusions skip compilation entirely.
    pub fn compile_fusion(
        kernel: LoweredKernel,
        cargs: &KernelArgumentHolder,
        launch_constraints: &LaunchParams,
        mut compile_params: CompileParams,
        ids: ExecutorIds,
    ) -> Result<Self> {
        if kernel.fusion.outputs.is_empty() {
            return Err(LanzarError::InvalidProgram(
                "No output found for this kernel, aborting.".to_string(),
            ));
        }

        let disable_parameter_cache = output_shapes_depend_on_scalar_inputs(&kernel.fusion);

        if kernel.summary.is_expression_evaluated || kernel.summary.is_communication_only {
            return Ok(Self {
                resolved_index_type: kernel.index_type,
                kernel,
                ids,
                ctx: None,
                compiler: None,
                warp_size: 32,
                entries: HashMap::new(),
                disable_parameter_cache,
                collective: None,
            });
        }

        let fusion_number = GLOBAL_FUSION_COUNT.fetch_add(1, Ordering::Relaxed) + 1;

        // TMA operations are incompatible with the magic-zero trick
        if kernel.summary.has_cp_async_bulk {
            compile_params.enable_magic_zero = false;
        }
        resolve_index_type(&kernel, cargs, &mut compile_params)?;
        let resolved_index_type = compile_params.index_type.unwrap_or(kernel.index_type);

        let ctx = DeviceContext::new(cargs.device_index())?;
        let props = ctx.properties();

        let capability = props.compute_capability;
        if capability < kernel.summary.min_device_version {
            return Err(LanzarError::DeviceTooOld {
                actual_major: capability.0,
                actual_minor: capability.1,
                required_major: kernel.summary.min_device_version.0,
                required_minor: kernel.summary.min_device_version.1,
                reason: kernel.summary.min_device_version_reason.clone(),
            });
        }

        // No shared-memory tensors should be placed statically anymore,
        // but the path is kept validated.
        if !kernel.summary.static_smem_allocations.is_empty() {
            let static_evaluator = ExpressionEvaluator::new(&kernel.fusion);
            let static_size = smem::compute_shared_memory(
                &static_evaluator,
                &kernel.summary.static_smem_allocations,
                resolved_index_type,
                0,
            )?;
            KernelCompiler::validate_static_smem(static_size)?;
        }

        if kernel.summary.has_dynamic_local_memory_allocations {
            return Err(LanzarError::DynamicLocalAllocation {
                buffers: kernel.summary.dynamic_lmem_buffer_names.clone(),
            });
        }

        // With arguments available, infer the launch shape up front so
        // the first compilation already covers it.
        let mut block_size = None;
        let mut dynamic_smem = None;
        if !cargs.is_empty() {
            let mut ee = ExpressionEvaluator::new(&kernel.fusion);
            bind_all_inputs(&kernel.fusion, cargs, &mut ee)?;
            let launch_params = launch::compute_launch_params(
                &kernel,
                &mut ee,
                launch_constraints,
                props.warp_size,
                resolved_index_type,
            )?;
            block_size = Some(launch_params.n_threads());
            dynamic_smem = Some(launch_params.smem());
        }

        let mut compiler = KernelCompiler::new(
            kernel.kernel_body.clone(),
            kernel.kernel_name.clone(),
            ids.kernel_id(),
            fusion_number,
            resolved_index_type,
            props.max_shared_memory_per_block_optin,
        );
        compiler.compile(&ctx, compile_params, block_size)?;
        if let Some(dynamic_smem) = dynamic_smem {
            compiler.ensure_available_dynamic_smem_size(dynamic_smem)?;
        }

        Ok(Self {
            resolved_index_type,
            kernel,
            ids,
            ctx: Some(ctx),
            compiler: Some(compiler),
            warp_size: props.warp_size,
            entries: HashMap::new(),
            disable_parameter_cache,
            collective: None,
        })
    }

    /// The lowered kernel this executor runs
    #[must_use]
    pub fn kernel(&self) -> &LoweredKernel {
        &self.kernel
    }

    /// Segment identifiers
    #[must_use]
    pub fn ids(&self) -> ExecutorIds {
        self.ids
    }

    /// Index type the kernel was compiled with
    #[must_use]
    pub fn index_type(&self) -> IndexType {
        self.resolved_index_type
    }

    /// Whether a compiled artefact is loaded
    #[must_use]
    pub fn has_compiled_kernel(&self) -> bool {
        self.compiler.as_ref().is_some_and(KernelCompiler::has_compiled_kernel)
    }

    /// Install the distributed-collective fallback handler
    pub fn set_collective_fallback(&mut self, fallback: Box<dyn CollectiveFallback>) {
        self.collective = Some(fallback);
    }

    /// Execute the fusion. Outputs are allocated unless supplied.
    pub fn run(
        &mut self,
        cargs: &mut KernelArgumentHolder,
        launch_constraints: &LaunchParams,
        compile_params: CompileParams,
        outputs: Vec<DeviceTensor>,
    ) -> Result<Vec<DeviceTensor>> {
        let kernel = &self.kernel;
        let fusion = &kernel.fusion;
        if !(outputs.is_empty() || outputs.len() == fusion.outputs.len()) {
            return Err(LanzarError::InvalidProgram(format!(
                "provided number of outputs ({}) does not match fusion outputs ({})",
                outputs.len(),
                fusion.outputs.len()
            )));
        }

        // InputsBound
        let mut ee = ExpressionEvaluator::new(fusion);
        bind_all_inputs(fusion, cargs, &mut ee)?;

        if kernel.summary.is_expression_evaluated {
            return evaluate_fusion_outputs(fusion, cargs, &mut ee, outputs);
        }
        if kernel.summary.is_communication_only {
            let fallback = self.collective.as_ref().ok_or_else(|| LanzarError::Unsupported {
                operation: "run".to_string(),
                reason: "communication-only fusion without a collective fallback handler"
                    .to_string(),
            })?;
            let out = fallback.post(kernel, cargs)?;
            return Ok(out.iter().map(DeviceTensor::external).collect());
        }

        let ctx = self.ctx.as_ref().ok_or_else(|| {
            LanzarError::InvalidProgram("executor has no device context".to_string())
        })?;
        let compiler = self.compiler.as_mut().ok_or_else(|| {
            LanzarError::InvalidProgram("executor holds no compiled kernel".to_string())
        })?;

        validate_index_type(kernel, compile_params)?;

        if cargs.cache_id().is_some() && !outputs.is_empty() {
            return Err(LanzarError::InvalidProgram(
                "short-cut input cache is not compatible with pre-allocated output".to_string(),
            ));
        }

        if options::is_dump_enabled(DumpOption::FusionArgs) {
            dump_fusion_args(self.ids, cargs, launch_constraints, &outputs);
        }

        // EntryReady
        let mut temporary_entry = ExecutorEntry::default();
        let entry = match cargs.cache_id() {
            Some(id) if !self.disable_parameter_cache => self.entries.entry(id).or_default(),
            _ => &mut temporary_entry,
        };
        if !entry.init {
            initialize_executor_entry(
                kernel,
                &mut ee,
                launch_constraints,
                &outputs,
                self.warp_size,
                self.resolved_index_type,
                entry,
            )?;
        }

        // KernelReady
        let cooperative = kernel.summary.has_cooperative_grid_reduction;
        compiler.recompile_if_needed(ctx, &entry.launch_params, compile_params, cooperative)?;
        compiler.validate_dynamic_smem_size(entry.launch_params.smem())?;

        // Outputs: allocate only when not given
        let out_tensors = if outputs.is_empty() {
            allocate::allocate_outputs(
                fusion,
                &entry.outputs,
                ctx,
                &mut ee,
                self.resolved_index_type,
            )?
        } else {
            outputs
        };
        for (i, out) in out_tensors.iter().enumerate() {
            let out_tv = fusion.outputs[i].tensor;
            // Trivially forwarded outputs are placeholders; their input
            // binding stands.
            let forwarded = fusion
                .inputs
                .iter()
                .any(|input| matches!(input, FusionInput::Tensor(t) if *t == out_tv));
            if !forwarded {
                ee.bind_tensor(out_tv, out.arg());
            }
            cargs.push(EvalValue::Tensor(out.arg()));
        }

        // Intermediates, unexpanded first and expanded logically after
        let mut intermediates = Vec::with_capacity(entry.intermediates.len());
        let mut profile_buffer = None;
        for info in &entry.intermediates {
            let tensor = allocate_intermediate(ctx, info, self.resolved_index_type)?;
            cargs.push(EvalValue::Tensor(tensor.arg()));
            ee.bind_tensor(info.tensor, tensor.arg());
            if info.is_profile_buffer {
                profile_buffer = Some(tensor.clone());
            }
            intermediates.push(tensor);
        }

        // ArgsBuilt
        if entry.args.is_empty() {
            compute_args(kernel, entry, &ee, self.resolved_index_type)?;
        }
        recompute_args(kernel, entry, &ee, self.resolved_index_type)?;

        if options::is_dump_enabled(DumpOption::LaunchParam) {
            tracing::info!("{}", entry.launch_params);
        }
        if options::is_dump_enabled(DumpOption::KernelArgs) {
            dump_kernel_args(self.ids, &out_tensors, &intermediates, &entry.intermediates);
        }
        if options::is_dump_enabled(DumpOption::IndexType) {
            tracing::info!(index_type = %self.resolved_index_type, "kernel index type");
        }

        // Launched
        if !kernel.summary.is_empty_kernel {
            compiler.ensure_available_dynamic_smem_size(entry.launch_params.smem())?;
            if cooperative {
                compiler.validate_cooperative_launch(ctx, &entry.launch_params)?;
            }
            if options::is_dump_enabled(DumpOption::Occupancy) {
                dump_occupancy(ctx, compiler, &entry.launch_params);
            }
            let compiled = compiler.compiled().ok_or_else(|| {
                LanzarError::InvalidProgram("no compiled kernel is loaded".to_string())
            })?;
            let spec = driver::launch_spec(&entry.launch_params, cooperative)?;
            // SAFETY: arg_ptrs was rebuilt by recompute_args and points
            // into entry.args, which lives until after the launch call.
            unsafe {
                driver::launch(ctx, &compiled.function, spec, &entry.arg_ptrs)?;
            }
        }

        // Done: intermediates drop here; pooled zeroed buffers rejoin
        // the free lists before control returns to the caller.
        drop(intermediates);
        pool::release_borrowed();

        if options::kernel_profile() {
            if let Some(buffer) = profile_buffer {
                dump_profile_buffer(&buffer);
            }
        }

        Ok(out_tensors)
    }

    /// Dry-run path: inferred output descriptors, nothing allocated or
    /// launched.
    pub fn infer_output_sizes(
        fusion: &Fusion,
        cargs: &KernelArgumentHolder,
    ) -> Result<Vec<TensorProxy>> {
        let mut ee = ExpressionEvaluator::new(fusion);
        bind_all_inputs(fusion, cargs, &mut ee)?;
        let index_type = cargs.smallest_index_type();
        let mut proxies = Vec::with_capacity(fusion.outputs.len());
        for output in &fusion.outputs {
            let (sizes, strides) = shape::infer_shape_of_output(fusion, output.tensor, &ee)?;
            let dtype = fusion.tensor_view(output.tensor).dtype.resolve_index(index_type);
            proxies.push(TensorProxy { sizes, strides, dtype });
        }
        Ok(proxies)
    }

    /// Allocate outputs only, for callers that fill them themselves
    pub fn alloc_output_space(
        fusion: &Fusion,
        cargs: &KernelArgumentHolder,
        device_index: usize,
    ) -> Result<Vec<DeviceTensor>> {
        let mut ee = ExpressionEvaluator::new(fusion);
        bind_all_inputs(fusion, cargs, &mut ee)?;
        let index_type = IndexType::Int64;
        let output_infos = output_buffer_infos(fusion, &ee, index_type)?;
        let ctx = DeviceContext::new(device_index)?;
        allocate::allocate_outputs(fusion, &output_infos, &ctx, &mut ee, index_type)
    }

    /// Bytes of all tensor arguments (profiling accounting)
    #[must_use]
    pub fn input_bytes_processed(&self, cargs: &KernelArgumentHolder) -> i64 {
        cargs.total_tensor_bytes(self.resolved_index_type)
    }

    /// Bytes of the produced outputs (profiling accounting)
    #[must_use]
    pub fn output_bytes_processed(&self, outputs: &[DeviceTensor]) -> i64 {
        outputs
            .iter()
            .map(|t| {
                let arg = t.arg();
                arg.numel() * arg.dtype.size_in_bytes(self.resolved_index_type) as i64
            })
            .sum()
    }

    /// Snapshot of the persisted state: entries, marks, and the
    /// compiled artefact.
    pub fn to_state(&self) -> Result<ExecutorState> {
        let compiler = self.compiler.as_ref();
        let compiled = compiler.and_then(KernelCompiler::compiled).map(|c| CompiledKernelState {
            ptx: c.ptx.clone(),
            kernel_name: c.kernel_name.clone(),
            compile_args: c.compile_args.clone(),
            block_size: c.block_size,
        });
        Ok(ExecutorState {
            ids: self.ids,
            index_type: self.resolved_index_type,
            warp_size: self.warp_size,
            block_size_high_water_mark: compiler
                .map_or(1, KernelCompiler::block_size_high_water_mark),
            maxrregcount_high_water_mark: compiler
                .and_then(KernelCompiler::maxrregcount_high_water_mark),
            disable_parameter_cache: self.disable_parameter_cache,
            entries: self
                .entries
                .iter()
                .map(|(&key, entry)| {
                    (
                        key,
                        EntryState {
                            init: entry.init,
                            launch_params: entry.launch_params,
                            outputs: entry.outputs.clone(),
                            intermediates: entry.intermediates.clone(),
                        },
                    )
                })
                .collect(),
            compiled,
        })
    }

    /// Rebuild an executor from persisted state without recompiling.
    ///
    /// The lowered kernel must be the same one the state was taken
    /// from; the compiled PTX is re-loaded as is.
    pub fn from_state(
        kernel: LoweredKernel,
        state: ExecutorState,
        device_index: usize,
    ) -> Result<Self> {
        let fusion_number = GLOBAL_FUSION_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        let disable_parameter_cache = state.disable_parameter_cache;

        let mut entries = HashMap::new();
        for (key, entry) in state.entries {
            entries.insert(
                key,
                ExecutorEntry {
                    init: entry.init,
                    launch_params: entry.launch_params,
                    outputs: entry.outputs,
                    intermediates: entry.intermediates,
                    ..ExecutorEntry::default()
                },
            );
        }

        if kernel.summary.is_expression_evaluated || kernel.summary.is_communication_only {
            return Ok(Self {
                resolved_index_type: state.index_type,
                kernel,
                ids: state.ids,
                ctx: None,
                compiler: None,
                warp_size: state.warp_size,
                entries,
                disable_parameter_cache,
                collective: None,
            });
        }

        let ctx = DeviceContext::new(device_index)?;
        let props = ctx.properties();
        let mut compiler = KernelCompiler::new(
            kernel.kernel_body.clone(),
            kernel.kernel_name.clone(),
            state.ids.kernel_id(),
            fusion_number,
            state.index_type,
            props.max_shared_memory_per_block_optin,
        );
        if let Some(compiled) = state.compiled {
            compiler.restore(
                &ctx,
                &compiled.ptx,
                compiled.compile_args,
                compiled.block_size.max(state.block_size_high_water_mark),
                state.maxrregcount_high_water_mark,
            )?;
        }

        Ok(Self {
            resolved_index_type: state.index_type,
            kernel,
            ids: state.ids,
            ctx: Some(ctx),
            compiler: Some(compiler),
            warp_size: state.warp_size,
            entries,
            disable_parameter_cache,
            collective: None,
        })
    }

    /// Serialize the persisted state as JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.to_state()?)
            .map_err(|err| LanzarError::Serde(err.to_string()))
    }

    /// Rebuild from [`Self::to_json`] output
    pub fn from_json(kernel: LoweredKernel, json: &str, device_index: usize) -> Result<Self> {
        let state: ExecutorState =
            serde_json::from_str(json).map_err(|err| LanzarError::Serde(err.to_string()))?;
        Self::from_state(kernel, state, device_index)
    }
}

/// Persisted executor state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorState {
    /// Segment identifiers
    pub ids: ExecutorIds,
    /// Resolved kernel index type
    pub index_type: IndexType,
    /// Device warp size at compile time
    pub warp_size: i64,
    /// Block-size high-water mark
    pub block_size_high_water_mark: i64,
    /// Register-ceiling high-water mark
    pub maxrregcount_high_water_mark: Option<u32>,
    /// Sticky cache-disable flag
    pub disable_parameter_cache: bool,
    /// Executor entries keyed by input-shape cache id
    pub entries: Vec<(u64, EntryState)>,
    /// Compiled artefact, when one was loaded
    pub compiled: Option<CompiledKernelState>,
}

/// Persisted form of one executor entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryState {
    /// Whether the entry was initialized
    pub init: bool,
    /// Resolved launch parameters
    pub launch_params: LaunchParams,
    /// Output allocation descriptors
    pub outputs: Vec<GlobalBufferInfo>,
    /// Intermediate allocation descriptors
    pub intermediates: Vec<GlobalBufferInfo>,
}

/// Persisted form of the compiled artefact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledKernelState {
    /// PTX text
    pub ptx: String,
    /// Entry-point name
    pub kernel_name: String,
    /// Compiler flags used
    pub compile_args: Vec<String>,
    /// Block size the kernel was compiled for
    pub block_size: i64,
}

/// Bind every fusion input from the argument holder
fn bind_all_inputs(
    fusion: &Fusion,
    cargs: &KernelArgumentHolder,
    ee: &mut ExpressionEvaluator<'_>,
) -> Result<()> {
    if cargs.len() < fusion.inputs.len() {
        return Err(LanzarError::InvalidProgram(format!(
            "fusion expects {} inputs but {} arguments were provided",
            fusion.inputs.len(),
            cargs.len()
        )));
    }
    for (i, &input) in fusion.inputs.iter().enumerate() {
        let value = cargs.get(i).ok_or_else(|| {
            LanzarError::InvalidProgram(format!("missing argument {i}"))
        })?;
        ee.bind_input(input, value)?;
    }
    Ok(())
}

/// Outputs of a fusion whose logical extents transitively depend on a
/// non-tensor fusion input; the input-shape cache key only hashes
/// tensor shapes, so such fusions must bypass the cache.
fn output_shapes_depend_on_scalar_inputs(fusion: &Fusion) -> bool {
    let scalar_inputs: HashSet<_> = fusion
        .inputs
        .iter()
        .filter_map(|input| match input {
            FusionInput::Scalar(sid) => Some(*sid),
            FusionInput::Tensor(_) => None,
        })
        .collect();
    if scalar_inputs.is_empty() {
        return false;
    }
    for output in &fusion.outputs {
        let tv = fusion.tensor_view(output.tensor);
        for &did in &tv.logical {
            let id = fusion.iter_domain(did);
            if id.is_reduction() || id.is_stride() || id.is_device_dim() {
                continue;
            }
            let extent = if id.is_broadcast() && id.has_expanded_extent() {
                id.maybe_expanded_extent()
            } else {
                id.extent
            };
            if fusion.scalar_depends_on(extent, &scalar_inputs) {
                return true;
            }
        }
    }
    false
}

/// TMA and argument widths constrain the index type; resolve or reject.
fn resolve_index_type(
    kernel: &LoweredKernel,
    cargs: &KernelArgumentHolder,
    compile_params: &mut CompileParams,
) -> Result<()> {
    let has_cp_async_bulk = kernel.summary.has_cp_async_bulk;
    let arg_index_type = cargs.smallest_index_type();
    if let Some(requested) = compile_params.index_type {
        if requested == IndexType::Int32 && arg_index_type == IndexType::Int64 {
            return Err(LanzarError::IndexTypeConflict {
                reason: "compilation with int32 is requested but int64 is required for the \
                         arguments"
                    .to_string(),
            });
        }
        if has_cp_async_bulk && requested != IndexType::Int32 {
            return Err(LanzarError::IndexTypeConflict {
                reason: "compilation with int64 is requested but int32 is required because of \
                         TMA operations"
                    .to_string(),
            });
        }
    } else if arg_index_type == IndexType::Int64 {
        // A 32-bit argument set does not make 32-bit indexing safe for
        // the whole kernel, so the default is only overridden upward.
        if has_cp_async_bulk {
            return Err(LanzarError::IndexTypeConflict {
                reason: "compilation with int64 is required based on input arguments, but int32 \
                         is required because of TMA operations"
                    .to_string(),
            });
        }
        compile_params.index_type = Some(IndexType::Int64);
    } else if has_cp_async_bulk {
        compile_params.index_type = Some(IndexType::Int32);
    }

    if let Some(resolved) = compile_params.index_type {
        if resolved != kernel.index_type {
            return Err(LanzarError::IndexTypeConflict {
                reason: format!(
                    "kernel index type {} does not match compilation index type {resolved}",
                    kernel.index_type
                ),
            });
        }
    }
    Ok(())
}

/// The kernel and the per-run compile params must agree on indexing
fn validate_index_type(kernel: &LoweredKernel, compile_params: CompileParams) -> Result<()> {
    if let Some(requested) = compile_params.index_type {
        if requested != kernel.index_type {
            return Err(LanzarError::IndexTypeConflict {
                reason: format!(
                    "kernel index type {} does not match compilation index type {requested}",
                    kernel.index_type
                ),
            });
        }
    }
    Ok(())
}

/// Inferred allocation descriptors for every fusion output
fn output_buffer_infos(
    fusion: &Fusion,
    ee: &ExpressionEvaluator<'_>,
    index_type: IndexType,
) -> Result<Vec<GlobalBufferInfo>> {
    let mut infos = Vec::with_capacity(fusion.outputs.len());
    for output in &fusion.outputs {
        let (sizes, strides) = shape::infer_shape_of_output(fusion, output.tensor, ee)?;
        let dtype = fusion.tensor_view(output.tensor).dtype.resolve_index(index_type);
        infos.push(GlobalBufferInfo {
            tensor: output.tensor,
            sizes,
            strides,
            dtype,
            zero_init: false,
            resets_to_zero: false,
            is_profile_buffer: false,
        });
    }
    Ok(infos)
}

/// Resolve launch parameters, check kernel preconditions, and compute
/// the output and intermediate descriptors for one cache entry.
fn initialize_executor_entry(
    kernel: &LoweredKernel,
    ee: &mut ExpressionEvaluator<'_>,
    launch_constraints: &LaunchParams,
    outputs: &[DeviceTensor],
    warp_size: i64,
    index_type: IndexType,
    entry: &mut ExecutorEntry,
) -> Result<()> {
    let launch_params =
        launch::compute_launch_params(kernel, ee, launch_constraints, warp_size, index_type)?;

    for (predicate, message) in &kernel.summary.validations {
        let holds = ee.evaluate(*predicate).and_then(|v| v.as_bool()).unwrap_or(false);
        if !holds {
            return Err(LanzarError::InvalidProgram(message.clone()));
        }
    }

    // Future uses of this entry may not come with allocated outputs, so
    // the allocation descriptors are saved either way.
    let output_info = if outputs.is_empty() {
        output_buffer_infos(&kernel.fusion, ee, index_type)?
    } else {
        kernel
            .fusion
            .outputs
            .iter()
            .zip(outputs.iter())
            .map(|(out, tensor)| GlobalBufferInfo {
                tensor: out.tensor,
                sizes: tensor.sizes().to_vec(),
                strides: tensor.strides().to_vec(),
                dtype: tensor.dtype(),
                zero_init: false,
                resets_to_zero: false,
                is_profile_buffer: false,
            })
            .collect()
    };

    let intermediates = intermediate_buffer_infos(kernel, ee, index_type)?;

    entry.launch_params = launch_params;
    entry.outputs = output_info;
    entry.intermediates = intermediates;
    entry.init = true;
    Ok(())
}

/// Allocation descriptors for global buffers that are not fusion
/// outputs
fn intermediate_buffer_infos(
    kernel: &LoweredKernel,
    ee: &ExpressionEvaluator<'_>,
    index_type: IndexType,
) -> Result<Vec<GlobalBufferInfo>> {
    let fusion = &kernel.fusion;
    let mut infos = Vec::new();
    for alloc in &kernel.summary.global_allocations {
        if fusion.outputs.iter().any(|out| out.tensor == alloc.tensor) {
            continue;
        }
        let tv = fusion.tensor_view(alloc.tensor);
        // Expanded domains need the output-style walk; everything else
        // allocates the lowered shape directly.
        let has_expanded = tv
            .maybe_allocation_domain()
            .iter()
            .any(|&did| fusion.iter_domain(did).has_expanded_extent());
        let (sizes, strides) = if has_expanded {
            shape::infer_shape_of_output(fusion, alloc.tensor, ee)?
        } else {
            shape::infer_shape_of_intermediate(fusion, alloc, ee)?
        };
        infos.push(GlobalBufferInfo {
            tensor: alloc.tensor,
            sizes,
            strides,
            dtype: tv.dtype.resolve_index(index_type),
            zero_init: alloc.zero_init,
            resets_to_zero: alloc.resets_to_zero,
            is_profile_buffer: alloc.is_profile_buffer,
        });
    }
    Ok(infos)
}

/// Materialize one intermediate buffer.
///
/// Buffers with expanded (stride-0) dimensions are allocated at the
/// unexpanded shape and expanded logically afterwards. Zero-initialized
/// buffers come from the process-wide pool when the kernel restores
/// zeros or the process opted in.
fn allocate_intermediate(
    ctx: &DeviceContext,
    info: &GlobalBufferInfo,
    index_type: IndexType,
) -> Result<DeviceTensor> {
    let mut has_expansion = false;
    let mut unexpanded_sizes = Vec::with_capacity(info.sizes.len());
    for (&size, &stride) in info.sizes.iter().zip(info.strides.iter()) {
        if stride == 0 {
            has_expansion = true;
            unexpanded_sizes.push(1);
        } else {
            unexpanded_sizes.push(size);
        }
    }

    let tensor = if info.zero_init {
        if options::reuse_zeroed_memory() || info.resets_to_zero {
            let elems: i64 = unexpanded_sizes.iter().product();
            let bytes = elems as usize * info.dtype.size_in_bytes(index_type);
            let buffer = pool::borrow_zeroed(ctx, bytes.max(1))?;
            DeviceTensor::from_shared(buffer, unexpanded_sizes.clone(), info.dtype)?
        } else {
            DeviceTensor::zeros(ctx, unexpanded_sizes.clone(), info.dtype, index_type)?
        }
    } else {
        let strides = shape::contiguous_strides(
            &unexpanded_sizes,
            &vec![false; unexpanded_sizes.len()],
        )?;
        let mut tensor = DeviceTensor::empty_strided(
            ctx,
            unexpanded_sizes.clone(),
            strides,
            info.dtype,
            index_type,
        )?;
        if options::should_fill_allocation_with_nan() {
            tensor.fill_with_nan(ctx)?;
        }
        tensor
    };

    if has_expansion {
        tensor.expand(&info.sizes)
    } else {
        Ok(tensor)
    }
}

/// Evaluate one kernel parameter against the current bindings
fn evaluate_param(
    kernel: &LoweredKernel,
    param: KernelParam,
    ee: &ExpressionEvaluator<'_>,
) -> Result<EvalValue> {
    let fusion = &kernel.fusion;
    let tensor_of = |tid: TensorId| -> Result<EvalValue> {
        ee.tensor(tid).cloned().map(EvalValue::Tensor).ok_or_else(|| {
            LanzarError::InvalidProgram(format!(
                "kernel parameter {} has not been materialized",
                fusion.tensor_view(tid).name
            ))
        })
    };
    match param {
        KernelParam::Input(i) => match fusion.inputs.get(i) {
            Some(FusionInput::Tensor(tid)) => tensor_of(*tid),
            Some(FusionInput::Scalar(sid)) => {
                ee.evaluate(*sid).ok_or_else(|| LanzarError::ShapeUnresolved {
                    symbol: fusion.scalar_to_string(*sid),
                    buffer: format!("kernel input parameter {i}"),
                })
            }
            None => Err(LanzarError::InvalidProgram(format!("no fusion input {i}"))),
        },
        KernelParam::Output(i) => tensor_of(fusion.outputs[i].tensor),
        KernelParam::GlobalBuffer(i) => tensor_of(kernel.summary.global_allocations[i].tensor),
        KernelParam::Scalar(sid) => {
            ee.evaluate(sid).ok_or_else(|| LanzarError::ShapeUnresolved {
                symbol: fusion.scalar_to_string(sid),
                buffer: "kernel scalar parameter".to_string(),
            })
        }
    }
}

/// Build the per-parameter byte buffers from scratch. Needed once per
/// entry (and again only if the parameter set itself could change,
/// which requires a new fusion definition).
fn compute_args(
    kernel: &LoweredKernel,
    entry: &mut ExecutorEntry,
    ee: &ExpressionEvaluator<'_>,
    index_type: IndexType,
) -> Result<()> {
    let params = &kernel.parameters;
    entry.args.clear();
    entry.scalar_cache.clear();
    for &param in params {
        let value = evaluate_param(kernel, param, ee)?;
        entry.args.push(args::encode_value(&value, index_type)?);
        entry.scalar_cache.push(match value {
            EvalValue::Tensor(_) => None,
            other => Some(other),
        });
    }
    refresh_arg_ptrs(entry);
    Ok(())
}

/// Refresh the argument buffers in place for the current shapes.
///
/// GPU-tensor parameters rewrite only their pointer/shape/stride bytes;
/// non-tensor parameters are re-serialized only when their value
/// changed.
fn recompute_args(
    kernel: &LoweredKernel,
    entry: &mut ExecutorEntry,
    ee: &ExpressionEvaluator<'_>,
    index_type: IndexType,
) -> Result<()> {
    let params = &kernel.parameters;
    if entry.args.len() != params.len() {
        return Err(LanzarError::InvalidProgram(format!(
            "argument buffer holds {} parameters but the kernel has {}",
            entry.args.len(),
            params.len()
        )));
    }
    for (p, &param) in params.iter().enumerate() {
        let value = evaluate_param(kernel, param, ee)?;
        match &value {
            EvalValue::Tensor(arg) if arg.on_device => {
                args::rewrite_tensor_arg(&mut entry.args[p], arg, index_type)?;
            }
            _ => {
                if entry.scalar_cache[p].as_ref() != Some(&value) {
                    entry.args[p] = args::encode_value(&value, index_type)?;
                    entry.scalar_cache[p] = Some(value);
                }
            }
        }
    }
    refresh_arg_ptrs(entry);
    Ok(())
}

fn refresh_arg_ptrs(entry: &mut ExecutorEntry) {
    entry.arg_ptrs =
        entry.args.iter_mut().map(|buf| buf.as_mut_ptr().cast::<c_void>()).collect();
}

/// Host-evaluated fusions produce their outputs without a launch
fn evaluate_fusion_outputs(
    fusion: &Fusion,
    cargs: &mut KernelArgumentHolder,
    ee: &mut ExpressionEvaluator<'_>,
    provided: Vec<DeviceTensor>,
) -> Result<Vec<DeviceTensor>> {
    let outputs = if provided.is_empty() {
        let mut outputs = Vec::with_capacity(fusion.outputs.len());
        for output in &fusion.outputs {
            let arg = allocate::evaluate_tensor_view(fusion, output.tensor, ee)?;
            ee.bind_tensor(output.tensor, arg.clone());
            outputs.push(DeviceTensor::external(&arg));
        }
        outputs
    } else {
        provided
    };
    for out in &outputs {
        cargs.push(EvalValue::Tensor(out.arg()));
    }
    Ok(outputs)
}

fn dump_fusion_args(
    ids: ExecutorIds,
    cargs: &KernelArgumentHolder,
    launch_constraints: &LaunchParams,
    outputs: &[DeviceTensor],
) {
    tracing::info!(fusion = ids.fusion_id, "arguments for fusion:");
    for (i, arg) in cargs.iter().enumerate() {
        tracing::info!("  input {i}: {arg:?}");
    }
    for output in outputs {
        tracing::info!(
            "  output: {:?} sizes={:?} strides={:?}",
            output.dtype(),
            output.sizes(),
            output.strides()
        );
    }
    tracing::info!("{launch_constraints}");
}

fn dump_kernel_args(
    ids: ExecutorIds,
    outputs: &[DeviceTensor],
    intermediates: &[DeviceTensor],
    intermediate_infos: &[GlobalBufferInfo],
) {
    tracing::info!(fusion = ids.fusion_id, "arguments for kernel:");
    for output in outputs {
        tracing::info!(
            "  output: {:?} sizes={:?} strides={:?} address={:#x}",
            output.dtype(),
            output.sizes(),
            output.strides(),
            output.device_ptr()
        );
    }
    for (tensor, info) in intermediates.iter().zip(intermediate_infos.iter()) {
        tracing::info!(
            "  intermediate: {:?} sizes={:?} is_zero_initialized={} resets_to_zero={}",
            tensor.dtype(),
            tensor.sizes(),
            info.zero_init,
            info.resets_to_zero
        );
    }
}

fn dump_occupancy(ctx: &DeviceContext, compiler: &KernelCompiler, params: &LaunchParams) {
    let Some(compiled) = compiler.compiled() else { return };
    let Ok(blocks_per_sm) =
        compiled.function.occupancy_max_active_blocks(params.n_threads(), params.smem())
    else {
        return;
    };
    let props = ctx.properties();
    let warps_per_sm =
        (blocks_per_sm * params.n_threads() + props.warp_size - 1) / props.warp_size;
    tracing::info!(
        num_sms = props.multiprocessor_count,
        blocks_per_sm,
        warps_per_sm,
        "occupancy"
    );
}

fn dump_profile_buffer(buffer: &DeviceTensor) {
    let arg = buffer.arg();
    tracing::info!(
        elements = arg.numel(),
        ptr = format_args!("{:#x}", arg.ptr),
        "kernel profile buffer retained"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, IterDomain, OutputAlias, TensorView};

    fn unit_fusion() -> (Fusion, TensorId) {
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let tv = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d0]));
        fusion.inputs.push(FusionInput::Tensor(tv));
        (fusion, tv)
    }

    fn tensor_arg(sizes: Vec<i64>, strides: Vec<i64>) -> TensorArg {
        TensorArg { ptr: 0x4000, sizes, strides, dtype: DataType::Float, on_device: true }
    }

    #[test]
    fn test_kernel_id_format() {
        let ids = ExecutorIds { fusion_id: 3, concrete_id: 1, runtime_id: 0, group_id: 7 };
        assert_eq!(ids.kernel_id(), "lanzar_f3_c1_r0_g7");
    }

    #[test]
    fn test_cache_disable_scan() {
        // Output extent = i0 (tensor-derived): cache stays enabled
        let (mut fusion, input_tv) = unit_fusion();
        let out_tv = {
            let logical = fusion.tensor_view(input_tv).logical.clone();
            fusion.tensor(TensorView::contiguous("T1", DataType::Float, logical))
        };
        fusion
            .outputs
            .push(crate::ir::FusionOutput { tensor: out_tv, alias: OutputAlias::new_buffer() });
        assert!(!output_shapes_depend_on_scalar_inputs(&fusion));

        // Output extent depends on a scalar input: cache must be
        // disabled
        let s = fusion.named("n");
        fusion.inputs.push(FusionInput::Scalar(s));
        let two = fusion.constant(2);
        let scaled = fusion.binary(BinaryOp::Mul, s, two);
        let d = fusion.domain(IterDomain::iteration(scaled));
        let out2 = fusion.tensor(TensorView::contiguous("T2", DataType::Float, vec![d]));
        fusion
            .outputs
            .push(crate::ir::FusionOutput { tensor: out2, alias: OutputAlias::new_buffer() });
        assert!(output_shapes_depend_on_scalar_inputs(&fusion));
    }

    #[test]
    fn test_resolve_index_type_conflicts() {
        let (mut fusion, tv) = unit_fusion();
        let out = {
            let logical = fusion.tensor_view(tv).logical.clone();
            fusion.tensor(TensorView::contiguous("T1", DataType::Float, logical))
        };
        fusion.outputs.push(crate::ir::FusionOutput { tensor: out, alias: OutputAlias::new_buffer() });
        let mut kernel = LoweredKernel {
            parameters: Vec::new(),
            kernel_body: String::new(),
            kernel_name: "kernel".to_string(),
            index_type: IndexType::Int32,
            summary: crate::ir::KernelSummary::default(),
            fusion,
        };

        // Large tensor demands 64-bit: explicit 32-bit request fails
        let huge = tensor_arg(vec![1 << 20, 1 << 12], vec![1 << 12, 1]);
        let holder = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(huge)]);
        let mut params =
            CompileParams { index_type: Some(IndexType::Int32), ..CompileParams::default() };
        let err = resolve_index_type(&kernel, &holder, &mut params).expect_err("conflict");
        assert!(matches!(err, LanzarError::IndexTypeConflict { .. }));

        // TMA forces 32-bit even with small arguments
        kernel.summary.has_cp_async_bulk = true;
        let small = tensor_arg(vec![4], vec![1]);
        let holder = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(small)]);
        let mut params = CompileParams::default();
        resolve_index_type(&kernel, &holder, &mut params).expect("resolve");
        assert_eq!(params.index_type, Some(IndexType::Int32));

        // TMA plus 64-bit arguments is unsatisfiable
        let huge = tensor_arg(vec![1 << 20, 1 << 12], vec![1 << 12, 1]);
        let holder = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(huge)]);
        let mut params = CompileParams::default();
        let err = resolve_index_type(&kernel, &holder, &mut params).expect_err("conflict");
        assert!(matches!(err, LanzarError::IndexTypeConflict { .. }));
    }

    #[test]
    fn test_dynamic_local_allocation_rejected_at_compile() {
        let (mut fusion, tv) = unit_fusion();
        let out = {
            let logical = fusion.tensor_view(tv).logical.clone();
            fusion.tensor(TensorView::contiguous("T1", DataType::Float, logical))
        };
        fusion.outputs.push(crate::ir::FusionOutput { tensor: out, alias: OutputAlias::new_buffer() });
        let summary = crate::ir::KernelSummary {
            has_dynamic_local_memory_allocations: true,
            dynamic_lmem_buffer_names: vec!["T7".to_string()],
            ..crate::ir::KernelSummary::default()
        };
        let kernel = LoweredKernel {
            parameters: Vec::new(),
            kernel_body: String::new(),
            kernel_name: "kernel".to_string(),
            index_type: IndexType::Int64,
            summary,
            fusion,
        };

        let holder = KernelArgumentHolder::new();
        let result = FusionExecutor::compile_fusion(
            kernel,
            &holder,
            &LaunchParams::new(),
            CompileParams::default(),
            ExecutorIds::default(),
        );
        match result {
            // Without a device the context open fails first; with one,
            // the local-memory check must fire.
            Err(LanzarError::DynamicLocalAllocation { buffers }) => {
                assert_eq!(buffers, vec!["T7".to_string()]);
            }
            Err(LanzarError::Driver(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_infer_output_sizes_dry_run() {
        let (mut fusion, tv) = unit_fusion();
        let out = {
            let logical = fusion.tensor_view(tv).logical.clone();
            fusion.tensor(TensorView::contiguous("T1", DataType::Float, logical))
        };
        fusion.outputs.push(crate::ir::FusionOutput { tensor: out, alias: OutputAlias::new_buffer() });

        let holder = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(tensor_arg(
            vec![9],
            vec![1],
        ))]);
        let proxies = FusionExecutor::infer_output_sizes(&fusion, &holder).expect("infer");
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].sizes, vec![9]);
        assert_eq!(proxies[0].strides, vec![1]);
        assert_eq!(proxies[0].dtype, DataType::Float);
    }

    #[test]
    fn test_entry_scalar_cache_skips_unchanged() {
        // One tensor input and one scalar input, both kernel params
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let tv = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d0]));
        let s = fusion.named("alpha");
        fusion.inputs.push(FusionInput::Tensor(tv));
        fusion.inputs.push(FusionInput::Scalar(s));
        let out = fusion.tensor(TensorView::contiguous("T1", DataType::Float, vec![d0]));
        fusion.outputs.push(crate::ir::FusionOutput { tensor: out, alias: OutputAlias::new_buffer() });

        let kernel = LoweredKernel {
            parameters: vec![KernelParam::Input(0), KernelParam::Input(1)],
            kernel_body: String::new(),
            kernel_name: "kernel".to_string(),
            index_type: IndexType::Int32,
            summary: crate::ir::KernelSummary::default(),
            fusion,
        };

        let mut entry = ExecutorEntry::default();
        let mut ee = ExpressionEvaluator::new(&kernel.fusion);
        ee.bind_input(kernel.fusion.inputs[0], &EvalValue::Tensor(tensor_arg(vec![3], vec![1])))
            .expect("bind");
        ee.bind_input(kernel.fusion.inputs[1], &EvalValue::Int(5)).expect("bind");
        compute_args(&kernel, &mut entry, &ee, IndexType::Int32).expect("compute");
        assert_eq!(entry.args.len(), 2);
        // Tensor param: 8 + 4 + 4; scalar param: 4 bytes at the index
        // width
        assert_eq!(entry.args[0].len(), 16);
        assert_eq!(entry.args[1].len(), 4);
        let scalar_before = entry.args[1].clone();

        // Same scalar, new tensor shape: only the tensor buffer changes
        let mut ee = ExpressionEvaluator::new(&kernel.fusion);
        let new_tensor = TensorArg { ptr: 0x8888, ..tensor_arg(vec![7], vec![1]) };
        ee.bind_input(kernel.fusion.inputs[0], &EvalValue::Tensor(new_tensor)).expect("bind");
        ee.bind_input(kernel.fusion.inputs[1], &EvalValue::Int(5)).expect("bind");
        recompute_args(&kernel, &mut entry, &ee, IndexType::Int32).expect("recompute");
        assert_eq!(entry.args[1], scalar_before);
        assert_eq!(&entry.args[0][0..8], &0x8888u64.to_ne_bytes());
        assert_eq!(&entry.args[0][8..12], &7i32.to_ne_bytes());
    }

    #[test]
    fn test_executor_state_roundtrip() {
        let entry = EntryState {
            init: true,
            launch_params: LaunchParams::from_dims((4, 1, 1), (128, 1, 1), 1024),
            outputs: vec![GlobalBufferInfo {
                tensor: TensorId(1),
                sizes: vec![3, 4],
                strides: vec![4, 1],
                dtype: DataType::Float,
                zero_init: false,
                resets_to_zero: false,
                is_profile_buffer: false,
            }],
            intermediates: Vec::new(),
        };
        let state = ExecutorState {
            ids: ExecutorIds { fusion_id: 1, concrete_id: 2, runtime_id: 3, group_id: 4 },
            index_type: IndexType::Int32,
            warp_size: 32,
            block_size_high_water_mark: 128,
            maxrregcount_high_water_mark: Some(64),
            disable_parameter_cache: false,
            entries: vec![(0xfeed, entry)],
            compiled: Some(CompiledKernelState {
                ptx: ".version 8.0".to_string(),
                kernel_name: "kernel".to_string(),
                compile_args: vec!["--maxrregcount=64".to_string()],
                block_size: 128,
            }),
        };
        let json = serde_json::to_string(&state).expect("serialize");
        let back: ExecutorState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.block_size_high_water_mark, 128);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].0, 0xfeed);
        assert_eq!(back.entries[0].1.outputs[0].sizes, vec![3, 4]);
        assert_eq!(back.compiled.as_ref().map(|c| c.block_size), Some(128));
    }

    #[test]
    fn test_evaluated_fusion_runs_without_device() {
        // Output is a transposed view of the input: the whole fusion is
        // host-evaluable.
        let mut fusion = Fusion::new();
        let e0 = fusion.named("i0");
        let e1 = fusion.named("i1");
        let d0 = fusion.domain(IterDomain::iteration(e0));
        let d1 = fusion.domain(IterDomain::iteration(e1));
        let t_in = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d0, d1]));
        fusion.inputs.push(FusionInput::Tensor(t_in));
        let mut view = TensorView::contiguous("T1", DataType::Float, vec![d1, d0]);
        view.definition = Some(crate::ir::TensorDef::ViewOf { source: t_in });
        let t_out = fusion.tensor(view);
        fusion
            .outputs
            .push(crate::ir::FusionOutput { tensor: t_out, alias: OutputAlias::evaluate(Some(t_in)) });

        let summary = crate::ir::KernelSummary {
            is_expression_evaluated: true,
            ..crate::ir::KernelSummary::default()
        };
        let kernel = LoweredKernel {
            parameters: Vec::new(),
            kernel_body: String::new(),
            kernel_name: "kernel".to_string(),
            index_type: IndexType::Int64,
            summary,
            fusion,
        };

        let mut executor = FusionExecutor::compile_fusion(
            kernel,
            &KernelArgumentHolder::new(),
            &LaunchParams::new(),
            CompileParams::default(),
            ExecutorIds::default(),
        )
        .expect("compile");

        let mut holder = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(tensor_arg(
            vec![2, 3],
            vec![3, 1],
        ))]);
        let outputs = executor
            .run(&mut holder, &LaunchParams::new(), CompileParams::default(), Vec::new())
            .expect("run");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].sizes(), &[3, 2]);
        assert_eq!(outputs[0].device_ptr(), 0x4000);
        // The output was appended to the argument holder
        assert_eq!(holder.len(), 2);
    }
}
