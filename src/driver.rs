//! CUDA driver facade
//!
//! Everything that touches the GPU goes through this module: device
//! properties, buffer allocation, NVRTC compilation, module loading,
//! function attributes, occupancy queries, and kernel launches
//! (ordinary and cooperative). Built without the `cuda` feature, every
//! entry point reports `LanzarError::Driver`, which keeps the planning
//! layers and their tests fully host-side.

use crate::error::Result;

/// Grid/block/smem shape of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Grid dimensions
    pub grid: (u32, u32, u32),
    /// Block dimensions
    pub block: (u32, u32, u32),
    /// Dynamic shared-memory bytes
    pub smem_bytes: u32,
    /// Whether all blocks must be co-resident
    pub cooperative: bool,
}

/// Properties of the device a context was opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Warp size in threads
    pub warp_size: i64,
    /// Number of multiprocessors
    pub multiprocessor_count: i64,
    /// Opt-in shared memory per block, in bytes
    pub max_shared_memory_per_block_optin: i64,
    /// Compute capability
    pub compute_capability: (u32, u32),
}

#[cfg(feature = "cuda")]
mod imp {
    use std::sync::{Arc, OnceLock};

    use cudarc::driver::safe::{CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream};
    use cudarc::driver::sys::CUdevice_attribute;
    use cudarc::driver::{DevicePtr, LaunchConfig, PushKernelArg};
    use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions, Ptx};

    use super::{DeviceProperties, LaunchSpec};
    use crate::error::{LanzarError, Result};

    fn driver_err(err: impl std::fmt::Debug) -> LanzarError {
        LanzarError::Driver(format!("{err:?}"))
    }

    /// Whether a CUDA device can be opened
    pub fn is_available() -> bool {
        static AVAILABLE: OnceLock<bool> = OnceLock::new();
        *AVAILABLE.get_or_init(|| CudaContext::new(0).is_ok())
    }

    /// Number of visible CUDA devices
    pub fn device_count() -> usize {
        CudaContext::device_count().map_or(0, |n| usize::try_from(n).unwrap_or(0))
    }

    /// An opened device with its default stream
    #[derive(Clone)]
    pub struct DeviceContext {
        context: Arc<CudaContext>,
        stream: Arc<CudaStream>,
        device_index: usize,
        properties: DeviceProperties,
    }

    impl std::fmt::Debug for DeviceContext {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DeviceContext")
                .field("device_index", &self.device_index)
                .field("properties", &self.properties)
                .finish_non_exhaustive()
        }
    }

    impl DeviceContext {
        /// Open the device and cache its launch-relevant properties
        pub fn new(device_index: usize) -> Result<Self> {
            let context = CudaContext::new(device_index).map_err(driver_err)?;
            let attr = |a: CUdevice_attribute| -> Result<i64> {
                context.attribute(a).map(i64::from).map_err(driver_err)
            };
            let properties = DeviceProperties {
                warp_size: attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_WARP_SIZE)?,
                multiprocessor_count: attr(
                    CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
                )?,
                max_shared_memory_per_block_optin: attr(
                    CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK_OPTIN,
                )?,
                compute_capability: (
                    u32::try_from(attr(
                        CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
                    )?)
                    .unwrap_or(0),
                    u32::try_from(attr(
                        CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
                    )?)
                    .unwrap_or(0),
                ),
            };
            let stream = context.default_stream();
            Ok(Self { context, stream, device_index, properties })
        }

        /// Device ordinal this context was opened on
        pub fn device_index(&self) -> usize {
            self.device_index
        }

        /// Cached device properties
        pub fn properties(&self) -> DeviceProperties {
            self.properties
        }

        /// Block until all submitted work completes
        pub fn synchronize(&self) -> Result<()> {
            self.stream.synchronize().map_err(driver_err)
        }
    }

    /// One device allocation, byte granular
    pub struct DeviceBuffer {
        slice: CudaSlice<u8>,
        ptr: u64,
        len: usize,
    }

    impl std::fmt::Debug for DeviceBuffer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DeviceBuffer")
                .field("ptr", &format_args!("{:#x}", self.ptr))
                .field("len", &self.len)
                .finish_non_exhaustive()
        }
    }

    impl DeviceBuffer {
        /// Allocate without initializing
        pub fn alloc_raw(ctx: &DeviceContext, bytes: usize) -> Result<Self> {
            // SAFETY: contents are written by the kernel (or a debug
            // fill) before being read.
            let slice = unsafe { ctx.stream.alloc::<u8>(bytes) }.map_err(driver_err)?;
            Ok(Self::from_slice(ctx, slice, bytes))
        }

        /// Allocate zero-filled
        pub fn alloc_zeroed(ctx: &DeviceContext, bytes: usize) -> Result<Self> {
            let slice = ctx.stream.alloc_zeros::<u8>(bytes).map_err(driver_err)?;
            Ok(Self::from_slice(ctx, slice, bytes))
        }

        fn from_slice(ctx: &DeviceContext, slice: CudaSlice<u8>, len: usize) -> Self {
            let (ptr, _record) = slice.device_ptr(&ctx.stream);
            Self { slice, ptr: ptr as u64, len }
        }

        /// Size in bytes
        pub fn len(&self) -> usize {
            self.len
        }

        /// Whether the buffer is empty
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        /// Raw device address
        pub fn device_ptr(&self) -> u64 {
            self.ptr
        }

        /// Overwrite the buffer with `data` (must match the length)
        pub fn copy_from_host(&mut self, ctx: &DeviceContext, data: &[u8]) -> Result<()> {
            if data.len() != self.len {
                return Err(LanzarError::Driver(format!(
                    "host copy of {} bytes into a {}-byte buffer",
                    data.len(),
                    self.len
                )));
            }
            ctx.stream.memcpy_htod(data, &mut self.slice).map_err(driver_err)
        }

        /// Read the buffer back to the host
        pub fn copy_to_host(&self, ctx: &DeviceContext) -> Result<Vec<u8>> {
            ctx.stream.memcpy_dtov(&self.slice).map_err(driver_err)
        }

        /// Fill with a repeating element pattern (debug NaN fills)
        pub fn fill_pattern(&mut self, ctx: &DeviceContext, pattern: &[u8]) -> Result<()> {
            if pattern.is_empty() || self.len % pattern.len() != 0 {
                return Err(LanzarError::Driver(format!(
                    "pattern of {} bytes does not divide a {}-byte buffer",
                    pattern.len(),
                    self.len
                )));
            }
            let host: Vec<u8> = pattern.iter().copied().cycle().take(self.len).collect();
            self.copy_from_host(ctx, &host)
        }
    }

    /// A loaded kernel function
    pub struct KernelFunction {
        _module: Arc<CudaModule>,
        function: CudaFunction,
    }

    impl std::fmt::Debug for KernelFunction {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("KernelFunction").finish_non_exhaustive()
        }
    }

    /// Compile structured CUDA source to PTX via NVRTC
    pub fn compile_to_ptx(
        code: &str,
        compute_capability: (u32, u32),
        maxrregcount: Option<u32>,
    ) -> Result<(String, Vec<String>)> {
        let mut options: Vec<String> = vec!["--std=c++17".to_string()];
        if let Some(regs) = maxrregcount {
            options.push(format!("--maxrregcount={regs}"));
        }
        let opts = CompileOptions {
            arch: arch_flag(compute_capability),
            options: options.clone(),
            ..CompileOptions::default()
        };
        let ptx = compile_ptx_with_opts(code, opts)
            .map_err(|err| LanzarError::Compile(format!("{err:?}")))?;
        Ok((ptx.to_src(), options))
    }

    fn arch_flag(capability: (u32, u32)) -> Option<&'static str> {
        match capability {
            (7, 0) => Some("compute_70"),
            (7, 2) => Some("compute_72"),
            (7, 5) => Some("compute_75"),
            (8, 0) => Some("compute_80"),
            (8, 6) => Some("compute_86"),
            (8, 7) => Some("compute_87"),
            (8, 9) => Some("compute_89"),
            (9, 0) => Some("compute_90"),
            (10, 0) => Some("compute_100"),
            (12, 0) => Some("compute_120"),
            _ => None,
        }
    }

    /// Load PTX and resolve the kernel entry point
    pub fn load_kernel(ctx: &DeviceContext, ptx: &str, name: &str) -> Result<KernelFunction> {
        let module = ctx.context.load_module(Ptx::from_src(ptx)).map_err(driver_err)?;
        let function = module.load_function(name).map_err(driver_err)?;
        Ok(KernelFunction { _module: module, function })
    }

    impl KernelFunction {
        /// Static shared-memory bytes of the compiled function
        pub fn static_smem_bytes(&self) -> Result<i64> {
            self.function
                .attribute(
                    cudarc::driver::sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES,
                )
                .map(i64::from)
                .map_err(driver_err)
        }

        /// Current maximum dynamic shared-memory attribute
        pub fn max_dynamic_smem_bytes(&self) -> Result<i64> {
            self.function
                .attribute(
                    cudarc::driver::sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
                )
                .map(i64::from)
                .map_err(driver_err)
        }

        /// Raise the maximum dynamic shared-memory attribute
        pub fn set_max_dynamic_smem_bytes(&self, bytes: i64) -> Result<()> {
            self.function
                .set_attribute(
                    cudarc::driver::sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
                    i32::try_from(bytes).map_err(driver_err)?,
                )
                .map_err(driver_err)
        }

        /// Maximum co-resident blocks per multiprocessor at this launch
        /// configuration
        pub fn occupancy_max_active_blocks(
            &self,
            block_size: i64,
            dynamic_smem_bytes: i64,
        ) -> Result<i64> {
            self.function
                .occupancy_max_active_blocks_per_multiprocessor(
                    u32::try_from(block_size).map_err(driver_err)?,
                    usize::try_from(dynamic_smem_bytes).map_err(driver_err)?,
                    None,
                )
                .map(i64::from)
                .map_err(driver_err)
        }
    }

    /// Submit the kernel to the context's stream
    ///
    /// `arg_ptrs` follows the driver contract: one pointer per kernel
    /// parameter, each pointing at that parameter's value bytes.
    ///
    /// # Safety
    ///
    /// Every pointer must reference a live, correctly laid out parameter
    /// buffer matching the kernel signature.
    pub unsafe fn launch(
        ctx: &DeviceContext,
        kernel: &KernelFunction,
        spec: LaunchSpec,
        arg_ptrs: &[*mut std::ffi::c_void],
    ) -> Result<()> {
        let cfg = LaunchConfig {
            grid_dim: spec.grid,
            block_dim: spec.block,
            shared_mem_bytes: spec.smem_bytes,
        };
        let mut builder = ctx.stream.launch_builder(&kernel.function);
        for &ptr in arg_ptrs {
            // The builder records one pointer per parameter; hand it the
            // first byte of the marshalled value.
            builder.arg(&*ptr.cast::<u8>());
        }
        let result = if spec.cooperative {
            builder.launch_cooperative(cfg)
        } else {
            builder.launch(cfg)
        };
        result.map(|_| ()).map_err(driver_err)
    }
}

#[cfg(not(feature = "cuda"))]
mod imp {
    use super::{DeviceProperties, LaunchSpec};
    use crate::error::{LanzarError, Result};

    fn unavailable() -> LanzarError {
        LanzarError::Driver(
            "CUDA support not compiled in; rebuild with the `cuda` feature".to_string(),
        )
    }

    /// Whether a CUDA device can be opened (never, in this build)
    pub fn is_available() -> bool {
        false
    }

    /// Number of visible CUDA devices (zero in this build)
    pub fn device_count() -> usize {
        0
    }

    /// An opened device with its default stream
    #[derive(Debug, Clone)]
    pub struct DeviceContext {
        never: std::convert::Infallible,
    }

    impl DeviceContext {
        /// Open the device (always fails in this build)
        pub fn new(_device_index: usize) -> Result<Self> {
            Err(unavailable())
        }

        /// Device ordinal this context was opened on
        pub fn device_index(&self) -> usize {
            match self.never {}
        }

        /// Cached device properties
        pub fn properties(&self) -> DeviceProperties {
            match self.never {}
        }

        /// Block until all submitted work completes
        pub fn synchronize(&self) -> Result<()> {
            match self.never {}
        }
    }

    /// One device allocation, byte granular
    #[derive(Debug)]
    pub struct DeviceBuffer {
        never: std::convert::Infallible,
    }

    impl DeviceBuffer {
        /// Allocate without initializing
        pub fn alloc_raw(_ctx: &DeviceContext, _bytes: usize) -> Result<Self> {
            Err(unavailable())
        }

        /// Allocate zero-filled
        pub fn alloc_zeroed(_ctx: &DeviceContext, _bytes: usize) -> Result<Self> {
            Err(unavailable())
        }

        /// Size in bytes
        pub fn len(&self) -> usize {
            match self.never {}
        }

        /// Whether the buffer is empty
        pub fn is_empty(&self) -> bool {
            match self.never {}
        }

        /// Raw device address
        pub fn device_ptr(&self) -> u64 {
            match self.never {}
        }

        /// Overwrite the buffer with `data`
        pub fn copy_from_host(&mut self, _ctx: &DeviceContext, _data: &[u8]) -> Result<()> {
            match self.never {}
        }

        /// Read the buffer back to the host
        pub fn copy_to_host(&self, _ctx: &DeviceContext) -> Result<Vec<u8>> {
            match self.never {}
        }

        /// Fill with a repeating element pattern
        pub fn fill_pattern(&mut self, _ctx: &DeviceContext, _pattern: &[u8]) -> Result<()> {
            match self.never {}
        }
    }

    /// A loaded kernel function
    #[derive(Debug)]
    pub struct KernelFunction {
        never: std::convert::Infallible,
    }

    /// Compile structured CUDA source to PTX via NVRTC
    pub fn compile_to_ptx(
        _code: &str,
        _compute_capability: (u32, u32),
        _maxrregcount: Option<u32>,
    ) -> Result<(String, Vec<String>)> {
        Err(unavailable())
    }

    /// Load PTX and resolve the kernel entry point
    pub fn load_kernel(_ctx: &DeviceContext, _ptx: &str, _name: &str) -> Result<KernelFunction> {
        Err(unavailable())
    }

    impl KernelFunction {
        /// Static shared-memory bytes of the compiled function
        pub fn static_smem_bytes(&self) -> Result<i64> {
            match self.never {}
        }

        /// Current maximum dynamic shared-memory attribute
        pub fn max_dynamic_smem_bytes(&self) -> Result<i64> {
            match self.never {}
        }

        /// Raise the maximum dynamic shared-memory attribute
        pub fn set_max_dynamic_smem_bytes(&self, _bytes: i64) -> Result<()> {
            match self.never {}
        }

        /// Maximum co-resident blocks per multiprocessor
        pub fn occupancy_max_active_blocks(
            &self,
            _block_size: i64,
            _dynamic_smem_bytes: i64,
        ) -> Result<i64> {
            match self.never {}
        }
    }

    /// Submit the kernel to the context's stream
    ///
    /// # Safety
    ///
    /// Every pointer must reference a live, correctly laid out parameter
    /// buffer matching the kernel signature.
    pub unsafe fn launch(
        _ctx: &DeviceContext,
        kernel: &KernelFunction,
        _spec: LaunchSpec,
        _arg_ptrs: &[*mut std::ffi::c_void],
    ) -> Result<()> {
        match kernel.never {}
    }
}

pub use imp::{
    compile_to_ptx, device_count, is_available, launch, load_kernel, DeviceBuffer, DeviceContext,
    KernelFunction,
};

/// Convert resolved launch parameters into a driver launch spec
pub fn launch_spec(params: &crate::launch::LaunchParams, cooperative: bool) -> Result<LaunchSpec> {
    let dim = |v: i64| -> Result<u32> {
        u32::try_from(v).map_err(|_| {
            crate::error::LanzarError::InvalidProgram(format!("launch dimension {v} out of range"))
        })
    };
    Ok(LaunchSpec {
        grid: (dim(params.gdimx())?, dim(params.gdimy())?, dim(params.gdimz())?),
        block: (dim(params.bdimx())?, dim(params.bdimy())?, dim(params.bdimz())?),
        smem_bytes: dim(params.smem())?,
        cooperative,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_from_params() {
        let params =
            crate::launch::LaunchParams::from_dims((10, 1, 1), (128, 1, 1), 4096);
        let spec = launch_spec(&params, false).expect("spec");
        assert_eq!(spec.grid, (10, 1, 1));
        assert_eq!(spec.block, (128, 1, 1));
        assert_eq!(spec.smem_bytes, 4096);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_stub_reports_unavailable() {
        assert!(!is_available());
        assert_eq!(device_count(), 0);
        assert!(DeviceContext::new(0).is_err());
    }
}
