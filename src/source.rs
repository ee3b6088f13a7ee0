//! Structured kernel source assembly
//!
//! The generated kernel body arrives from code generation upstream;
//! this module wraps it with the type aliases, the index typedef, and
//! the parameter-struct preamble the argument ABI relies on, and
//! handles the external-source override used for debugging.

use std::io::Read;

use crate::ir::IndexType;
use crate::options::{self, DumpOption};

/// Index typedef matching the kernel index type
#[must_use]
pub fn define_index_type(index_type: IndexType) -> &'static str {
    match index_type {
        IndexType::Int32 => "typedef int lanzar_index_t;\n",
        IndexType::Int64 => "typedef int64_t lanzar_index_t;\n",
    }
}

/// Fixed-width integer aliases plus the TMA descriptor struct
#[must_use]
pub fn define_types() -> &'static str {
    r"
using int8_t = signed char;
using uint8_t = unsigned char;
using int16_t = short int;
using uint16_t = unsigned short int;
using int32_t = int;
using uint32_t = unsigned int;
using int64_t = long long int;
using uint64_t = unsigned long long int;

// Modified from cuda.h
struct TensorMap {
  alignas(64)
  uint64_t opaque[16];
};
"
}

/// Parameter structs consumed by generated kernels
///
/// A GPU tensor parameter is passed as `Tensor<T, N, M>`: base pointer,
/// N logical sizes and M allocation strides at the kernel index width.
/// The byte layout must match the argument marshalling exactly.
#[must_use]
pub fn kernel_preamble() -> &'static str {
    r"
template <typename T, int N, int M>
struct Tensor {
  T* data;
  lanzar_index_t logical_size[N];
  lanzar_index_t alloc_stride[M];
};

template <typename T>
struct Tensor<T, 0, 0> {
  T* data;
};
"
}

fn include_std_complex() -> &'static str {
    r"
#ifdef __NVCC__
#include <complex>
#endif // __NVCC__
"
}

/// Full structured source for one kernel body
///
/// Kernel bodies declare their entry point `extern "C" __global__` so
/// the loaded symbol name matches the kernel name without demangling.
#[must_use]
pub fn structured_code(kernel_body: &str, index_type: IndexType) -> String {
    let mut code = String::new();
    code.push_str(include_std_complex());
    code.push_str(define_types());
    code.push_str(define_index_type(index_type));
    code.push_str(kernel_preamble());
    code.push_str(kernel_body);
    code
}

/// Pick the replacement source for fusion number `fusion_id` out of a
/// comma-separated path list.
///
/// Paths map to fusions in order; a missing or unreadable entry falls
/// back to generated code with a warning.
#[must_use]
pub fn select_external_source(paths: &str, fusion_id: u64) -> Option<String> {
    if paths.is_empty() || fusion_id < 1 {
        return None;
    }
    let path = match paths.split(',').nth(fusion_id as usize - 1) {
        Some(p) if !p.is_empty() => p,
        _ => {
            tracing::warn!(
                fusion_id,
                "Didn't find requested external source code. Will use generated code! The number \
                 of source files should equal the number of fusion segments, comma separated."
            );
            return None;
        }
    };
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(path, %err, "Failed to open external source file");
            return None;
        }
    };
    let mut buffer = String::new();
    if let Err(err) = file.read_to_string(&mut buffer) {
        tracing::warn!(path, %err, "Failed to read external source file");
        return None;
    }
    tracing::debug!(path, "Compiling external CUDA code");
    Some(buffer)
}

/// External-source override from `LANZAR_EXTERNAL_SRC`, if configured
#[must_use]
pub fn structured_code_from_external_files(fusion_id: u64) -> Option<String> {
    options::external_src().and_then(|paths| select_external_source(paths, fusion_id))
}

/// Opt-in source dumps: print the body or full code, and write the
/// structured source to `__tmp_kernel_<id>.cu`.
pub fn maybe_dump_source(code: &str, kernel_body: &str, kernel_name: &str, kernel_id: &str) {
    if options::is_dump_enabled(DumpOption::Cuda) {
        tracing::info!(kernel = kernel_name, "\n{kernel_body}");
    } else if options::is_dump_enabled(DumpOption::CudaFull) {
        tracing::info!(kernel = kernel_name, "\n{code}");
    }
    if options::is_dump_enabled(DumpOption::CudaToFile) {
        let file_name = format!("__tmp_kernel_{kernel_id}.cu");
        match std::fs::write(&file_name, code) {
            Ok(()) => tracing::info!(file = file_name, "PRINTING"),
            Err(err) => tracing::warn!(file = file_name, %err, "failed to write kernel source"),
        }
    }
}
