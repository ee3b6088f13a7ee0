//! Process-wide options and debug switches
//!
//! Options are read from the environment once and cached. The NaN-fill
//! switch is also settable programmatically so test harnesses can toggle
//! it without re-execing the process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Debug-dump options recognized in `LANZAR_DUMP` (comma separated)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumpOption {
    /// Print the generated kernel body
    Cuda,
    /// Print the full structured source (preamble included)
    CudaFull,
    /// Write the structured source to `__tmp_kernel_<id>.cu`
    CudaToFile,
    /// Print the compiled PTX
    Ptx,
    /// Print resolved launch parameters before the launch
    LaunchParam,
    /// Print the arguments passed to `run`
    FusionArgs,
    /// Print the arguments passed to the kernel launch
    KernelArgs,
    /// Print the kernel index type
    IndexType,
    /// Print an occupancy estimate after the launch
    Occupancy,
}

impl DumpOption {
    fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "cuda" => Some(Self::Cuda),
            "cuda_full" => Some(Self::CudaFull),
            "cuda_to_file" => Some(Self::CudaToFile),
            "ptx" => Some(Self::Ptx),
            "launch_param" => Some(Self::LaunchParam),
            "fusion_args" => Some(Self::FusionArgs),
            "kernel_args" => Some(Self::KernelArgs),
            "index_type" => Some(Self::IndexType),
            "occupancy" => Some(Self::Occupancy),
            _ => None,
        }
    }
}

fn dump_options() -> &'static HashSet<DumpOption> {
    static OPTIONS: OnceLock<HashSet<DumpOption>> = OnceLock::new();
    OPTIONS.get_or_init(|| {
        let mut set = HashSet::new();
        if let Ok(raw) = std::env::var("LANZAR_DUMP") {
            for token in raw.split(',') {
                match DumpOption::parse(token) {
                    Some(opt) => {
                        set.insert(opt);
                    }
                    None if token.trim().is_empty() => {}
                    None => {
                        tracing::warn!(option = token, "unrecognized LANZAR_DUMP option");
                    }
                }
            }
        }
        set
    })
}

/// Whether a debug dump option was requested via `LANZAR_DUMP`
#[must_use]
pub fn is_dump_enabled(option: DumpOption) -> bool {
    dump_options().contains(&option)
}

/// Raw value of `LANZAR_EXTERNAL_SRC`, if set and non-empty
#[must_use]
pub fn external_src() -> Option<&'static str> {
    static SRC: OnceLock<Option<String>> = OnceLock::new();
    SRC.get_or_init(|| std::env::var("LANZAR_EXTERNAL_SRC").ok().filter(|s| !s.is_empty()))
        .as_deref()
}

/// Whether zero-initialized intermediates may be borrowed from the
/// process-wide zeroed pool even when the kernel does not guarantee to
/// restore zeros. Unsafe opt-in: `LANZAR_REUSE_ZEROED_MEMORY=1`.
#[must_use]
pub fn reuse_zeroed_memory() -> bool {
    static REUSE: OnceLock<bool> = OnceLock::new();
    *REUSE.get_or_init(|| {
        std::env::var("LANZAR_REUSE_ZEROED_MEMORY").map_or(false, |v| v == "1" || v == "true")
    })
}

/// Whether the kernel-profile buffer should be read back and reported
/// after a launch (`LANZAR_KERNEL_PROFILE=1`).
#[must_use]
pub fn kernel_profile() -> bool {
    static PROFILE: OnceLock<bool> = OnceLock::new();
    *PROFILE.get_or_init(|| {
        std::env::var("LANZAR_KERNEL_PROFILE").map_or(false, |v| v == "1" || v == "true")
    })
}

static FILL_ALLOCATION_WITH_NAN: AtomicBool = AtomicBool::new(false);
static FILL_NAN_ENV: OnceLock<bool> = OnceLock::new();

/// Whether freshly allocated (non-zeroed) device buffers should be
/// filled with typed NaN sentinels. Combines the `LANZAR_FILL_NAN`
/// environment opt-in with the programmatic switch.
#[must_use]
pub fn should_fill_allocation_with_nan() -> bool {
    let env = *FILL_NAN_ENV.get_or_init(|| {
        std::env::var("LANZAR_FILL_NAN").map_or(false, |v| v == "1" || v == "true")
    });
    env || FILL_ALLOCATION_WITH_NAN.load(Ordering::Relaxed)
}

/// Programmatic switch for NaN filling of fresh allocations
pub fn set_fill_allocation_with_nan(value: bool) {
    FILL_ALLOCATION_WITH_NAN.store(value, Ordering::Relaxed);
}

/// Emit a warning for this call site at most once per process.
///
/// The guard is per-macro-expansion, mirroring a one-shot warn: repeated
/// launches with the same mismatched constraint stay quiet after the
/// first report.
macro_rules! warn_once {
    ($($arg:tt)*) => {{
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            tracing::warn!($($arg)*);
        });
    }};
}

pub(crate) use warn_once;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_option_parse() {
        assert_eq!(DumpOption::parse("cuda"), Some(DumpOption::Cuda));
        assert_eq!(DumpOption::parse(" launch_param "), Some(DumpOption::LaunchParam));
        assert_eq!(DumpOption::parse("bogus"), None);
    }

    #[test]
    fn test_nan_fill_toggle() {
        set_fill_allocation_with_nan(true);
        assert!(should_fill_allocation_with_nan());
        set_fill_allocation_with_nan(false);
    }
}
