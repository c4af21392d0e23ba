//! CPUID emulation shared by both backends.

use bit_field::BitField;
use bitflags::bitflags;
use raw_cpuid::CpuIdResult;

use crate::hal;

/// CPUID leaf that guests use to issue hypercalls.
pub const HYPERCALL_LEAF: u32 = 0x1337_1337;

const LEAF_FEATURE_INFO: u32 = 0x1;
const LEAF_EXT_FEATURE_INFO: u32 = 0x8000_0001;
/// CPUID.01H:ECX.VMX
const FEATURE_VMX: usize = 5;
/// CPUID.80000001H:ECX.SVM
const FEATURE_SVM: usize = 2;

bitflags! {
    /// Feature bits removed from native CPUID results.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CpuidPolicy: u32 {
        /// Clear the VMX feature bit, so guests do not try to nest.
        const HIDE_VMX = 1 << 0;
        /// Clear the SVM feature bit.
        const HIDE_SVM = 1 << 1;
    }
}

impl Default for CpuidPolicy {
    fn default() -> Self {
        Self::HIDE_VMX | Self::HIDE_SVM
    }
}

/// Per-backend settings, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct BackendConfig {
    /// Leaf that triggers hypercall dispatch instead of CPUID emulation.
    pub hypercall_leaf: u32,
    pub cpuid_policy: CpuidPolicy,
    /// Hypercall key installed during global setup; 0 leaves hypercalls
    /// disabled until the host installs one.
    pub auth_key: u64,
    /// Root register value of the hypervisor's own address space.
    pub host_root: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            hypercall_leaf: HYPERCALL_LEAF,
            cpuid_policy: CpuidPolicy::default(),
            auth_key: 0,
            host_root: 0,
        }
    }
}

/// Applies `policy` to a native result.
pub fn filter(leaf: u32, res: CpuIdResult, policy: CpuidPolicy) -> CpuIdResult {
    let mut res = res;
    match leaf {
        LEAF_FEATURE_INFO if policy.contains(CpuidPolicy::HIDE_VMX) => {
            res.ecx.set_bit(FEATURE_VMX, false);
        }
        LEAF_EXT_FEATURE_INFO if policy.contains(CpuidPolicy::HIDE_SVM) => {
            res.ecx.set_bit(FEATURE_SVM, false);
        }
        _ => {}
    }
    res
}

/// Executes CPUID on the current processor and filters the result.
pub fn emulate(leaf: u32, subleaf: u32, policy: CpuidPolicy) -> CpuIdResult {
    let res = filter(leaf, hal::cpuid(leaf, subleaf), policy);
    #[cfg(feature = "tracing")]
    trace!(
        "cpuid {:#x}.{:#x} -> {:#x} {:#x} {:#x} {:#x}",
        leaf,
        subleaf,
        res.eax,
        res.ebx,
        res.ecx,
        res.edx
    );
    res
}
