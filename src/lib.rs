#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[macro_use]
mod error;
mod addr;
mod backend;
mod caps;
mod cpuid;
mod hal;
mod hypercall;
mod once;
mod paging;
mod regs;
mod storage;
mod translate;

#[cfg(feature = "svm")]
pub mod svm;
#[cfg(feature = "vmx")]
pub mod vmx;

#[cfg(test)]
mod tests;

pub use addr::{
    AddressSpace, AddressSpaceContext, GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr,
    SlatFormat, SlatRoot,
};
pub use backend::SlatFaultHandler;
pub use caps::{ArchCallbacks, ArchData, CapabilityTable};
pub use cpuid::{BackendConfig, CpuidPolicy, HYPERCALL_LEAF};
pub use error::{HvError, HvResult, STATUS_SUCCESS};
pub use hal::{HostIf, HostMemory, MapKind, MapWindow, ReservedWindows, MAX_CPUS};
#[cfg(target_arch = "x86_64")]
pub use hal::{native_apic_id, native_cpuid};
pub use hypercall::{
    CommandPayload, CopyRequest, Dispatcher, ExitContext, HypercallArgs, HypercallOp,
    StorageRequest, TranslateRequest, PAYLOAD_SIZE,
};
pub use once::{OneShot, PerCpuFlags};
pub use paging::{EntryShape, EptEntry, EptFlags, PageLevel, PageSize, Translation};
pub use regs::GeneralRegisters;
pub use storage::{slot, StorageTable};
pub use translate::Translator;

use core::sync::atomic::{AtomicU64, Ordering};

/// State shared by every processor and both backends: the storage table,
/// the capability table and the hypercall authentication key.
pub struct RootState {
    pub storage: StorageTable,
    pub caps: CapabilityTable,
    auth_key: AtomicU64,
    /// Guards global setup on the first exit of any processor.
    pub(crate) setup: OneShot,
    /// Set once a processor has taken its first exit.
    pub(crate) cpu_ready: PerCpuFlags,
}

impl RootState {
    pub const fn new() -> Self {
        Self {
            storage: StorageTable::new(),
            caps: CapabilityTable::new(),
            auth_key: AtomicU64::new(0),
            setup: OneShot::new(),
            cpu_ready: PerCpuFlags::new(),
        }
    }

    /// A hypercall is accepted only when a key is installed and the token
    /// matches it.
    pub fn accepts(&self, token: u64) -> bool {
        let key = self.auth_key.load(Ordering::Acquire);
        key != 0 && key == token
    }

    pub fn set_auth_key(&self, key: u64) {
        self.auth_key.store(key, Ordering::Release);
    }

    pub fn auth_key(&self) -> u64 {
        self.auth_key.load(Ordering::Acquire)
    }
}

impl Default for RootState {
    fn default() -> Self {
        Self::new()
    }
}
