//! Exit-path logic common to the VMX and SVM backends.

use raw_cpuid::CpuIdResult;

use crate::caps::{ArchCallbacks, ArchData};
use crate::cpuid::{self, BackendConfig};
use crate::hal::HostMemory;
use crate::hypercall::{Dispatcher, ExitContext, HypercallArgs};
use crate::storage::slot;
use crate::RootState;

/// Signature of the handler stored in [`slot::FAULT_HANDLER`]; it receives
/// the faulting guest-physical address.
pub type SlatFaultHandler = extern "C" fn(u64);

pub(crate) struct BackendCore<'a, M: HostMemory + ?Sized> {
    pub root: &'a RootState,
    pub mem: &'a M,
    pub config: BackendConfig,
}

impl<'a, M: HostMemory + ?Sized> BackendCore<'a, M> {
    pub fn new(root: &'a RootState, mem: &'a M, config: BackendConfig) -> Self {
        Self {
            root,
            mem,
            config,
        }
    }

    /// Global setup on the first exit of any processor, then per-processor
    /// setup on the first exit of `cpu`. Both happen once per [`RootState`],
    /// whichever backend gets there first.
    pub fn setup(&self, cpu: u32, callbacks: ArchCallbacks) {
        self.root.setup.run(|| {
            self.root.storage.initialize_global();
            if self.root.caps.register(callbacks).is_err() {
                warn!("[vmexit] capability table already bound, keeping it");
            }
            if self.config.auth_key != 0 {
                self.root.set_auth_key(self.config.auth_key);
            }
            info!("[vmexit] global setup done on cpu {}", cpu);
        });
        if self.root.cpu_ready.claim(cpu) == Some(true) {
            self.root.storage.initialize(cpu);
            debug!("[vmexit] cpu {} ready", cpu);
        }
    }

    pub fn is_hypercall(&self, leaf: u32) -> bool {
        leaf == self.config.hypercall_leaf
    }

    pub fn hypercall(
        &self,
        args: HypercallArgs,
        guest_root: u64,
        guest_rip: u64,
        cpu: u32,
        arch: ArchData,
    ) -> u64 {
        let mut ctx = ExitContext::new(args, guest_root, guest_rip, cpu).with_arch(arch, ArchData::NONE);
        Dispatcher::new(self.root, self.mem).dispatch(&mut ctx)
    }

    pub fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        cpuid::emulate(leaf, subleaf, self.config.cpuid_policy)
    }

    /// Forwards a second-level fault to the registered handler if `cpu`
    /// runs on tables installed through a hypercall. Returns whether the
    /// fault was handled.
    pub fn slat_fault(&self, cpu: u32, gpa: u64, arch: ArchData) -> bool {
        let handler = self.root.storage.get_on(cpu, slot::FAULT_HANDLER);
        if handler == 0 {
            return false;
        }
        let installed = self
            .root
            .caps
            .get()
            .and_then(|caps| caps.init_bit(arch, cpu).ok())
            .unwrap_or(false);
        if !installed {
            return false;
        }
        trace!("[vmexit] cpu {} slat fault at {:#x}", cpu, gpa);
        // SAFETY: the slot is only written by the authenticated controller,
        // which stores the address of a host-resident `SlatFaultHandler`.
        let handler: SlatFaultHandler = unsafe { core::mem::transmute(handler as usize) };
        handler(gpa);
        true
    }
}
