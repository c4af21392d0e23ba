//! AMD SVM backend: handles the exits a previously installed SVM hypervisor
//! forwards to this layer.

mod definitions;
mod vmcb;

use x86::irq::INVALID_OPCODE_VECTOR;

pub use self::definitions::SvmExitCode;
pub use self::vmcb::{VmcbControlArea, VmcbStateSaveArea, VmcbStruct};

use tock_registers::interfaces::{Readable, Writeable};

use crate::addr::{HostPhysAddr, SlatFormat, ROOT_FRAME_MASK};
use crate::backend::BackendCore;
use crate::caps::{ArchCallbacks, ArchData};
use crate::cpuid::BackendConfig;
use crate::hal::{self, HostMemory};
use crate::hypercall::HypercallArgs;
use crate::regs::GeneralRegisters;
use crate::storage::StorageTable;
use crate::RootState;

pub fn has_hardware_support() -> bool {
    if let Some(ext) = raw_cpuid::CpuId::new().get_extended_processor_and_feature_identifiers() {
        ext.has_svm()
    } else {
        false
    }
}

/// One SVM exit as handed over by the exit stub.
pub struct SvmExit<'a> {
    pub vmcb: &'a mut VmcbStruct,
    /// Host-physical address of `vmcb`.
    pub vmcb_pa: HostPhysAddr,
    pub regs: &'a mut GeneralRegisters,
}

/// Backend state visible to the capability callbacks during one exit.
struct SvmArch<'a> {
    vmcb: &'a mut VmcbStruct,
    vmcb_pa: HostPhysAddr,
    host_root: u64,
    storage: &'a StorageTable,
    cpu: u32,
}

fn arch<'a>(data: ArchData) -> Option<&'a mut SvmArch<'a>> {
    // SAFETY: `SvmArch` is the only state tagged `Npt`, and it outlives
    // the exit it was built for.
    unsafe { data.as_mut::<SvmArch<'a>>(SlatFormat::Npt) }
}

fn guest_root(data: ArchData) -> u64 {
    arch(data).map_or(0, |a| a.vmcb.state.cr3.get())
}

fn host_root(data: ArchData) -> u64 {
    arch(data).map_or(0, |a| a.host_root)
}

fn slat_base(data: ArchData) -> u64 {
    arch(data).map_or(0, |a| a.vmcb.control.nested_cr3.get())
}

fn set_slat_base(data: ArchData, value: u64) {
    if let Some(a) = arch(data) {
        a.vmcb.set_nested_cr3(value & ROOT_FRAME_MASK);
        a.storage.set_init_bit(a.cpu, true);
    }
}

fn enable_slat(data: ArchData) {
    if let Some(a) = arch(data) {
        a.vmcb.set_nested_paging(true);
    }
}

fn disable_slat(data: ArchData) {
    if let Some(a) = arch(data) {
        a.vmcb.set_nested_paging(false);
    }
}

fn control_block_pa(data: ArchData) -> u64 {
    arch(data).map_or(0, |a| a.vmcb_pa.as_usize() as u64)
}

fn flush_slat_tlb(data: ArchData) {
    if let Some(a) = arch(data) {
        a.vmcb.set_tlb_control(true);
    }
}

fn set_init_bit(data: ArchData, cpu: u32, value: bool) {
    if let Some(a) = arch(data) {
        a.storage.set_init_bit(cpu, value);
    }
}

fn init_bit(data: ArchData, cpu: u32) -> bool {
    arch(data).is_some_and(|a| a.storage.init_bit(cpu))
}

/// Capability table of the SVM backend.
pub const SVM_CALLBACKS: ArchCallbacks = ArchCallbacks {
    slat_format: SlatFormat::Npt,
    guest_root: Some(guest_root),
    host_root: Some(host_root),
    slat_base: Some(slat_base),
    set_slat_base: Some(set_slat_base),
    enable_slat: Some(enable_slat),
    disable_slat: Some(disable_slat),
    control_block_pa: Some(control_block_pa),
    flush_slat_tlb: Some(flush_slat_tlb),
    set_init_bit: Some(set_init_bit),
    init_bit: Some(init_bit),
};

/// What to do with a claimed exit before resuming the guest.
enum Resume {
    /// Skip the intercepted instruction.
    Advance,
    /// Re-run from the same RIP, e.g. after injecting an exception.
    Stay,
}

pub struct SvmBackend<'a, M: HostMemory + ?Sized> {
    core: BackendCore<'a, M>,
}

impl<'a, M: HostMemory + ?Sized> SvmBackend<'a, M> {
    pub fn new(root: &'a RootState, mem: &'a M, config: BackendConfig) -> Self {
        Self {
            core: BackendCore::new(root, mem, config),
        }
    }

    /// Handles one exit. Returns `None` if the exit was consumed here;
    /// otherwise calls `previous` with the untouched exit and returns its
    /// result.
    pub fn vmexit<R>(&self, exit: SvmExit<'_>, previous: impl FnOnce(SvmExit<'_>) -> R) -> Option<R> {
        let cpu = hal::current_apic_id();
        self.core.setup(cpu, SVM_CALLBACKS);
        let mut exit = exit;
        match self.handle(&mut exit, cpu) {
            Some(Resume::Advance) => {
                exit.vmcb.advance_rip();
                None
            }
            Some(Resume::Stay) => None,
            None => Some(previous(exit)),
        }
    }

    fn handle(&self, exit: &mut SvmExit<'_>, cpu: u32) -> Option<Resume> {
        let code = match SvmExitCode::try_from(exit.vmcb.control.exit_code.get()) {
            Ok(code) => code,
            Err(_) => return None,
        };
        match code {
            SvmExitCode::CPUID => Some(self.handle_cpuid(exit, cpu)),
            code if code.is_svm_instruction() => {
                trace!("[vmexit] cpu {} {:?} -> #UD", cpu, code);
                exit.vmcb.inject_exception(INVALID_OPCODE_VECTOR);
                Some(Resume::Stay)
            }
            SvmExitCode::NPF => {
                let gpa = exit.vmcb.control.exit_info_2.get();
                let mut state = self.arch_state(exit, cpu);
                self.core
                    .slat_fault(cpu, gpa, ArchData::new(&mut state, SlatFormat::Npt))
                    .then_some(Resume::Stay)
            }
            // MSR accesses and VMMCALL belong to the previous handler.
            _ => None,
        }
    }

    fn arch_state<'e>(&self, exit: &'e mut SvmExit<'_>, cpu: u32) -> SvmArch<'e>
    where
        'a: 'e,
    {
        SvmArch {
            vmcb: &mut *exit.vmcb,
            vmcb_pa: exit.vmcb_pa,
            host_root: self.core.config.host_root,
            storage: &self.core.root.storage,
            cpu,
        }
    }

    fn handle_cpuid(&self, exit: &mut SvmExit<'_>, cpu: u32) -> Resume {
        let leaf = exit.vmcb.state.rax.get() as u32;
        let subleaf = exit.regs.rcx as u32;
        if self.core.is_hypercall(leaf) {
            // A previous hypercall may have requested a flush.
            exit.vmcb.set_tlb_control(false);
            let args = HypercallArgs::from_regs(exit.regs);
            let guest_root = exit.vmcb.state.cr3.get();
            let guest_rip = exit.vmcb.state.rip.get();
            let mut state = self.arch_state(exit, cpu);
            let arch = ArchData::new(&mut state, SlatFormat::Npt);
            let status = self.core.hypercall(args, guest_root, guest_rip, cpu, arch);
            exit.vmcb.state.rax.set(status);
        } else {
            let res = self.core.cpuid(leaf, subleaf);
            exit.regs.set_cpuid_result(res);
            exit.vmcb.state.rax.set(res.eax as u64);
        }
        Resume::Advance
    }
}
