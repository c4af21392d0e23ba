//! Intel VMX backend: handles the exits a previously installed VMX
//! hypervisor forwards to this layer.

mod definitions;
mod vmcs;

use x86::irq::INVALID_OPCODE_VECTOR;
use x86::vmx::vmcs::control::{self, PrimaryControls, SecondaryControls};
use x86::vmx::vmcs::{guest, ro};

pub use self::definitions::{exception_entry_info, VmxExitReason};
pub use self::vmcs::{CurrentVmcs, VmcsAccess};

use crate::addr::SlatFormat;
use crate::backend::BackendCore;
use crate::caps::{ArchCallbacks, ArchData};
use crate::cpuid::BackendConfig;
use crate::hal::{self, HostMemory};
use crate::hypercall::HypercallArgs;
use crate::regs::GeneralRegisters;
use crate::storage::StorageTable;
use crate::RootState;

pub fn has_hardware_support() -> bool {
    if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}

/// One VMX exit as handed over by the exit stub.
pub struct VmxExit<'a> {
    pub vmcs: &'a mut dyn VmcsAccess,
    pub regs: &'a mut GeneralRegisters,
}

/// Backend state visible to the capability callbacks during one exit.
struct VmxArch<'a> {
    vmcs: &'a mut dyn VmcsAccess,
    host_root: u64,
    storage: &'a StorageTable,
    cpu: u32,
}

fn arch<'a>(data: ArchData) -> Option<&'a mut VmxArch<'a>> {
    // SAFETY: `VmxArch` is the only state tagged `Ept`, and it outlives
    // the exit it was built for.
    unsafe { data.as_mut::<VmxArch<'a>>(SlatFormat::Ept) }
}

fn guest_root(data: ArchData) -> u64 {
    arch(data).map_or(0, |a| a.vmcs.read(guest::CR3))
}

fn host_root(data: ArchData) -> u64 {
    arch(data).map_or(0, |a| a.host_root)
}

fn slat_base(data: ArchData) -> u64 {
    arch(data).map_or(0, |a| a.vmcs.read(control::EPTP_FULL))
}

/// Installs a full EPT pointer (root plus memory type and walk length) and
/// marks this processor as running on it.
fn set_slat_base(data: ArchData, eptp: u64) {
    if let Some(a) = arch(data) {
        a.vmcs.write(control::EPTP_FULL, eptp);
        a.vmcs.invalidate_ept(eptp);
        a.storage.set_init_bit(a.cpu, true);
    }
}

/// Sets or clears ENABLE_EPT, turning on the secondary controls first if
/// EPT is being enabled. Other control bits are kept as they are.
fn update_secondary(a: &mut VmxArch<'_>, enable: bool) {
    let ept = SecondaryControls::ENABLE_EPT.bits() as u64;
    let secondary = a.vmcs.read(control::SECONDARY_PROCBASED_EXEC_CONTROLS);
    if enable {
        let primary = a.vmcs.read(control::PRIMARY_PROCBASED_EXEC_CONTROLS);
        a.vmcs.write(
            control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            primary | PrimaryControls::SECONDARY_CONTROLS.bits() as u64,
        );
        a.vmcs
            .write(control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary | ept);
    } else {
        a.vmcs
            .write(control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary & !ept);
    }
}

fn enable_slat(data: ArchData) {
    if let Some(a) = arch(data) {
        update_secondary(a, true);
    }
}

fn disable_slat(data: ArchData) {
    if let Some(a) = arch(data) {
        update_secondary(a, false);
    }
}

/// VMX has no addressable control block.
fn control_block_pa(_data: ArchData) -> u64 {
    0
}

fn flush_slat_tlb(data: ArchData) {
    if let Some(a) = arch(data) {
        let eptp = a.vmcs.read(control::EPTP_FULL);
        a.vmcs.invalidate_ept(eptp);
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

/// Capability table of the VMX backend.
pub const VMX_CALLBACKS: ArchCallbacks = ArchCallbacks {
    slat_format: SlatFormat::Ept,
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

enum Resume {
    Advance,
    Stay,
}

pub struct VmxBackend<'a, M: HostMemory + ?Sized> {
    core: BackendCore<'a, M>,
}

impl<'a, M: HostMemory + ?Sized> VmxBackend<'a, M> {
    pub fn new(root: &'a RootState, mem: &'a M, config: BackendConfig) -> Self {
        Self {
            core: BackendCore::new(root, mem, config),
        }
    }

    /// Handles one exit. Returns `None` if the exit was consumed here;
    /// otherwise calls `previous` with the untouched exit and returns its
    /// result.
    pub fn vmexit<R>(&self, exit: VmxExit<'_>, previous: impl FnOnce(VmxExit<'_>) -> R) -> Option<R> {
        let cpu = hal::current_apic_id();
        self.core.setup(cpu, VMX_CALLBACKS);
        let mut exit = exit;
        match self.handle(&mut exit, cpu) {
            Some(Resume::Advance) => {
                let rip = exit.vmcs.read(guest::RIP)
                    + exit.vmcs.read(ro::VMEXIT_INSTRUCTION_LEN);
                exit.vmcs.write(guest::RIP, rip);
                None
            }
            Some(Resume::Stay) => None,
            None => Some(previous(exit)),
        }
    }

    fn arch_state<'e>(&self, exit: &'e mut VmxExit<'_>, cpu: u32) -> VmxArch<'e>
    where
        'a: 'e,
    {
        VmxArch {
            vmcs: &mut *exit.vmcs,
            host_root: self.core.config.host_root,
            storage: &self.core.root.storage,
            cpu,
        }
    }

    fn handle(&self, exit: &mut VmxExit<'_>, cpu: u32) -> Option<Resume> {
        // Bits 15:0 hold the basic exit reason.
        let basic = exit.vmcs.read(ro::EXIT_REASON) as u32 & 0xffff;
        let reason = VmxExitReason::try_from(basic).ok()?;
        match reason {
            VmxExitReason::CPUID => Some(self.handle_cpuid(exit, cpu)),
            reason if reason.is_vmx_instruction() => {
                trace!("[vmexit] cpu {} {:?} -> #UD", cpu, reason);
                exit.vmcs.write(
                    control::VMENTRY_INTERRUPTION_INFO_FIELD,
                    exception_entry_info(INVALID_OPCODE_VECTOR) as u64,
                );
                Some(Resume::Stay)
            }
            VmxExitReason::EPT_VIOLATION => {
                let gpa = exit.vmcs.read(ro::GUEST_PHYSICAL_ADDR_FULL);
                let mut state = self.arch_state(exit, cpu);
                self.core
                    .slat_fault(cpu, gpa, ArchData::new(&mut state, SlatFormat::Ept))
                    .then_some(Resume::Stay)
            }
            // MSR accesses and VMCALL belong to the previous handler.
            _ => None,
        }
    }

    fn handle_cpuid(&self, exit: &mut VmxExit<'_>, cpu: u32) -> Resume {
        let leaf = exit.regs.rax as u32;
        let subleaf = exit.regs.rcx as u32;
        if self.core.is_hypercall(leaf) {
            let args = HypercallArgs::from_regs(exit.regs);
            let guest_root = exit.vmcs.read(guest::CR3);
            let guest_rip = exit.vmcs.read(guest::RIP);
            let mut state = self.arch_state(exit, cpu);
            let arch = ArchData::new(&mut state, SlatFormat::Ept);
            let status = self.core.hypercall(args, guest_root, guest_rip, cpu, arch);
            exit.regs.rax = status;
        } else {
            let res = self.core.cpuid(leaf, subleaf);
            exit.regs.set_cpuid_result(res);
        }
        Resume::Advance
    }
}
