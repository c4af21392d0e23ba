//! SVM exit handling over a zeroed VMCB and a simulated guest.

use core::sync::atomic::{AtomicU64, Ordering};

use tock_registers::interfaces::{Readable, Writeable};

use super::sim::{set_cpu, SimGuest, SimMemory, PAGE};
use crate::addr::HostPhysAddr;
use crate::cpuid::{BackendConfig, HYPERCALL_LEAF};
use crate::error::{HvError, STATUS_SUCCESS};
use crate::hypercall::{CommandPayload, HypercallOp, StorageRequest, PAYLOAD_SIZE};
use crate::regs::GeneralRegisters;
use crate::storage::slot;
use crate::svm::{SvmBackend, SvmExit, SvmExitCode, VmcbStruct};
use crate::{RootState, SlatFormat};

const KEY: u64 = 0x0123_4567_89ab_cdef;
const CPU: u32 = 3;
const VMCB_PA: usize = 0x8_0000;
const PAYLOAD_GVA: usize = 0x40_0000;
const HOST_ROOT: u64 = 0x1ab000;

struct Rig {
    g: SimGuest,
    root: Box<RootState>,
    caller: usize,
    vmcb: Box<VmcbStruct>,
    regs: GeneralRegisters,
}

impl Rig {
    fn new() -> Self {
        set_cpu(CPU);
        let mut g = SimGuest::new(SlatFormat::Npt);
        let caller = g.new_root();
        g.map_fresh(caller, PAYLOAD_GVA, PAYLOAD_SIZE);
        let mut vmcb = Box::new(VmcbStruct::zeroed());
        vmcb.control.nested_cr3.set(g.slat_root as u64);
        vmcb.state.cr3.set(caller as u64);
        Self {
            g,
            root: Box::new(RootState::new()),
            caller,
            vmcb,
            regs: GeneralRegisters::default(),
        }
    }

    fn config() -> BackendConfig {
        BackendConfig {
            auth_key: KEY,
            host_root: HOST_ROOT,
            ..Default::default()
        }
    }
}

/// Runs one exit; returns the exit code if it was forwarded.
fn run(backend: &SvmBackend<'_, SimMemory>, vmcb: &mut VmcbStruct, regs: &mut GeneralRegisters) -> Option<u64> {
    let exit = SvmExit {
        vmcb,
        vmcb_pa: HostPhysAddr::from_usize(VMCB_PA),
        regs,
    };
    backend.vmexit(exit, |e| e.vmcb.control.exit_code.get())
}

fn prepare(vmcb: &mut VmcbStruct, code: SvmExitCode) {
    vmcb.control.exit_code.set(code as u64);
    vmcb.state.rip.set(0x1000);
    vmcb.control.next_rip.set(0x1002);
}

fn prepare_hypercall(vmcb: &mut VmcbStruct, regs: &mut GeneralRegisters, op: HypercallOp, aux: u64, token: u64) {
    prepare(vmcb, SvmExitCode::CPUID);
    vmcb.state.rax.set(HYPERCALL_LEAF as u64);
    regs.rcx = op as u64;
    regs.rdx = PAYLOAD_GVA as u64;
    regs.r8 = aux;
    regs.r9 = token;
}

#[test]
fn test_storage_hypercall() {
    let mut rig = Rig::new();
    let req = StorageRequest {
        slot: 5,
        value: 0xDEAD,
        write: true,
    };
    rig.g.write_virt(rig.caller, PAYLOAD_GVA, CommandPayload::from(req).as_bytes());
    let backend = SvmBackend::new(&rig.root, &rig.g.mem, Rig::config());
    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::StorageQuery, 0, KEY);
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None);
    assert_eq!(rig.vmcb.state.rax.get(), STATUS_SUCCESS);
    assert_eq!(rig.vmcb.state.rip.get(), 0x1002);
    assert_eq!(rig.root.storage.get_on(CPU, 5), 0xDEAD);

    let req = StorageRequest {
        slot: 5,
        value: 0,
        write: false,
    };
    rig.g.write_virt(rig.caller, PAYLOAD_GVA, CommandPayload::from(req).as_bytes());
    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::StorageQuery, 0, KEY);
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None);
    let reply = rig.g.read_virt(rig.caller, PAYLOAD_GVA, PAYLOAD_SIZE);
    let reply = CommandPayload::from_bytes(reply.try_into().unwrap());
    assert_eq!(reply.storage_request().value, 0xDEAD);
}

#[test]
fn test_bad_token_still_advances() {
    let mut rig = Rig::new();
    let backend = SvmBackend::new(&rig.root, &rig.g.mem, Rig::config());
    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::GetHostRoot, 0, KEY + 1);
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None);
    assert_eq!(rig.vmcb.state.rax.get(), HvError::InvalidGuestParam as u64);
    assert_eq!(rig.vmcb.state.rip.get(), 0x1002);
}

#[test]
fn test_control_block_and_host_root() {
    let mut rig = Rig::new();
    let backend = SvmBackend::new(&rig.root, &rig.g.mem, Rig::config());
    let value = |rig: &Rig| {
        CommandPayload::from_bytes(
            rig.g.read_virt(rig.caller, PAYLOAD_GVA, PAYLOAD_SIZE)
                .try_into()
                .unwrap(),
        )
        .value()
    };
    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::GetControlBlock, 0, KEY);
    run(&backend, &mut rig.vmcb, &mut rig.regs);
    assert_eq!(rig.vmcb.state.rax.get(), STATUS_SUCCESS);
    assert_eq!(value(&rig), VMCB_PA as u64);

    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::GetHostRoot, 0, KEY);
    run(&backend, &mut rig.vmcb, &mut rig.regs);
    assert_eq!(value(&rig), HOST_ROOT);
}

#[test]
fn test_native_cpuid() {
    let mut rig = Rig::new();
    let backend = SvmBackend::new(&rig.root, &rig.g.mem, Rig::config());
    prepare(&mut rig.vmcb, SvmExitCode::CPUID);
    rig.vmcb.state.rax.set(0x8000_0001);
    rig.regs.rcx = 0;
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None);
    assert_eq!(rig.regs.rcx, (u32::MAX & !(1 << 2)) as u64);
    assert_eq!(rig.regs.rax, 0x8000_0001);
    assert_eq!(rig.vmcb.state.rax.get(), 0x8000_0001);
    assert_eq!(rig.vmcb.state.rip.get(), 0x1002);
}

#[test]
fn test_svm_instructions_raise_ud() {
    let mut rig = Rig::new();
    let backend = SvmBackend::new(&rig.root, &rig.g.mem, Rig::config());
    for code in [
        SvmExitCode::VMRUN,
        SvmExitCode::VMLOAD,
        SvmExitCode::VMSAVE,
        SvmExitCode::STGI,
        SvmExitCode::CLGI,
        SvmExitCode::SKINIT,
    ] {
        rig.vmcb.control.event_inj.set(0);
        prepare(&mut rig.vmcb, code);
        assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None, "{:?}", code);
        assert_eq!(rig.vmcb.control.event_inj.get(), 6 | (3 << 8) | (1 << 31));
        assert_eq!(rig.vmcb.state.rip.get(), 0x1000);
    }
}

#[test]
fn test_other_exits_forwarded() {
    let mut rig = Rig::new();
    let backend = SvmBackend::new(&rig.root, &rig.g.mem, Rig::config());
    // VMMCALL, MSR, IOIO, INTR.
    for code in [0x81u64, 0x7c, 0x7b, 0x60] {
        rig.vmcb.control.exit_code.set(code);
        rig.vmcb.state.rip.set(0x1000);
        assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), Some(code));
        assert_eq!(rig.vmcb.state.rip.get(), 0x1000);
        assert_eq!(rig.vmcb.control.event_inj.get(), 0);
    }
}

static FAULT_GPA: AtomicU64 = AtomicU64::new(0);

extern "C" fn record_fault(gpa: u64) {
    FAULT_GPA.store(gpa, Ordering::SeqCst);
}

#[test]
fn test_nested_fault_after_slat_switch() {
    let mut rig = Rig::new();
    let backend = SvmBackend::new(&rig.root, &rig.g.mem, Rig::config());

    // The first exit runs global setup, which clears the shared slots.
    prepare(&mut rig.vmcb, SvmExitCode::NPF);
    rig.vmcb.control.exit_info_2.set(0xfee0_0000);
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), Some(SvmExitCode::NPF as u64));

    rig.root
        .storage
        .set_on(CPU, slot::FAULT_HANDLER, record_fault as usize as u64);
    // Handler installed, but this processor still runs on the original tables.
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), Some(SvmExitCode::NPF as u64));
    assert_eq!(FAULT_GPA.load(Ordering::SeqCst), 0);

    // Switch to a copy of the nested tables; flag bits in the value are dropped.
    let copy = rig.g.mem.alloc_frame();
    let top = rig.g.mem.read(rig.g.slat_root, PAGE);
    rig.g.mem.write(copy, &top);
    rig.g.write_virt(
        rig.caller,
        PAYLOAD_GVA,
        CommandPayload::with_value(copy as u64 | 0x18).as_bytes(),
    );
    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::SetSlatBase, 0, KEY);
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None);
    assert_eq!(rig.vmcb.state.rax.get(), STATUS_SUCCESS);
    assert_eq!(rig.vmcb.control.nested_cr3.get(), copy as u64);
    assert_eq!(rig.vmcb.control.tlb_control.get(), 1);
    assert!(rig.root.storage.init_bit(CPU));

    // The next hypercall drops the pending flush.
    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::EnableSlat, 0, KEY);
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None);
    assert_eq!(rig.vmcb.control.tlb_control.get(), 0);
    assert!(rig.vmcb.nested_paging_enabled());

    prepare(&mut rig.vmcb, SvmExitCode::NPF);
    rig.vmcb.control.exit_info_2.set(0xfee0_0000);
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None);
    assert_eq!(FAULT_GPA.load(Ordering::SeqCst), 0xfee0_0000);
    assert_eq!(rig.vmcb.state.rip.get(), 0x1000);
}

#[test]
fn test_setup_without_key() {
    let mut rig = Rig::new();
    let backend = SvmBackend::new(&rig.root, &rig.g.mem, BackendConfig::default());
    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::GetGuestRoot, 0, 0);
    assert_eq!(run(&backend, &mut rig.vmcb, &mut rig.regs), None);
    assert_eq!(rig.vmcb.state.rax.get(), HvError::InvalidGuestParam as u64);
    assert!(rig.root.caps.get().is_some());

    // A second backend on the same root keeps the first binding.
    let other = SvmBackend::new(&rig.root, &rig.g.mem, Rig::config());
    prepare_hypercall(&mut rig.vmcb, &mut rig.regs, HypercallOp::GetGuestRoot, 0, 0);
    assert_eq!(run(&other, &mut rig.vmcb, &mut rig.regs), None);
    assert_eq!(rig.root.auth_key(), 0);
}
