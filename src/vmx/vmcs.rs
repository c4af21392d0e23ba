/// Access to the VMCS of the exiting virtual processor. Fields are named by
/// their `x86::vmx::vmcs` encodings.
pub trait VmcsAccess {
    fn read(&self, field: u32) -> u64;
    fn write(&mut self, field: u32, value: u64);
    /// Drops cached guest-physical translations derived from `eptp`.
    fn invalidate_ept(&mut self, eptp: u64);
}

/// The VMCS current on this processor, accessed with VMREAD/VMWRITE.
pub struct CurrentVmcs;

impl VmcsAccess for CurrentVmcs {
    fn read(&self, field: u32) -> u64 {
        // SAFETY: only called in VMX root operation on the exit path, with
        // the exiting VMCS current.
        unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or_else(|e| {
            warn!("[vmexit] VMREAD {:#x} failed: {:?}", field, e);
            0
        })
    }

    fn write(&mut self, field: u32, value: u64) {
        // SAFETY: as in `read`.
        if let Err(e) = unsafe { x86::bits64::vmx::vmwrite(field, value) } {
            warn!("[vmexit] VMWRITE {:#x} = {:#x} failed: {:?}", field, value, e);
        }
    }

    fn invalidate_ept(&mut self, eptp: u64) {
        invept_single_context(eptp);
    }
}

#[repr(C, align(16))]
struct InveptDescriptor {
    eptp: u64,
    _reserved: u64,
}

fn invept_single_context(eptp: u64) {
    const SINGLE_CONTEXT: u64 = 1;
    let desc = InveptDescriptor {
        eptp,
        _reserved: 0,
    };
    // SAFETY: VMX root operation; the descriptor is a valid 128-bit operand.
    unsafe {
        core::arch::asm!(
            "invept {0}, [{1}]",
            in(reg) SINGLE_CONTEXT,
            in(reg) &desc,
            options(nostack),
        );
    }
}
