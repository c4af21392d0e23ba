/// General-purpose registers saved by the exit stub, in the order it pushes
/// them. `rsp` lives in the control block instead.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralRegisters {
    /// Loads the four CPUID output registers.
    pub fn set_cpuid_result(&mut self, res: raw_cpuid::CpuIdResult) {
        self.rax = res.eax as u64;
        self.rbx = res.ebx as u64;
        self.rcx = res.ecx as u64;
        self.rdx = res.edx as u64;
    }
}
