use numeric_enum_macro::numeric_enum;

numeric_enum! {
    #[repr(u32)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[allow(non_camel_case_types)]
    /// VMX basic exit reasons (SDM Vol. 3D, Appendix C). Only the reasons
    /// this crate acts on are listed; everything else is forwarded.
    pub enum VmxExitReason {
        CPUID = 10,
        VMCLEAR = 19,
        VMLAUNCH = 20,
        VMPTRLD = 21,
        VMPTRST = 22,
        VMREAD = 23,
        VMRESUME = 24,
        VMWRITE = 25,
        VMXOFF = 26,
        VMXON = 27,
        EPT_VIOLATION = 48,
        INVEPT = 50,
        INVVPID = 53,
    }
}

impl VmxExitReason {
    /// VMX instructions the guest may not use; they raise #UD instead.
    pub const fn is_vmx_instruction(self) -> bool {
        matches!(
            self,
            Self::VMCLEAR
                | Self::VMLAUNCH
                | Self::VMPTRLD
                | Self::VMPTRST
                | Self::VMREAD
                | Self::VMRESUME
                | Self::VMWRITE
                | Self::VMXOFF
                | Self::VMXON
                | Self::INVEPT
                | Self::INVVPID
        )
    }
}

/// VM-entry interruption-information encoding for a hardware exception
/// without an error code.
pub const fn exception_entry_info(vector: u8) -> u32 {
    const TYPE_HARDWARE_EXCEPTION: u32 = 3;
    const VALID: u32 = 1 << 31;
    vector as u32 | (TYPE_HARDWARE_EXCEPTION << 8) | VALID
}
