use numeric_enum_macro::numeric_enum;

numeric_enum! {
    #[repr(u64)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[allow(non_camel_case_types)]
    /// `EXITCODE` values in the VMCB (AMD APM Vol. 2, Appendix C). Only the
    /// codes this crate acts on are listed; everything else is forwarded.
    pub enum SvmExitCode {
        CPUID = 0x72,
        VMRUN = 0x80,
        VMLOAD = 0x82,
        VMSAVE = 0x83,
        STGI = 0x84,
        CLGI = 0x85,
        SKINIT = 0x86,
        NPF = 0x400,
    }
}

impl SvmExitCode {
    /// SVM instructions the guest may not use; they raise #UD instead.
    pub const fn is_svm_instruction(self) -> bool {
        matches!(
            self,
            Self::VMRUN | Self::VMLOAD | Self::VMSAVE | Self::STGI | Self::CLGI | Self::SKINIT
        )
    }
}
