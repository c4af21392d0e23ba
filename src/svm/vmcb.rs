// vmcb.rs: AMD-SVM Virtual-Machine Control Block layout
//
// A VMCB is a single 4-KiB page split into a 1024-byte Control Area (offset
// 0x0) and a 3-KiB State-Save Area (offset 0x400). Every field lives at a
// fixed offset, so the exit handler reads and writes it with plain memory
// accesses through the tock-registers proxies below.
//
// Reference: AMD 64 APM v2, Appendix B VMCB Layout

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

register_bitfields![u32,
    // VMCB Clean-Bits 15.15.3
    pub VmcbCleanBits [
        INTERCEPTS  0,
        IOPM        1,
        ASID        2,
        TPR         3,
        NP          4,
        CRx         5,
        DRx         6,
        DT          7,
        SEG         8,
        CR2         9,
        LBR         10,
        AVIC        11,
        CET         12,
    ],

    // EVENTINJ 15.20
    pub EventInj [
        VECTOR      OFFSET(0)  NUMBITS(8) [],
        TYPE        OFFSET(8)  NUMBITS(3) [
            ExternalInterrupt = 0,
            Nmi = 2,
            Exception = 3,
            SoftwareInterrupt = 4,
        ],
        ERROR_VALID OFFSET(11) NUMBITS(1) [],
        VALID       OFFSET(31) NUMBITS(1) [],
    ],
];

register_bitfields![u64,
    pub NestedCtl [
        NP_ENABLE        0,
        SEV_ENABLE       1,
        SEV_ES_ENABLE    2,
        GMET_ENABLE      3,   // Guest-Mode-Exec-Trap
        SSCheckEn        4,
        VTE_ENABLE       5,   // Virtual Transparent Encryption
        RO_GPT_EN        6,   // Read-Only Guest Page Tables
        INVLPGB_TLBSYNC  7,
    ],
];

register_bitfields![u8,
    pub VmcbTlbControl [
        CONTROL OFFSET(0) NUMBITS(3) [
            DoNothing                = 0,
            FlushAllOnVmrun          = 1,
            FlushGuestTlb            = 3,
            FlushGuestNonGlobalTlb   = 7,
        ]
    ]
];

register_structs![
    pub VmcbControlArea {
        (0x0000 => pub intercept_cr:         ReadWrite<u32>),
        (0x0004 => pub intercept_dr:         ReadWrite<u32>),
        (0x0008 => pub intercept_exceptions: ReadWrite<u32>),
        (0x000C => pub intercept_vector3:    ReadWrite<u32>),
        (0x0010 => pub intercept_vector4:    ReadWrite<u32>),
        (0x0014 => pub intercept_vector5:    ReadWrite<u32>),
        (0x0018 => _reserved_0018),

        (0x0040 => pub iopm_base_pa:          ReadWrite<u64>),
        (0x0048 => pub msrpm_base_pa:         ReadWrite<u64>),
        (0x0050 => pub tsc_offset:            ReadWrite<u64>),

        (0x0058 => pub guest_asid:            ReadWrite<u32>),
        (0x005C => pub tlb_control:           ReadWrite<u8, VmcbTlbControl::Register>),
        (0x005D => _reserved_005D),

        (0x0070 => pub exit_code:             ReadWrite<u64>),
        (0x0078 => pub exit_info_1:           ReadWrite<u64>),
        (0x0080 => pub exit_info_2:           ReadWrite<u64>),
        (0x0088 => pub exit_int_info:         ReadWrite<u32>),
        (0x008C => pub exit_int_info_err:     ReadWrite<u32>),

        (0x0090 => pub nested_ctl:            ReadWrite<u64, NestedCtl::Register>),
        (0x0098 => pub avic_vapic_bar:        ReadWrite<u64>),
        (0x00A0 => pub ghcb_gpa:              ReadWrite<u64>),

        (0x00A8 => pub event_inj:             ReadWrite<u32, EventInj::Register>),
        (0x00AC => pub event_inj_err:         ReadWrite<u32>),
        (0x00B0 => pub nested_cr3:            ReadWrite<u64>),
        (0x00B8 => pub virt_ext:              ReadWrite<u64>),

        (0x00C0 => pub clean_bits:            ReadWrite<u32, VmcbCleanBits::Register>),
        (0x00C4 => _reserved_00C4),
        (0x00C8 => pub next_rip:              ReadWrite<u64>),

        (0x00D0 => pub insn_len:              ReadWrite<u8>),
        (0x00D1 => pub insn_bytes:            [ReadWrite<u8>; 15]),
        (0x00E0 => _reserved_00E0),

        (0x0400 => @END),
    }
];

register_structs![
    pub VmcbSegment {
        (0x0 => pub selector: ReadWrite<u16>),
        (0x2 => pub attr:     ReadWrite<u16>),
        (0x4 => pub limit:    ReadWrite<u32>),
        (0x8 => pub base:     ReadWrite<u64>),
        (0x10 => @END),
    }
];

register_structs![
    pub VmcbStateSaveArea {
        (0x0000 => pub es:   VmcbSegment),
        (0x0010 => pub cs:   VmcbSegment),
        (0x0020 => pub ss:   VmcbSegment),
        (0x0030 => pub ds:   VmcbSegment),
        (0x0040 => pub fs:   VmcbSegment),
        (0x0050 => pub gs:   VmcbSegment),
        (0x0060 => pub gdtr: VmcbSegment),
        (0x0070 => pub ldtr: VmcbSegment),
        (0x0080 => pub idtr: VmcbSegment),
        (0x0090 => pub tr:   VmcbSegment),
        (0x00A0 => _reserved_00A0),

        (0x00CB => pub cpl:  ReadWrite<u8>),
        (0x00CC => _reserved_00CC),

        (0x00D0 => pub efer: ReadWrite<u64>),
        (0x00D8 => _reserved_00D8),

        (0x0148 => pub cr4:    ReadWrite<u64>),
        (0x0150 => pub cr3:    ReadWrite<u64>),
        (0x0158 => pub cr0:    ReadWrite<u64>),
        (0x0160 => pub dr7:    ReadWrite<u64>),
        (0x0168 => pub dr6:    ReadWrite<u64>),
        (0x0170 => pub rflags: ReadWrite<u64>),
        (0x0178 => pub rip:    ReadWrite<u64>),
        (0x0180 => _reserved_0180),

        (0x01D8 => pub rsp:          ReadWrite<u64>),
        (0x01E0 => _reserved_01E0),
        (0x01F8 => pub rax:          ReadWrite<u64>),
        (0x0200 => _reserved_0200),

        (0x0C00 => @END),
    }
];

register_structs![
    pub VmcbStruct {
        (0x0000 => pub control: VmcbControlArea),
        (0x0400 => pub state:   VmcbStateSaveArea),
        (0x1000 => @END),
    }
];

impl VmcbStruct {
    /// An all-zero control block.
    pub fn zeroed() -> Self {
        // SAFETY: every field is an integer register proxy; all-zero is valid.
        unsafe { core::mem::zeroed() }
    }

    /// Resumes the guest after the intercepted instruction.
    pub fn advance_rip(&mut self) {
        self.state.rip.set(self.control.next_rip.get());
    }

    /// Queues a hardware exception without an error code for the next
    /// VMRUN. RIP is left on the faulting instruction.
    pub fn inject_exception(&mut self, vector: u8) {
        self.control.event_inj.write(
            EventInj::VECTOR.val(vector as u32) + EventInj::TYPE::Exception + EventInj::VALID::SET,
        );
    }

    pub fn set_tlb_control(&mut self, flush_all: bool) {
        self.control.tlb_control.write(if flush_all {
            VmcbTlbControl::CONTROL::FlushAllOnVmrun
        } else {
            VmcbTlbControl::CONTROL::DoNothing
        });
    }

    /// Installs a new nested page-table root and forces the next VMRUN to
    /// reload it and flush guest translations.
    pub fn set_nested_cr3(&mut self, ncr3: u64) {
        self.control.nested_cr3.set(ncr3);
        self.control.clean_bits.modify(VmcbCleanBits::NP::CLEAR);
        self.set_tlb_control(true);
    }

    pub fn set_nested_paging(&mut self, enable: bool) {
        self.control.nested_ctl.modify(if enable {
            NestedCtl::NP_ENABLE::SET
        } else {
            NestedCtl::NP_ENABLE::CLEAR
        });
        self.control.clean_bits.modify(VmcbCleanBits::NP::CLEAR);
    }

    pub fn nested_paging_enabled(&self) -> bool {
        self.control.nested_ctl.is_set(NestedCtl::NP_ENABLE)
    }
}
