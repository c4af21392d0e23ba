use memory_addr::{def_usize_addr, def_usize_addr_formatter};

def_usize_addr! {
    /// Host physical address.
    pub type HostPhysAddr;
    /// Host virtual address.
    pub type HostVirtAddr;
    /// Guest physical address.
    pub type GuestPhysAddr;
    /// Guest virtual address.
    pub type GuestVirtAddr;
}

def_usize_addr_formatter! {
    HostPhysAddr = "HPA:{}";
    HostVirtAddr = "HVA:{}";
    GuestPhysAddr = "GPA:{}";
    GuestVirtAddr = "GVA:{}";
}

/// Bits of a root register value (CR3, EPTP, nCR3) that hold the table
/// frame. The low 12 bits carry PCID or EPTP flags.
pub const ROOT_FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Which address space a page-table root describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    /// The hypervisor's own tables, translating host virtual to host physical.
    Host,
    /// A guest's tables, translating guest virtual to guest physical.
    Guest,
    /// Second-level tables, translating guest physical to host physical.
    SecondLevel,
}

/// A page-table root tagged with the space it translates. Built fresh for
/// each translation and never cached across exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpaceContext {
    pub space: AddressSpace,
    root: u64,
}

impl AddressSpaceContext {
    pub const fn new(space: AddressSpace, raw_root: u64) -> Self {
        Self {
            space,
            root: raw_root & ROOT_FRAME_MASK,
        }
    }

    pub const fn host(raw_root: u64) -> Self {
        Self::new(AddressSpace::Host, raw_root)
    }

    pub const fn guest(raw_root: u64) -> Self {
        Self::new(AddressSpace::Guest, raw_root)
    }

    /// Page-aligned physical base of the top-level table.
    pub const fn root(&self) -> usize {
        self.root as usize
    }
}

/// Entry layout of the second-level tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlatFormat {
    /// Intel extended page tables.
    Ept,
    /// AMD nested page tables, same layout as ordinary long-mode tables.
    Npt,
}

/// Root of the second-level translation currently installed for a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlatRoot {
    pub format: SlatFormat,
    pub ctx: AddressSpaceContext,
}

impl SlatRoot {
    pub const fn new(format: SlatFormat, raw_root: u64) -> Self {
        Self {
            format,
            ctx: AddressSpaceContext::new(AddressSpace::SecondLevel, raw_root),
        }
    }

    pub const fn root(&self) -> usize {
        self.ctx.root()
    }
}
