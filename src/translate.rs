//! Host, guest and second-level address translation, and copies between
//! address spaces through the per-processor mapping windows.

use core::ptr::NonNull;

use page_table_entry::x86_64::X64PTE;

use crate::addr::{
    AddressSpaceContext, GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr, SlatFormat,
    SlatRoot,
};
use crate::error::{HvError, HvResult};
use crate::hal::{HostMemory, MapKind, MapWindow};
use crate::paging::{walk, EptEntry, Translation};

const PAGE_SIZE: usize = memory_addr::PAGE_SIZE_4K;

/// One side of a copy.
#[derive(Clone, Copy, Debug)]
enum Side {
    GuestVirt(AddressSpaceContext, usize),
    GuestPhys(usize),
    /// Memory already addressable by the caller.
    Local(*mut u8),
}

impl Side {
    /// Only called with `n` inside the span accepted by [`Side::check_span`].
    fn advance(self, n: usize) -> Self {
        match self {
            Self::GuestVirt(ctx, va) => Self::GuestVirt(ctx, va + n),
            Self::GuestPhys(pa) => Self::GuestPhys(pa + n),
            Self::Local(p) => Self::Local(p.wrapping_add(n)),
        }
    }

    /// Rejects a span of `len` bytes whose last byte lies past the top of
    /// the address space.
    fn check_span(self, len: usize, kind: MapKind) -> HvResult {
        let (start, err) = match self {
            Self::GuestVirt(_, va) => (va, HvError::InvalidGuestVirtual),
            Self::GuestPhys(pa) => (pa, HvError::InvalidGuestPhysical),
            Self::Local(_) => return Ok(()),
        };
        match len.checked_sub(1).map(|last| start.checked_add(last)) {
            Some(None) => {
                debug!("[vmexit] {:?} span {:#x}+{:#x} wraps", kind, start, len);
                Err(err)
            }
            _ => Ok(()),
        }
    }

    fn room_in_page(self) -> usize {
        let addr = match self {
            Self::GuestVirt(_, va) => va,
            Self::GuestPhys(pa) => pa,
            Self::Local(_) => return usize::MAX,
        };
        PAGE_SIZE - (addr & (PAGE_SIZE - 1))
    }
}

/// Translates and copies on behalf of one processor, against the
/// second-level root installed at the time it was built.
pub struct Translator<'a, M: HostMemory + ?Sized> {
    mem: &'a M,
    cpu: u32,
    slat: SlatRoot,
}

impl<'a, M: HostMemory + ?Sized> Translator<'a, M> {
    pub fn new(mem: &'a M, cpu: u32, slat: SlatRoot) -> Self {
        Self { mem, cpu, slat }
    }

    pub fn slat(&self) -> SlatRoot {
        self.slat
    }

    /// Maps the frame containing `paddr` through this processor's `kind`
    /// window and returns a pointer to `paddr` itself.
    fn map_host_phys(&self, paddr: usize, kind: MapKind) -> Option<NonNull<u8>> {
        let window = MapWindow::new(self.cpu, kind)?;
        let frame = HostPhysAddr::from_usize(paddr & !(PAGE_SIZE - 1));
        let base = self.mem.map_window(window, frame)?;
        // SAFETY: the offset is inside the mapped frame.
        Some(unsafe { base.add(paddr & (PAGE_SIZE - 1)) })
    }

    /// Walks the host's own tables.
    pub fn host_virt_to_host_phys(
        &self,
        host_root: AddressSpaceContext,
        vaddr: HostVirtAddr,
    ) -> Option<HostPhysAddr> {
        walk::<X64PTE>(host_root.root(), vaddr.as_usize(), |table| {
            self.map_host_phys(table, MapKind::Source)
        })
        .map(|t| HostPhysAddr::from_usize(t.addr))
    }

    fn slat_walk(&self, gpa: usize, kind: MapKind) -> Option<Translation> {
        let table_of = |table| self.map_host_phys(table, kind);
        match self.slat.format {
            SlatFormat::Ept => walk::<EptEntry>(self.slat.root(), gpa, table_of),
            SlatFormat::Npt => walk::<X64PTE>(self.slat.root(), gpa, table_of),
        }
    }

    /// Translates through the installed second-level tables.
    pub fn guest_phys_to_host_phys(&self, gpa: GuestPhysAddr, kind: MapKind) -> Option<HostPhysAddr> {
        self.slat_walk(gpa.as_usize(), kind)
            .map(|t| HostPhysAddr::from_usize(t.addr))
    }

    /// Walks the guest tables under `root`. Every table is itself located
    /// through the second-level tables before it is read.
    pub fn guest_virt_to_guest_phys(
        &self,
        root: AddressSpaceContext,
        gva: GuestVirtAddr,
        kind: MapKind,
    ) -> Option<GuestPhysAddr> {
        walk::<X64PTE>(root.root(), gva.as_usize(), |table| {
            let hpa = self.slat_walk(table, kind)?;
            self.map_host_phys(hpa.addr, kind)
        })
        .map(|t| GuestPhysAddr::from_usize(t.addr))
    }

    /// Maps the page holding `gpa` and returns a pointer to `gpa`.
    pub fn map_guest_phys(&self, gpa: GuestPhysAddr, kind: MapKind) -> Option<NonNull<u8>> {
        let hpa = self.guest_phys_to_host_phys(gpa, kind)?;
        self.map_host_phys(hpa.as_usize(), kind)
    }

    /// Maps the page holding `gva` in `root` and returns a pointer to `gva`.
    pub fn map_guest_virt(
        &self,
        root: AddressSpaceContext,
        gva: GuestVirtAddr,
        kind: MapKind,
    ) -> Option<NonNull<u8>> {
        let gpa = self.guest_virt_to_guest_phys(root, gva, kind)?;
        self.map_guest_phys(gpa, kind)
    }

    fn map_side(&self, side: Side, kind: MapKind) -> HvResult<*mut u8> {
        match side {
            Side::GuestVirt(root, va) => self
                .map_guest_virt(root, GuestVirtAddr::from_usize(va), kind)
                .map(NonNull::as_ptr)
                .ok_or_else(|| {
                    debug!(
                        "[vmexit] cpu {}: {:?} {:#x} not mapped in {:?}",
                        self.cpu, kind, va, root
                    );
                    HvError::InvalidGuestVirtual
                }),
            Side::GuestPhys(pa) => self
                .map_guest_phys(GuestPhysAddr::from_usize(pa), kind)
                .map(NonNull::as_ptr)
                .ok_or_else(|| {
                    debug!("[vmexit] cpu {}: {:?} GPA {:#x} not backed", self.cpu, kind, pa);
                    HvError::InvalidGuestPhysical
                }),
            Side::Local(p) => Ok(p),
        }
    }

    /// Copies `len` bytes one chunk at a time, never letting a chunk cross
    /// a page boundary on either side. The source is mapped through the
    /// source window and the destination through the destination window,
    /// so both stay valid for the duration of a chunk.
    ///
    /// # Safety
    ///
    /// A [`Side::Local`] pointer must be valid for `len` bytes.
    unsafe fn copy(&self, mut src: Side, mut dst: Side, len: usize) -> HvResult {
        src.check_span(len, MapKind::Source)?;
        dst.check_span(len, MapKind::Destination)?;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(src.room_in_page()).min(dst.room_in_page());
            let from = self.map_side(src, MapKind::Source)?;
            let to = self.map_side(dst, MapKind::Destination)?;
            // SAFETY: both pointers cover `chunk` bytes of one mapped page
            // or of a caller-provided buffer.
            unsafe { core::ptr::copy(from, to, chunk) };
            remaining -= chunk;
            if remaining == 0 {
                break;
            }
            src = src.advance(chunk);
            dst = dst.advance(chunk);
        }
        Ok(())
    }

    /// Copies between two guest-virtual ranges, possibly in different
    /// address spaces.
    pub fn copy_guest_virt(
        &self,
        src_root: AddressSpaceContext,
        src: GuestVirtAddr,
        dst_root: AddressSpaceContext,
        dst: GuestVirtAddr,
        len: usize,
    ) -> HvResult {
        unsafe {
            self.copy(
                Side::GuestVirt(src_root, src.as_usize()),
                Side::GuestVirt(dst_root, dst.as_usize()),
                len,
            )
        }
    }

    pub fn copy_guest_phys_to_guest_virt(
        &self,
        src: GuestPhysAddr,
        dst_root: AddressSpaceContext,
        dst: GuestVirtAddr,
        len: usize,
    ) -> HvResult {
        unsafe {
            self.copy(
                Side::GuestPhys(src.as_usize()),
                Side::GuestVirt(dst_root, dst.as_usize()),
                len,
            )
        }
    }

    pub fn copy_guest_virt_to_guest_phys(
        &self,
        src_root: AddressSpaceContext,
        src: GuestVirtAddr,
        dst: GuestPhysAddr,
        len: usize,
    ) -> HvResult {
        unsafe {
            self.copy(
                Side::GuestVirt(src_root, src.as_usize()),
                Side::GuestPhys(dst.as_usize()),
                len,
            )
        }
    }

    pub fn read_guest_virt(
        &self,
        root: AddressSpaceContext,
        gva: GuestVirtAddr,
        buf: &mut [u8],
    ) -> HvResult {
        unsafe {
            self.copy(
                Side::GuestVirt(root, gva.as_usize()),
                Side::Local(buf.as_mut_ptr()),
                buf.len(),
            )
        }
    }

    pub fn write_guest_virt(
        &self,
        root: AddressSpaceContext,
        gva: GuestVirtAddr,
        data: &[u8],
    ) -> HvResult {
        unsafe {
            self.copy(
                Side::Local(data.as_ptr().cast_mut()),
                Side::GuestVirt(root, gva.as_usize()),
                data.len(),
            )
        }
    }

    pub fn read_guest_phys(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> HvResult {
        unsafe {
            self.copy(
                Side::GuestPhys(gpa.as_usize()),
                Side::Local(buf.as_mut_ptr()),
                buf.len(),
            )
        }
    }

    pub fn write_guest_phys(&self, gpa: GuestPhysAddr, data: &[u8]) -> HvResult {
        unsafe {
            self.copy(
                Side::Local(data.as_ptr().cast_mut()),
                Side::GuestPhys(gpa.as_usize()),
                data.len(),
            )
        }
    }
}
