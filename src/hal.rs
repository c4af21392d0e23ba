//! Services the crate needs from the hypervisor it is embedded in.

use core::ptr::NonNull;

use page_table_entry::x86_64::X64PTE;
use page_table_entry::{GenericPTE, MappingFlags};
use raw_cpuid::CpuIdResult;

use crate::addr::{HostPhysAddr, HostVirtAddr};

/// Maximum number of logical processors, indexed by local APIC id.
pub const MAX_CPUS: usize = 256;

const PAGE_SIZE: usize = memory_addr::PAGE_SIZE_4K;

/// Per-processor services, implemented once by the host with
/// [`crate_interface::impl_interface`].
#[crate_interface::def_interface]
pub trait HostIf {
    /// Local APIC id of the processor handling the current exit.
    fn current_apic_id() -> u32;

    /// Executes CPUID natively on the current processor.
    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult;
}

pub(crate) fn current_apic_id() -> u32 {
    crate_interface::call_interface!(HostIf::current_apic_id())
}

pub(crate) fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
    crate_interface::call_interface!(HostIf::cpuid(leaf, subleaf))
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Native CPUID, for hosts implementing [`HostIf::cpuid`].
        pub fn native_cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
            raw_cpuid::cpuid!(leaf, subleaf)
        }

        /// Initial local APIC id from CPUID leaf 1, for hosts implementing
        /// [`HostIf::current_apic_id`].
        pub fn native_apic_id() -> u32 {
            raw_cpuid::CpuId::new()
                .get_feature_info()
                .map_or(0, |info| info.initial_local_apic_id() as u32)
        }

        fn flush_tlb_entry(vaddr: HostVirtAddr) {
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.as_usize() as u64));
        }
    } else {
        fn flush_tlb_entry(_vaddr: HostVirtAddr) {}
    }
}

/// The two mapping windows each processor owns.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapKind {
    Source = 0,
    Destination = 1,
}

/// One of the per-processor mapping windows. A window is only ever
/// touched by the processor it belongs to, so no locking is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapWindow(usize);

impl MapWindow {
    /// Number of windows in the reserved table.
    pub const COUNT: usize = MAX_CPUS * 2;

    /// Returns `None` if `apic_id` is beyond the supported processor count.
    pub const fn new(apic_id: u32, kind: MapKind) -> Option<Self> {
        if apic_id as usize >= MAX_CPUS {
            None
        } else {
            Some(Self(apic_id as usize * 2 + kind as usize))
        }
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// Access to arbitrary host-physical memory through mapping windows.
pub trait HostMemory {
    /// Points `window` at the 4 KiB frame containing `frame` and returns a
    /// pointer to the first byte of that frame, or `None` if the frame is
    /// not backed by memory. The pointer stays valid until `window` is
    /// remapped.
    fn map_window(&self, window: MapWindow, frame: HostPhysAddr) -> Option<NonNull<u8>>;
}

impl<M: HostMemory + ?Sized> HostMemory for &M {
    fn map_window(&self, window: MapWindow, frame: HostPhysAddr) -> Option<NonNull<u8>> {
        (**self).map_window(window, frame)
    }
}

/// Mapping windows backed by one reserved page table: window `i` is entry
/// `i` of the table and covers `base + i * 4K`.
pub struct ReservedWindows {
    table: NonNull<X64PTE>,
    base: HostVirtAddr,
    flush: fn(HostVirtAddr),
}

// Each window entry is written only by the processor that owns it.
unsafe impl Send for ReservedWindows {}
unsafe impl Sync for ReservedWindows {}

impl ReservedWindows {
    /// # Safety
    ///
    /// `table` must point to [`MapWindow::COUNT`] writable entries that are
    /// referenced by the host's active tables so that entry `i` maps
    /// `base + i * 4K`.
    pub unsafe fn new(table: NonNull<X64PTE>, base: HostVirtAddr) -> Self {
        Self {
            table,
            base,
            flush: flush_tlb_entry,
        }
    }

    #[cfg(test)]
    pub(crate) unsafe fn with_flush(
        table: NonNull<X64PTE>,
        base: HostVirtAddr,
        flush: fn(HostVirtAddr),
    ) -> Self {
        Self { table, base, flush }
    }

    pub fn window_vaddr(&self, window: MapWindow) -> HostVirtAddr {
        HostVirtAddr::from_usize(self.base.as_usize() + window.index() * PAGE_SIZE)
    }
}

impl HostMemory for ReservedWindows {
    fn map_window(&self, window: MapWindow, frame: HostPhysAddr) -> Option<NonNull<u8>> {
        let paddr = memory_addr::PhysAddr::from_usize(frame.as_usize() & !(PAGE_SIZE - 1));
        let entry = X64PTE::new_page(paddr, MappingFlags::READ | MappingFlags::WRITE, false);
        // SAFETY: `window.index()` is below `MapWindow::COUNT` by construction.
        unsafe { self.table.as_ptr().add(window.index()).write_volatile(entry) };
        let vaddr = self.window_vaddr(window);
        (self.flush)(vaddr);
        NonNull::new(vaddr.as_usize() as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_index() {
        assert_eq!(MapWindow::new(0, MapKind::Source).map(MapWindow::index), Some(0));
        assert_eq!(MapWindow::new(0, MapKind::Destination).map(MapWindow::index), Some(1));
        assert_eq!(MapWindow::new(7, MapKind::Destination).map(MapWindow::index), Some(15));
        assert_eq!(
            MapWindow::new(MAX_CPUS as u32 - 1, MapKind::Destination).map(MapWindow::index),
            Some(MapWindow::COUNT - 1)
        );
        assert!(MapWindow::new(MAX_CPUS as u32, MapKind::Source).is_none());
    }

    #[test]
    fn test_reserved_windows_rewrite_entry() {
        let mut table = alloc::vec![X64PTE::empty(); MapWindow::COUNT];
        let base = HostVirtAddr::from_usize(0xffff_8000_4000_0000);
        let windows = unsafe {
            ReservedWindows::with_flush(NonNull::new(table.as_mut_ptr()).unwrap(), base, |_| {})
        };

        let window = MapWindow::new(3, MapKind::Destination).unwrap();
        let ptr = windows
            .map_window(window, HostPhysAddr::from_usize(0x1234_5678))
            .unwrap();
        assert_eq!(ptr.as_ptr() as usize, 0xffff_8000_4000_0000 + 7 * PAGE_SIZE);

        let entry = table[7];
        assert!(entry.is_present());
        assert_eq!(entry.paddr().as_usize(), 0x1234_5000);
        assert!(!table[6].is_present());
    }
}
