//! A four-level page-table walker shared by host, guest and second-level
//! translation.

mod ept;

use core::ptr::NonNull;

use page_table_entry::x86_64::X64PTE;
use page_table_entry::GenericPTE;

pub use ept::{EptEntry, EptFlags};

const ENTRY_COUNT: usize = 512;

/// Bits of an entry holding the next-level frame.
pub(crate) const FRAME_MASK: usize = 0x000f_ffff_ffff_f000;

/// The accessors the walker needs from one page-table entry format.
///
/// Implementors must be `#[repr(transparent)]` over a `u64` so a table
/// frame can be read as `[Self; 512]`.
pub trait EntryShape: Copy {
    fn is_present(&self) -> bool;
    /// The large-page bit; only meaningful at PDPT and PD level.
    fn is_large(&self) -> bool;
    /// Physical base of the next table or of the mapped frame.
    fn frame_base(&self) -> usize;
}

impl EntryShape for X64PTE {
    fn is_present(&self) -> bool {
        GenericPTE::is_present(self)
    }

    fn is_large(&self) -> bool {
        GenericPTE::is_huge(self)
    }

    fn frame_base(&self) -> usize {
        GenericPTE::paddr(self).as_usize() & FRAME_MASK
    }
}

/// Levels of a 48-bit, four-level walk, top to bottom.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl PageLevel {
    pub const WALK: [PageLevel; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    const fn shift(self) -> usize {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Index of `addr` in a table of this level.
    pub const fn index_of(self, addr: usize) -> usize {
        (addr >> self.shift()) & (ENTRY_COUNT - 1)
    }

    /// Size of the page a terminal entry at this level maps.
    const fn leaf_size(self) -> Option<PageSize> {
        match self {
            Self::Pml4 => None,
            Self::Pdpt => Some(PageSize::Size1G),
            Self::Pd => Some(PageSize::Size2M),
            Self::Pt => Some(PageSize::Size4K),
        }
    }
}

#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSize {
    Size4K = 0x1000,
    Size2M = 0x20_0000,
    Size1G = 0x4000_0000,
}

impl PageSize {
    pub const fn offset_of(self, addr: usize) -> usize {
        addr & (self as usize - 1)
    }
}

/// Result of a successful walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// The output address, including the offset within the page.
    pub addr: usize,
    pub size: PageSize,
}

/// Walks the four-level table rooted at `root` for `addr`.
///
/// `table_of` maps the physical frame of a table and returns a pointer to
/// its first entry; how a table address is turned into something readable
/// is up to the caller (a host mapping window, or a second-level
/// translation followed by a window). Returns `None` if any level is not
/// present or a table cannot be mapped.
pub fn walk<E: EntryShape>(
    root: usize,
    addr: usize,
    mut table_of: impl FnMut(usize) -> Option<NonNull<u8>>,
) -> Option<Translation> {
    let mut table = root & FRAME_MASK;
    for level in PageLevel::WALK {
        let base = table_of(table)?;
        // SAFETY: `table_of` returned a mapping of a whole table frame and
        // the index is below `ENTRY_COUNT`.
        let entry = unsafe {
            base.cast::<E>()
                .as_ptr()
                .add(level.index_of(addr))
                .read_volatile()
        };
        if !entry.is_present() {
            trace!("walk {:#x}: {:?} entry not present", addr, level);
            return None;
        }
        // Bit 7 is reserved in a PML4 entry and is PAT in a PT entry.
        let terminal = match level {
            PageLevel::Pml4 if entry.is_large() => return None,
            PageLevel::Pml4 => false,
            PageLevel::Pdpt | PageLevel::Pd => entry.is_large(),
            PageLevel::Pt => true,
        };
        if terminal {
            let size = level.leaf_size()?;
            let frame = entry.frame_base() & !(size as usize - 1);
            return Some(Translation {
                addr: frame | size.offset_of(addr),
                size,
            });
        }
        table = entry.frame_base();
    }
    None
}
