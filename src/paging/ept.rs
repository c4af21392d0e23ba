// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt;

use bitflags::bitflags;

use super::{EntryShape, FRAME_MASK};

bitflags! {
    /// EPT entry flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        /// Read access.
        const READ =                1 << 0;
        /// Write access.
        const WRITE =               1 << 1;
        /// Execute access (supervisor execute with mode-based control).
        const EXECUTE =             1 << 2;
        /// Ignore PAT memory type.
        const IGNORE_PAT =          1 << 6;
        /// Maps a 1 GiB or 2 MiB page instead of a table.
        const HUGE_PAGE =           1 << 7;
        /// Set by hardware on access.
        const ACCESSED =            1 << 8;
        /// Set by hardware on write to a page.
        const DIRTY =               1 << 9;
        /// User-mode execute access with mode-based control.
        const EXECUTE_FOR_USER =    1 << 10;
    }
}

/// An Intel extended page-table entry. Any of the read, write or execute
/// bits makes it present.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    const ACCESS: EptFlags = EptFlags::READ
        .union(EptFlags::WRITE)
        .union(EptFlags::EXECUTE);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn new(paddr: usize, flags: EptFlags) -> Self {
        Self((paddr & FRAME_MASK) as u64 | flags.bits())
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> EptFlags {
        EptFlags::from_bits_truncate(self.0)
    }
}

impl EntryShape for EptEntry {
    fn is_present(&self) -> bool {
        self.flags().intersects(Self::ACCESS)
    }

    fn is_large(&self) -> bool {
        self.flags().contains(EptFlags::HUGE_PAGE)
    }

    fn frame_base(&self) -> usize {
        self.0 as usize & FRAME_MASK
    }
}

impl fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EptEntry")
            .field("raw", &self.0)
            .field("paddr", &self.frame_base())
            .field("flags", &self.flags())
            .finish()
    }
}
