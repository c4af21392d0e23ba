//! A small table of 64-bit slots, the first few shared by all processors
//! and the rest private to each processor.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::hal::{self, MAX_CPUS};
use crate::once::OneShot;

/// Well-known slot numbers.
pub mod slot {
    /// Guest callback entry point.
    pub const CALLBACK_ADDRESS: usize = 0;
    /// Handler invoked on second-level translation faults.
    pub const FAULT_HANDLER: usize = 1;
    /// First slot of the "custom second-level tables installed" bitmap, one
    /// bit per processor.
    pub const INIT_BITMAP: usize = 2;
    pub const INIT_BITMAP_END: usize = INIT_BITMAP + 8;
    /// Physical base of the guest-side driver image.
    pub const DRIVER_BASE_PA: usize = 11;
    /// Address-space root of the guest kernel.
    pub const KERNEL_ROOT: usize = 12;
    /// Identity of the guest process allowed to issue hypercalls.
    pub const CONTROLLER_IDENTITY: usize = 13;
    /// Base of the guest payload image.
    pub const PAYLOAD_BASE: usize = 14;
    /// Slots below this are shared by every processor.
    pub const SHARED_COUNT: usize = 16;
    pub const MAX_SLOT: usize = 127;
}

const SLOT_COUNT: usize = slot::MAX_SLOT + 1;
const PRIVATE_COUNT: usize = SLOT_COUNT - slot::SHARED_COUNT;

/// The private slots of one processor, on their own cache lines.
#[repr(align(64))]
struct CpuRow([AtomicU64; PRIVATE_COUNT]);

impl CpuRow {
    const fn new() -> Self {
        Self([const { AtomicU64::new(0) }; PRIVATE_COUNT])
    }
}

pub struct StorageTable {
    shared: [AtomicU64; slot::SHARED_COUNT],
    rows: [CpuRow; MAX_CPUS],
    global_init: OneShot,
}

impl StorageTable {
    pub const fn new() -> Self {
        Self {
            shared: [const { AtomicU64::new(0) }; slot::SHARED_COUNT],
            rows: [const { CpuRow::new() }; MAX_CPUS],
            global_init: OneShot::new(),
        }
    }

    fn cell(&self, cpu: u32, index: usize) -> Option<(&AtomicU64, bool)> {
        if index < slot::SHARED_COUNT {
            Some((&self.shared[index], true))
        } else {
            let row = self.rows.get(cpu as usize)?;
            row.0.get(index - slot::SHARED_COUNT).map(|c| (c, false))
        }
    }

    /// Reads `index` on the current processor; 0 if out of range.
    pub fn get(&self, index: usize) -> u64 {
        self.get_on(hal::current_apic_id(), index)
    }

    /// Writes `index` on the current processor; out of range is ignored.
    pub fn set(&self, index: usize, value: u64) {
        self.set_on(hal::current_apic_id(), index, value)
    }

    pub fn get_on(&self, cpu: u32, index: usize) -> u64 {
        match self.cell(cpu, index) {
            Some((c, true)) => c.load(Ordering::Acquire),
            Some((c, false)) => c.load(Ordering::Relaxed),
            None => 0,
        }
    }

    pub fn set_on(&self, cpu: u32, index: usize, value: u64) {
        match self.cell(cpu, index) {
            Some((c, true)) => {
                c.swap(value, Ordering::SeqCst);
            }
            Some((c, false)) => c.store(value, Ordering::Relaxed),
            None => trace!("storage: slot {} on cpu {} out of range", index, cpu),
        }
    }

    /// Zeroes the private slots of `cpu`.
    pub fn initialize(&self, cpu: u32) {
        if let Some(row) = self.rows.get(cpu as usize) {
            for c in row.0.iter() {
                c.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Zeroes the shared slots. Only the first call across the system has
    /// any effect; returns whether this call did it.
    pub fn initialize_global(&self) -> bool {
        self.global_init.run(|| {
            for c in self.shared.iter() {
                c.store(0, Ordering::SeqCst);
            }
        })
    }

    fn init_bit_location(cpu: u32) -> Option<(usize, u64)> {
        let word = slot::INIT_BITMAP + cpu as usize / 64;
        (word < slot::INIT_BITMAP_END).then(|| (word, 1u64 << (cpu % 64)))
    }

    /// Marks whether `cpu` runs on second-level tables installed through
    /// a hypercall.
    pub fn set_init_bit(&self, cpu: u32, value: bool) {
        if let Some((word, mask)) = Self::init_bit_location(cpu) {
            if value {
                self.shared[word].fetch_or(mask, Ordering::SeqCst);
            } else {
                self.shared[word].fetch_and(!mask, Ordering::SeqCst);
            }
        }
    }

    pub fn init_bit(&self, cpu: u32) -> bool {
        Self::init_bit_location(cpu)
            .is_some_and(|(word, mask)| self.shared[word].load(Ordering::Acquire) & mask != 0)
    }
}

impl Default for StorageTable {
    fn default() -> Self {
        Self::new()
    }
}
