//! The vendor-specific operations the dispatcher needs, bound once at
//! startup by whichever backend runs.

use core::ptr::NonNull;

use axerrno::{ax_err, AxResult};
use spin::Once;

use crate::addr::{SlatFormat, SlatRoot};
use crate::error::{HvError, HvResult};

/// Opaque pointer to backend state for the current exit, handed back to
/// every callback unchanged. It remembers the second-level format of the
/// backend that built it, so callbacks of the other backend never see it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArchData(Option<(NonNull<()>, SlatFormat)>);

impl ArchData {
    pub const NONE: Self = Self(None);

    pub fn new<T>(data: &mut T, owner: SlatFormat) -> Self {
        Self(Some((NonNull::from(data).cast(), owner)))
    }

    pub fn owner(&self) -> Option<SlatFormat> {
        self.0.map(|(_, owner)| owner)
    }

    /// Returns the state if it was built by a backend of format `owner`.
    ///
    /// # Safety
    ///
    /// The pointer must have been created by [`ArchData::new`] from a `T`
    /// that is still alive and not otherwise borrowed, and `T` must be the
    /// only state type built with `owner`.
    pub unsafe fn as_mut<'a, T>(self, owner: SlatFormat) -> Option<&'a mut T> {
        match self.0 {
            Some((p, tag)) if tag == owner => Some(unsafe { p.cast::<T>().as_mut() }),
            _ => None,
        }
    }
}

type Getter = fn(ArchData) -> u64;
type Setter = fn(ArchData, u64);
type Action = fn(ArchData);
type CpuSetter = fn(ArchData, u32, bool);
type CpuGetter = fn(ArchData, u32) -> bool;

/// Function slots filled in by a backend. An empty slot means the backend
/// does not support the operation.
#[derive(Clone, Copy, Debug)]
pub struct ArchCallbacks {
    pub slat_format: SlatFormat,
    pub guest_root: Option<Getter>,
    pub host_root: Option<Getter>,
    pub slat_base: Option<Getter>,
    pub set_slat_base: Option<Setter>,
    pub enable_slat: Option<Action>,
    pub disable_slat: Option<Action>,
    pub control_block_pa: Option<Getter>,
    pub flush_slat_tlb: Option<Action>,
    pub set_init_bit: Option<CpuSetter>,
    pub init_bit: Option<CpuGetter>,
}

impl ArchCallbacks {
    pub const fn empty(slat_format: SlatFormat) -> Self {
        Self {
            slat_format,
            guest_root: None,
            host_root: None,
            slat_base: None,
            set_slat_base: None,
            enable_slat: None,
            disable_slat: None,
            control_block_pa: None,
            flush_slat_tlb: None,
            set_init_bit: None,
            init_bit: None,
        }
    }

    /// Returns the callback in `slot` if it is provided and `arch` belongs
    /// to this table's backend.
    fn require<F>(&self, slot: Option<F>, name: &str, arch: ArchData) -> HvResult<F> {
        if arch.owner().is_some_and(|owner| owner != self.slat_format) {
            debug!(
                "[vmexit] {:?} exit state offered to {:?} capability {}",
                arch.owner(),
                self.slat_format,
                name
            );
            return Err(HvError::InvalidGuestParam);
        }
        slot.ok_or_else(|| {
            debug!("[vmexit] capability {} not provided", name);
            HvError::InvalidGuestParam
        })
    }

    pub fn guest_root(&self, arch: ArchData) -> HvResult<u64> {
        Ok(self.require(self.guest_root, "guest_root", arch)?(arch))
    }

    pub fn host_root(&self, arch: ArchData) -> HvResult<u64> {
        Ok(self.require(self.host_root, "host_root", arch)?(arch))
    }

    pub fn slat_base(&self, arch: ArchData) -> HvResult<u64> {
        Ok(self.require(self.slat_base, "slat_base", arch)?(arch))
    }

    /// The installed second-level root, tagged with this backend's format.
    pub fn slat_root(&self, arch: ArchData) -> HvResult<SlatRoot> {
        Ok(SlatRoot::new(self.slat_format, self.slat_base(arch)?))
    }

    pub fn set_slat_base(&self, arch: ArchData, value: u64) -> HvResult {
        self.require(self.set_slat_base, "set_slat_base", arch)?(arch, value);
        Ok(())
    }

    pub fn enable_slat(&self, arch: ArchData) -> HvResult {
        self.require(self.enable_slat, "enable_slat", arch)?(arch);
        Ok(())
    }

    pub fn disable_slat(&self, arch: ArchData) -> HvResult {
        self.require(self.disable_slat, "disable_slat", arch)?(arch);
        Ok(())
    }

    pub fn control_block_pa(&self, arch: ArchData) -> HvResult<u64> {
        Ok(self.require(self.control_block_pa, "control_block_pa", arch)?(arch))
    }

    pub fn flush_slat_tlb(&self, arch: ArchData) -> HvResult {
        self.require(self.flush_slat_tlb, "flush_slat_tlb", arch)?(arch);
        Ok(())
    }

    pub fn set_init_bit(&self, arch: ArchData, cpu: u32, value: bool) -> HvResult {
        self.require(self.set_init_bit, "set_init_bit", arch)?(arch, cpu, value);
        Ok(())
    }

    pub fn init_bit(&self, arch: ArchData, cpu: u32) -> HvResult<bool> {
        Ok(self.require(self.init_bit, "init_bit", arch)?(arch, cpu))
    }
}

/// Holds the [`ArchCallbacks`] of the running backend.
pub struct CapabilityTable(Once<ArchCallbacks>);

impl CapabilityTable {
    pub const fn new() -> Self {
        Self(Once::new())
    }

    /// Binds `callbacks`. Only the first registration takes effect.
    pub fn register(&self, callbacks: ArchCallbacks) -> AxResult {
        let mut bound = false;
        self.0.call_once(|| {
            bound = true;
            callbacks
        });
        if bound {
            info!("[vmexit] {:?} capability table bound", callbacks.slat_format);
            Ok(())
        } else {
            debug!("[vmexit] capability table already bound");
            ax_err!(AlreadyExists)
        }
    }

    pub fn get(&self) -> Option<&ArchCallbacks> {
        self.0.get()
    }

    /// Like [`get`](Self::get), for dispatcher paths that report a missing
    /// table to the guest.
    pub fn bound(&self) -> HvResult<&ArchCallbacks> {
        self.get().ok_or_else(|| {
            debug!("[vmexit] no capability table bound");
            HvError::InvalidGuestParam
        })
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}
