//! One-shot initialization primitives.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

use crate::hal::MAX_CPUS;

/// Runs a closure exactly once across all processors. Callers that arrive
/// while the closure is running wait until it finishes.
pub struct OneShot(Once<()>);

impl OneShot {
    pub const fn new() -> Self {
        Self(Once::new())
    }

    /// Returns `true` if this call ran `f`.
    pub fn run(&self, f: impl FnOnce()) -> bool {
        let mut ran = false;
        self.0.call_once(|| {
            f();
            ran = true;
        });
        ran
    }

    pub fn is_done(&self) -> bool {
        self.0.is_completed()
    }
}

impl Default for OneShot {
    fn default() -> Self {
        Self::new()
    }
}

/// One flag per processor, each claimed at most once.
pub struct PerCpuFlags([AtomicBool; MAX_CPUS]);

impl PerCpuFlags {
    pub const fn new() -> Self {
        Self([const { AtomicBool::new(false) }; MAX_CPUS])
    }

    fn flag(&self, cpu: u32) -> Option<&AtomicBool> {
        self.0.get(cpu as usize)
    }

    /// Sets the flag for `cpu`. Returns `Some(true)` for the one caller that
    /// flipped it, `Some(false)` if it was already set, and `None` if `cpu`
    /// is out of range.
    pub fn claim(&self, cpu: u32) -> Option<bool> {
        self.flag(cpu).map(|f| {
            f.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    pub fn is_set(&self, cpu: u32) -> bool {
        self.flag(cpu).is_some_and(|f| f.load(Ordering::Acquire))
    }
}

impl Default for PerCpuFlags {
    fn default() -> Self {
        Self::new()
    }
}
