//! Simulated host memory, page-table builders and the [`HostIf`]
//! implementation used by the unit tests.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;
use std::sync::Mutex;

use raw_cpuid::CpuIdResult;

use crate::addr::{AddressSpaceContext, HostPhysAddr, SlatFormat, SlatRoot};
use crate::hal::{HostIf, HostMemory, MapWindow};
use crate::paging::{PageLevel, PageSize, FRAME_MASK};
use crate::translate::Translator;

pub const PAGE: usize = 0x1000;

thread_local! {
    static CPU: Cell<u32> = const { Cell::new(0) };
}

/// Makes the calling test thread act as processor `id`.
pub fn set_cpu(id: u32) {
    CPU.with(|c| c.set(id));
}

/// Deterministic CPUID results. Leaf 1 and leaf 0x8000_0001 report every
/// feature bit set so that filtering is observable.
pub fn fake_cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
    match leaf {
        0x1 | 0x8000_0001 => CpuIdResult {
            eax: leaf,
            ebx: subleaf,
            ecx: u32::MAX,
            edx: u32::MAX,
        },
        _ => CpuIdResult {
            eax: leaf ^ 0xa5a5_0000,
            ebx: subleaf,
            ecx: !leaf,
            edx: leaf.rotate_left(7),
        },
    }
}

struct SimHost;

#[crate_interface::impl_interface]
impl HostIf for SimHost {
    fn current_apic_id() -> u32 {
        CPU.with(|c| c.get())
    }

    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        fake_cpuid(leaf, subleaf)
    }
}

#[repr(C, align(4096))]
struct Frame([u8; PAGE]);

fn new_frame() -> NonNull<Frame> {
    NonNull::new(Box::into_raw(Box::new(Frame([0; PAGE])))).unwrap()
}

/// One mapping window: a private page standing in for the frame it maps.
/// Remapping the window reloads that page, so a pointer taken before the
/// remap sees the new frame, as it would through a rewritten PTE.
struct Window {
    frame: usize,
    page: NonNull<Frame>,
    /// The page as last loaded; bytes that differ were written through
    /// the window.
    clean: Box<Frame>,
}

impl Window {
    fn bytes(&self) -> *mut u8 {
        self.page.as_ptr().cast()
    }

    fn load(&mut self, backing: *const u8) {
        unsafe { core::ptr::copy_nonoverlapping(backing, self.bytes(), PAGE) };
        unsafe { core::ptr::copy_nonoverlapping(self.bytes(), self.clean.0.as_mut_ptr(), PAGE) };
    }

    fn write_back(&self, backing: *mut u8) {
        for i in 0..PAGE {
            let b = unsafe { *self.bytes().add(i) };
            if b != self.clean.0[i] {
                unsafe { *backing.add(i) = b };
            }
        }
    }
}

/// Sparse host-physical memory: frames come into existence, zeroed, the
/// first time they are touched.
pub struct SimMemory {
    frames: Mutex<BTreeMap<usize, NonNull<Frame>>>,
    next: Mutex<usize>,
    windows: Mutex<BTreeMap<usize, Window>>,
}

unsafe impl Send for SimMemory {}
unsafe impl Sync for SimMemory {}

impl SimMemory {
    /// Physical addresses at or above this are not backed.
    pub const LIMIT: usize = 1 << 40;

    pub fn new() -> Self {
        Self {
            frames: Mutex::new(BTreeMap::new()),
            next: Mutex::new(0x10_0000),
            windows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Hands out a fresh physical range of `size` bytes aligned to `size`.
    pub fn alloc(&self, size: usize) -> usize {
        let mut next = self.next.lock().unwrap();
        let base = (*next + size - 1) & !(size - 1);
        *next = base + size;
        base
    }

    pub fn alloc_frame(&self) -> usize {
        self.alloc(PAGE)
    }

    fn frame_ptr(&self, paddr: usize) -> Option<*mut u8> {
        if paddr >= Self::LIMIT {
            return None;
        }
        let mut frames = self.frames.lock().unwrap();
        let frame = frames.entry(paddr & !(PAGE - 1)).or_insert_with(new_frame);
        Some(frame.as_ptr().cast())
    }

    /// Stores what was written through every window, then reloads every
    /// window from memory.
    fn sync_windows(&self, windows: &mut BTreeMap<usize, Window>) {
        for w in windows.values() {
            w.write_back(self.frame_ptr(w.frame).unwrap());
        }
        for w in windows.values_mut() {
            w.load(self.frame_ptr(w.frame).unwrap());
        }
    }

    /// Runs a direct access with the windows coherent before and after.
    fn direct<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut windows = self.windows.lock().unwrap();
        self.sync_windows(&mut windows);
        let r = f();
        self.sync_windows(&mut windows);
        r
    }

    pub fn write(&self, paddr: usize, data: &[u8]) {
        self.direct(|| {
            let mut done = 0;
            while done < data.len() {
                let pa = paddr + done;
                let chunk = (PAGE - pa % PAGE).min(data.len() - done);
                let frame = self.frame_ptr(pa).unwrap();
                unsafe {
                    core::ptr::copy_nonoverlapping(data[done..].as_ptr(), frame.add(pa % PAGE), chunk)
                };
                done += chunk;
            }
        })
    }

    pub fn read(&self, paddr: usize, len: usize) -> Vec<u8> {
        self.direct(|| {
            let mut out = vec![0u8; len];
            let mut done = 0;
            while done < len {
                let pa = paddr + done;
                let chunk = (PAGE - pa % PAGE).min(len - done);
                let frame = self.frame_ptr(pa).unwrap();
                unsafe {
                    core::ptr::copy_nonoverlapping(frame.add(pa % PAGE), out[done..].as_mut_ptr(), chunk)
                };
                done += chunk;
            }
            out
        })
    }

    pub fn write_u64(&self, paddr: usize, value: u64) {
        self.write(paddr, &value.to_le_bytes());
    }

    pub fn read_u64(&self, paddr: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.read(paddr, 8));
        u64::from_le_bytes(raw)
    }

    /// Indices of every window mapped so far.
    pub fn windows_used(&self) -> BTreeSet<usize> {
        self.windows.lock().unwrap().keys().copied().collect()
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        for (_, frame) in self.frames.lock().unwrap().iter() {
            drop(unsafe { Box::from_raw(frame.as_ptr()) });
        }
        for (_, w) in self.windows.lock().unwrap().iter() {
            drop(unsafe { Box::from_raw(w.page.as_ptr()) });
        }
    }
}

impl HostMemory for SimMemory {
    fn map_window(&self, window: MapWindow, frame: HostPhysAddr) -> Option<NonNull<u8>> {
        let backing = self.frame_ptr(frame.as_usize())?;
        let mut windows = self.windows.lock().unwrap();
        self.sync_windows(&mut windows);
        let w = windows.entry(window.index()).or_insert_with(|| Window {
            frame: 0,
            page: new_frame(),
            clean: Box::new(Frame([0; PAGE])),
        });
        w.frame = frame.as_usize() & !(PAGE - 1);
        w.load(backing);
        NonNull::new(w.bytes())
    }
}

/// Entry encodings of the two table formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    X64,
    Ept,
}

impl Flavor {
    fn table(self, paddr: usize) -> u64 {
        paddr as u64
            | match self {
                Self::X64 => 0b11,
                Self::Ept => 0b111,
            }
    }

    fn leaf(self, paddr: usize, size: PageSize) -> u64 {
        self.table(paddr) | if size == PageSize::Size4K { 0 } else { 1 << 7 }
    }
}

impl From<SlatFormat> for Flavor {
    fn from(f: SlatFormat) -> Self {
        match f {
            SlatFormat::Ept => Self::Ept,
            SlatFormat::Npt => Self::X64,
        }
    }
}

fn leaf_level(size: PageSize) -> PageLevel {
    match size {
        PageSize::Size1G => PageLevel::Pdpt,
        PageSize::Size2M => PageLevel::Pd,
        PageSize::Size4K => PageLevel::Pt,
    }
}

/// Which address space a table's own frames live in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Space {
    Host,
    Guest,
}

/// One guest with second-level tables, any number of guest address spaces
/// and host tables, all in one [`SimMemory`]. Every mapping is also
/// recorded so tests can compare against a straightforward reference
/// lookup.
pub struct SimGuest {
    pub mem: SimMemory,
    pub slat_format: SlatFormat,
    pub slat_root: usize,
    next_gpa: usize,
    slat_maps: Vec<(usize, usize, PageSize)>,
    guest_maps: Vec<(usize, usize, usize, PageSize)>,
}

impl SimGuest {
    /// Guest frames for tables and small buffers are handed out from here.
    const GPA_POOL: usize = 0x100_0000;

    pub fn new(slat_format: SlatFormat) -> Self {
        let mem = SimMemory::new();
        let slat_root = mem.alloc_frame();
        Self {
            mem,
            slat_format,
            slat_root,
            next_gpa: Self::GPA_POOL,
            slat_maps: Vec::new(),
            guest_maps: Vec::new(),
        }
    }

    /// The raw second-level root register value, with flag bits set in
    /// the low 12 bits as hardware would have them.
    pub fn slat_register(&self) -> u64 {
        match self.slat_format {
            SlatFormat::Ept => self.slat_root as u64 | 0x5e,
            SlatFormat::Npt => self.slat_root as u64,
        }
    }

    pub fn translator(&self, cpu: u32) -> Translator<'_, SimMemory> {
        Translator::new(&self.mem, cpu, SlatRoot::new(self.slat_format, self.slat_register()))
    }

    pub fn ref_gpa_to_hpa(&self, gpa: usize) -> Option<usize> {
        self.slat_maps
            .iter()
            .rev()
            .find(|(g, _, s)| gpa >= *g && gpa - *g < *s as usize)
            .map(|(g, h, _)| h + (gpa - g))
    }

    pub fn ref_gva_to_gpa(&self, root: usize, gva: usize) -> Option<usize> {
        self.guest_maps
            .iter()
            .rev()
            .find(|(r, v, _, s)| *r == root && gva >= *v && gva - *v < *s as usize)
            .map(|(_, v, p, _)| p + (gva - v))
    }

    pub fn ref_gva_to_hpa(&self, root: usize, gva: usize) -> Option<usize> {
        self.ref_gpa_to_hpa(self.ref_gva_to_gpa(root, gva)?)
    }

    /// Writes a four-level mapping of `va` to `pa` under `root`, creating
    /// intermediate tables as needed.
    pub fn write_mapping(
        &mut self,
        flavor: Flavor,
        space: Space,
        root: usize,
        va: usize,
        pa: usize,
        size: PageSize,
    ) {
        let leaf = leaf_level(size);
        let mut table = root;
        for level in PageLevel::WALK {
            let host_table = match space {
                Space::Host => table,
                Space::Guest => self.ref_gpa_to_hpa(table).expect("guest table not backed"),
            };
            let slot = host_table + level.index_of(va) * 8;
            if level == leaf {
                self.mem.write_u64(slot, flavor.leaf(pa, size));
                return;
            }
            let entry = self.mem.read_u64(slot);
            table = if entry & 0b111 != 0 {
                entry as usize & FRAME_MASK
            } else {
                let next = match space {
                    Space::Host => self.mem.alloc_frame(),
                    Space::Guest => self.alloc_guest_frame(),
                };
                self.mem.write_u64(slot, flavor.table(next));
                next
            };
        }
    }

    pub fn map_slat(&mut self, gpa: usize, hpa: usize, size: PageSize) {
        let (flavor, root) = (Flavor::from(self.slat_format), self.slat_root);
        self.write_mapping(flavor, Space::Host, root, gpa, hpa, size);
        self.slat_maps.push((gpa, hpa, size));
    }

    /// A fresh guest-physical frame backed by a fresh host frame.
    pub fn alloc_guest_frame(&mut self) -> usize {
        let gpa = self.next_gpa;
        self.next_gpa += PAGE;
        let hpa = self.mem.alloc_frame();
        self.map_slat(gpa, hpa, PageSize::Size4K);
        gpa
    }

    /// A new, empty guest address space; returns its root.
    pub fn new_root(&mut self) -> usize {
        self.alloc_guest_frame()
    }

    pub fn map_guest(&mut self, root: usize, gva: usize, gpa: usize, size: PageSize) {
        self.write_mapping(Flavor::X64, Space::Guest, root, gva, gpa, size);
        self.guest_maps.push((root, gva, gpa, size));
    }

    /// Backs `[gva, gva + len)` with fresh 4 KiB guest frames.
    pub fn map_fresh(&mut self, root: usize, gva: usize, len: usize) {
        let first = gva & !(PAGE - 1);
        let pages = (gva - first + len).div_ceil(PAGE);
        for i in 0..pages {
            let gpa = self.alloc_guest_frame();
            self.map_guest(root, first + i * PAGE, gpa, PageSize::Size4K);
        }
    }

    /// Splits `[gva, gva + len)` at 4 KiB boundaries and yields each piece
    /// with its host-physical address.
    fn host_chunks(&self, root: usize, gva: usize, len: usize) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::new();
        let mut done = 0;
        while done < len {
            let va = gva + done;
            let chunk = (PAGE - va % PAGE).min(len - done);
            let hpa = self.ref_gva_to_hpa(root, va).expect("unmapped");
            out.push((done, hpa, chunk));
            done += chunk;
        }
        out
    }

    pub fn write_virt(&self, root: usize, gva: usize, data: &[u8]) {
        for (off, hpa, chunk) in self.host_chunks(root, gva, data.len()) {
            self.mem.write(hpa, &data[off..off + chunk]);
        }
    }

    pub fn read_virt(&self, root: usize, gva: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for (_, hpa, chunk) in self.host_chunks(root, gva, len) {
            out.extend(self.mem.read(hpa, chunk));
        }
        out
    }

    pub fn ctx(root: usize) -> AddressSpaceContext {
        AddressSpaceContext::guest(root as u64)
    }
}
