//! Guest hypercall decoding and dispatch.

mod payload;

use numeric_enum_macro::numeric_enum;

pub use payload::{CommandPayload, CopyRequest, StorageRequest, TranslateRequest, PAYLOAD_SIZE};

use crate::addr::{AddressSpaceContext, GuestPhysAddr, GuestVirtAddr};
use crate::caps::{ArchCallbacks, ArchData};
use crate::error::{status_of, HvResult};
use crate::hal::{HostMemory, MapKind};
use crate::regs::GeneralRegisters;
use crate::storage::slot;
use crate::translate::Translator;
use crate::RootState;

numeric_enum! {
    #[repr(u64)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum HypercallOp {
        ReadVirt = 0x100B,
        WriteVirt = 0x100C,
        ReadPhys = 0x100D,
        WritePhys = 0x100E,
        DisableSlat = 0x100F,
        SetAuthKey = 0x1010,
        GetGuestRoot = 0x1011,
        GetSlatBase = 0x1012,
        VirtToPhys = 0x1013,
        StorageQuery = 0x1014,
        SetSlatBase = 0x1015,
        GetHostRoot = 0x1016,
        EnableSlat = 0x1017,
        GetControlBlock = 0x1018,
    }
}

impl HypercallOp {
    pub const ALL: [HypercallOp; 14] = [
        Self::ReadVirt,
        Self::WriteVirt,
        Self::ReadPhys,
        Self::WritePhys,
        Self::DisableSlat,
        Self::SetAuthKey,
        Self::GetGuestRoot,
        Self::GetSlatBase,
        Self::VirtToPhys,
        Self::StorageQuery,
        Self::SetSlatBase,
        Self::GetHostRoot,
        Self::EnableSlat,
        Self::GetControlBlock,
    ];

    /// Opcodes whose arguments live in the command block.
    pub const fn reads_payload(self) -> bool {
        matches!(
            self,
            Self::ReadVirt
                | Self::WriteVirt
                | Self::ReadPhys
                | Self::WritePhys
                | Self::VirtToPhys
                | Self::StorageQuery
                | Self::SetSlatBase
        )
    }
}

/// The register-passed part of a hypercall.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HypercallArgs {
    /// `RCX`
    pub opcode: u64,
    /// `RDX`: guest-virtual address of the [`CommandPayload`].
    pub payload_gva: u64,
    /// `R8`: target root for cross-space operations, or the new key.
    pub aux: u64,
    /// `R9`
    pub auth_token: u64,
}

impl HypercallArgs {
    pub fn from_regs(regs: &GeneralRegisters) -> Self {
        Self {
            opcode: regs.rcx,
            payload_gva: regs.rdx,
            aux: regs.r8,
            auth_token: regs.r9,
        }
    }
}

/// Everything the dispatcher knows about one hypercall exit. Built by the
/// backend on the exit path and dropped when the exit returns.
#[derive(Debug)]
pub struct ExitContext {
    /// Raw root register of the calling guest context.
    pub guest_root: u64,
    pub guest_rip: u64,
    /// Status of the last dispatch.
    pub result: u64,
    pub args: HypercallArgs,
    /// Local APIC id of the processor handling the exit.
    pub cpu: u32,
    pub arch: ArchData,
    pub arch2: ArchData,
    staged: Option<CommandPayload>,
}

impl ExitContext {
    pub fn new(args: HypercallArgs, guest_root: u64, guest_rip: u64, cpu: u32) -> Self {
        Self {
            guest_root,
            guest_rip,
            result: 0,
            args,
            cpu,
            arch: ArchData::NONE,
            arch2: ArchData::NONE,
            staged: None,
        }
    }

    pub fn with_arch(mut self, arch: ArchData, arch2: ArchData) -> Self {
        self.arch = arch;
        self.arch2 = arch2;
        self
    }

    fn caller(&self) -> AddressSpaceContext {
        AddressSpaceContext::guest(self.guest_root)
    }

    /// The staged command block; zeroed if the guest passed none.
    pub fn payload(&self) -> CommandPayload {
        self.staged.unwrap_or_default()
    }
}

/// Services authenticated hypercalls against the shared root state.
pub struct Dispatcher<'a, M: HostMemory + ?Sized> {
    root: &'a RootState,
    mem: &'a M,
}

impl<'a, M: HostMemory + ?Sized> Dispatcher<'a, M> {
    pub fn new(root: &'a RootState, mem: &'a M) -> Self {
        Self { root, mem }
    }

    /// Runs the hypercall in `ctx` and returns the status for `RAX`. The
    /// same value is left in `ctx.result`.
    pub fn dispatch(&self, ctx: &mut ExitContext) -> u64 {
        let result = self.try_dispatch(ctx);
        #[cfg(feature = "tracing")]
        trace!(
            "[vmexit] cpu {} hypercall {:#x} -> {:?}",
            ctx.cpu,
            ctx.args.opcode,
            result
        );
        ctx.result = status_of(&result);
        ctx.result
    }

    fn try_dispatch(&self, ctx: &mut ExitContext) -> HvResult {
        if !self.root.accepts(ctx.args.auth_token) {
            return hv_err!(InvalidGuestParam, "cpu {}: bad hypercall token", ctx.cpu);
        }
        let caps = self.root.caps.bound()?;
        let xlat = Translator::new(self.mem, ctx.cpu, caps.slat_root(ctx.arch)?);
        self.stage(&xlat, ctx)?;

        let op = HypercallOp::try_from(ctx.args.opcode).or_else(|raw| {
            hv_err!(InvalidGuestParam, "unknown hypercall {:#x}", raw)
        })?;
        if op.reads_payload() && ctx.args.payload_gva == 0 {
            return hv_err!(InvalidGuestParam, "{:?} without a command block", op);
        }
        let reply = self.handle(op, caps, &xlat, ctx)?;
        // Without a command block a value query only reports its status.
        if let Some(reply) = reply.filter(|_| ctx.args.payload_gva != 0) {
            xlat.write_guest_virt(
                ctx.caller(),
                GuestVirtAddr::from_usize(ctx.args.payload_gva as usize),
                reply.as_bytes(),
            )?;
        }
        Ok(())
    }

    /// Copies the command block in from the guest, at most once per exit.
    fn stage(&self, xlat: &Translator<'_, M>, ctx: &mut ExitContext) -> HvResult {
        if ctx.staged.is_some() || ctx.args.payload_gva == 0 {
            return Ok(());
        }
        let mut payload = CommandPayload::default();
        xlat.read_guest_virt(
            ctx.caller(),
            GuestVirtAddr::from_usize(ctx.args.payload_gva as usize),
            payload.as_bytes_mut(),
        )?;
        ctx.staged = Some(payload);
        Ok(())
    }

    /// Root of the address space a cross-space copy targets: `aux` if
    /// given, else the guest kernel root from storage.
    fn target_root(&self, ctx: &ExitContext) -> AddressSpaceContext {
        let raw = match ctx.args.aux {
            0 => self.root.storage.get_on(ctx.cpu, slot::KERNEL_ROOT),
            root => root,
        };
        AddressSpaceContext::guest(raw)
    }

    fn handle(
        &self,
        op: HypercallOp,
        caps: &ArchCallbacks,
        xlat: &Translator<'_, M>,
        ctx: &ExitContext,
    ) -> HvResult<Option<CommandPayload>> {
        let payload = ctx.payload();
        let reply = match op {
            HypercallOp::ReadVirt => {
                let req = payload.copy_request();
                if req.buffer == 0 {
                    return hv_err!(TranslateFailure);
                }
                xlat.copy_guest_virt(
                    self.target_root(ctx),
                    GuestVirtAddr::from_usize(req.target as usize),
                    ctx.caller(),
                    GuestVirtAddr::from_usize(req.buffer as usize),
                    req.length as usize,
                )?;
                None
            }
            HypercallOp::WriteVirt => {
                let req = payload.copy_request();
                if req.buffer == 0 {
                    return hv_err!(TranslateFailure);
                }
                xlat.copy_guest_virt(
                    ctx.caller(),
                    GuestVirtAddr::from_usize(req.buffer as usize),
                    self.target_root(ctx),
                    GuestVirtAddr::from_usize(req.target as usize),
                    req.length as usize,
                )?;
                None
            }
            HypercallOp::ReadPhys => {
                let req = payload.copy_request();
                if req.buffer == 0 {
                    return hv_err!(TranslateFailure);
                }
                xlat.copy_guest_phys_to_guest_virt(
                    GuestPhysAddr::from_usize(req.target as usize),
                    ctx.caller(),
                    GuestVirtAddr::from_usize(req.buffer as usize),
                    req.length as usize,
                )?;
                None
            }
            HypercallOp::WritePhys => {
                let req = payload.copy_request();
                if req.buffer == 0 {
                    return hv_err!(TranslateFailure);
                }
                xlat.copy_guest_virt_to_guest_phys(
                    ctx.caller(),
                    GuestVirtAddr::from_usize(req.buffer as usize),
                    GuestPhysAddr::from_usize(req.target as usize),
                    req.length as usize,
                )?;
                None
            }
            HypercallOp::VirtToPhys => {
                let req = payload.translate_request();
                if req.va == 0 {
                    return hv_err!(TranslateFailure);
                }
                let root = match ctx.args.aux {
                    0 => ctx.caller(),
                    raw => AddressSpaceContext::guest(raw),
                };
                let pa = xlat
                    .guest_virt_to_guest_phys(
                        root,
                        GuestVirtAddr::from_usize(req.va as usize),
                        MapKind::Source,
                    )
                    .map_or(0, |gpa| gpa.as_usize() as u64);
                let mut reply = payload;
                reply.set_translated(pa);
                Some(reply)
            }
            HypercallOp::GetGuestRoot => Some(CommandPayload::with_value(ctx.guest_root)),
            HypercallOp::GetHostRoot => Some(CommandPayload::with_value(caps.host_root(ctx.arch)?)),
            HypercallOp::GetSlatBase => Some(CommandPayload::with_value(caps.slat_base(ctx.arch)?)),
            HypercallOp::GetControlBlock => {
                Some(CommandPayload::with_value(caps.control_block_pa(ctx.arch)?))
            }
            HypercallOp::SetSlatBase => {
                let base = payload.value();
                if base == 0 {
                    return hv_err!(TranslateFailure);
                }
                caps.set_slat_base(ctx.arch, base)?;
                None
            }
            HypercallOp::EnableSlat => {
                caps.enable_slat(ctx.arch)?;
                None
            }
            HypercallOp::DisableSlat => {
                caps.disable_slat(ctx.arch)?;
                None
            }
            HypercallOp::StorageQuery => {
                let req = payload.storage_request();
                let index = match usize::try_from(req.slot) {
                    Ok(i) if i <= slot::MAX_SLOT => i,
                    _ => return hv_err!(InvalidGuestParam, "storage slot {} out of range", req.slot),
                };
                if req.write {
                    self.root.storage.set_on(ctx.cpu, index, req.value);
                    None
                } else {
                    let mut reply = payload;
                    reply.set_storage_value(self.root.storage.get_on(ctx.cpu, index));
                    Some(reply)
                }
            }
            HypercallOp::SetAuthKey => {
                if ctx.args.aux == 0 {
                    return hv_err!(InvalidGuestParam, "refusing to clear the hypercall key");
                }
                self.root.set_auth_key(ctx.args.aux);
                None
            }
        };
        Ok(reply)
    }
}
