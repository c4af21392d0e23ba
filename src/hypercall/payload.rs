//! The fixed-size command block exchanged with the guest.
//!
//! All fields are little-endian `u64`s at fixed offsets; which ones are
//! meaningful depends on the opcode.

/// Size of the command block in guest memory.
pub const PAYLOAD_SIZE: usize = 32;

/// A staged copy of the guest's command block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandPayload([u8; PAYLOAD_SIZE]);

/// Memory copy request: `buffer` lives in the caller's address space,
/// `target` in the address space named by the opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyRequest {
    pub buffer: u64,
    pub target: u64,
    pub length: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslateRequest {
    pub va: u64,
    pub pa: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageRequest {
    pub slot: u64,
    pub value: u64,
    pub write: bool,
}

impl CommandPayload {
    pub const fn from_bytes(bytes: [u8; PAYLOAD_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PAYLOAD_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAYLOAD_SIZE] {
        &mut self.0
    }

    fn u64_at(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    fn set_u64_at(&mut self, offset: usize, value: u64) {
        self.0[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// A single value reply or argument: roots, second-level base, control
    /// block address.
    pub fn value(&self) -> u64 {
        self.u64_at(0)
    }

    pub fn with_value(value: u64) -> Self {
        let mut p = Self::default();
        p.set_u64_at(0, value);
        p
    }

    pub fn copy_request(&self) -> CopyRequest {
        CopyRequest {
            buffer: self.u64_at(0),
            target: self.u64_at(8),
            length: self.u64_at(16),
        }
    }

    pub fn translate_request(&self) -> TranslateRequest {
        TranslateRequest {
            va: self.u64_at(0),
            pa: self.u64_at(8),
        }
    }

    pub fn set_translated(&mut self, pa: u64) {
        self.set_u64_at(8, pa);
    }

    pub fn storage_request(&self) -> StorageRequest {
        StorageRequest {
            slot: self.u64_at(0),
            value: self.u64_at(8),
            write: self.0[16] != 0,
        }
    }

    pub fn set_storage_value(&mut self, value: u64) {
        self.set_u64_at(8, value);
    }
}

impl From<CopyRequest> for CommandPayload {
    fn from(req: CopyRequest) -> Self {
        let mut p = Self::default();
        p.set_u64_at(0, req.buffer);
        p.set_u64_at(8, req.target);
        p.set_u64_at(16, req.length);
        p
    }
}

impl From<TranslateRequest> for CommandPayload {
    fn from(req: TranslateRequest) -> Self {
        let mut p = Self::default();
        p.set_u64_at(0, req.va);
        p.set_u64_at(8, req.pa);
        p
    }
}

impl From<StorageRequest> for CommandPayload {
    fn from(req: StorageRequest) -> Self {
        let mut p = Self::default();
        p.set_u64_at(0, req.slot);
        p.set_u64_at(8, req.value);
        p.0[16] = req.write as u8;
        p
    }
}
