//! Configuration-space and MMIO register backing store.
//!
//! The descriptor is the register file the host programs the AFU through.
//! It has two windows:
//!
//! - a small configuration space of 64-bit registers, reached through
//!   config-read/config-write commands (identity, enable/reset control,
//!   context count);
//! - an MMIO space reached through generic memory commands, holding one
//!   4 KiB block per context: 64 machine-config slots of four 64-bit words
//!   each, followed by the context control block (status address, control,
//!   status).
//!
//! The descriptor itself is dumb storage plus offset validation. Reacting
//! to what was written (enable bits, machine configs, test-complete marks)
//! is the controller's job.

use thiserror::Error;

/// Size of the configuration-register window in bytes.
pub const CONFIG_SPACE_SIZE: u64 = 0x100;

/// Base address of the MMIO window in the host-visible address map.
/// Generic memory commands below this line target the secondary memory.
pub const MMIO_BASE: u64 = 0x0800_0000;

/// Contexts the register map can describe.
pub const MAX_CONTEXTS: usize = 16;

/// Bytes of MMIO space per context.
pub const CONTEXT_STRIDE: u64 = 0x1000;

/// Total MMIO window size.
pub const MMIO_SIZE: u64 = MAX_CONTEXTS as u64 * CONTEXT_STRIDE;

/// Configuration-space register offsets.
pub mod reg {
    /// Device identity (read-only).
    pub const AFU_IDENT: u64 = 0x00;
    /// Global control: see the `control` bit constants.
    pub const AFU_CONTROL: u64 = 0x08;
    /// Number of contexts the host intends to drive.
    pub const CONTEXT_COUNT: u64 = 0x10;
    /// Coarse lifecycle code, written back by the controller.
    pub const AFU_STATUS: u64 = 0x18;
}

/// Bits of `reg::AFU_CONTROL`.
pub mod control {
    pub const ENABLE: u64 = 1 << 0;
    pub const RESET: u64 = 1 << 1;
}

/// Per-context MMIO block layout (offsets relative to the context base).
pub mod ctx {
    /// 64 machine-config slots, four 64-bit words each.
    pub const MACHINE_CONFIG_BASE: u64 = 0x000;
    pub const MACHINE_CONFIG_STRIDE: u64 = 0x20;
    pub const MACHINE_CONFIG_END: u64 = 0x800;
    /// Host address the completion status is stored to.
    pub const STATUS_ADDRESS: u64 = 0x800;
    /// Context control: see `GO`.
    pub const CONTEXT_CONTROL: u64 = 0x808;
    /// Context status: host writes `TEST_COMPLETE` here.
    pub const CONTEXT_STATUS: u64 = 0x810;

    /// Start the context (triggers the attach handshake).
    pub const GO: u64 = 1 << 0;
    /// Host declares the test run finished.
    pub const TEST_COMPLETE: u64 = 1 << 0;
}

/// Value of `reg::AFU_IDENT`: "TLXA" + map version.
pub const AFU_IDENT_VALUE: u64 = 0x544C_5841_0000_0001;

/// Descriptor access failures. The controller answers these with a protocol
/// "failed" completion; they never terminate the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("config register offset 0x{0:X} out of range")]
    RegisterOutOfRange(u64),
    #[error("config register offset 0x{0:X} not 8-byte aligned")]
    RegisterMisaligned(u64),
    #[error("mmio range 0x{offset:X}+{len} out of bounds")]
    MmioOutOfRange { offset: u64, len: usize },
}

/// The register file.
pub struct Descriptor {
    registers: Vec<u64>,
    mmio: Vec<u8>,
}

impl Descriptor {
    pub fn new() -> Self {
        let mut desc = Self {
            registers: vec![0u64; (CONFIG_SPACE_SIZE / 8) as usize],
            mmio: vec![0u8; MMIO_SIZE as usize],
        };
        desc.registers[(reg::AFU_IDENT / 8) as usize] = AFU_IDENT_VALUE;
        desc
    }

    fn check_register(offset: u64) -> Result<usize, DescriptorError> {
        if offset % 8 != 0 {
            return Err(DescriptorError::RegisterMisaligned(offset));
        }
        if offset >= CONFIG_SPACE_SIZE {
            return Err(DescriptorError::RegisterOutOfRange(offset));
        }
        Ok((offset / 8) as usize)
    }

    /// Read a configuration register.
    pub fn get_register(&self, offset: u64) -> Result<u64, DescriptorError> {
        Ok(self.registers[Self::check_register(offset)?])
    }

    /// Write a configuration register. The identity register is read-only
    /// and silently keeps its value.
    pub fn set_register(&mut self, offset: u64, value: u64) -> Result<(), DescriptorError> {
        let idx = Self::check_register(offset)?;
        if offset != reg::AFU_IDENT {
            self.registers[idx] = value;
        }
        Ok(())
    }

    fn check_mmio(&self, offset: u64, len: usize) -> Result<usize, DescriptorError> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= MMIO_SIZE => Ok(offset as usize),
            _ => Err(DescriptorError::MmioOutOfRange { offset, len }),
        }
    }

    /// Read from the MMIO window (offset relative to [`MMIO_BASE`]).
    pub fn get_mmio(&self, offset: u64, len: usize) -> Result<&[u8], DescriptorError> {
        let start = self.check_mmio(offset, len)?;
        Ok(&self.mmio[start..start + len])
    }

    /// Write into the MMIO window (offset relative to [`MMIO_BASE`]).
    pub fn set_mmio(&mut self, offset: u64, data: &[u8]) -> Result<(), DescriptorError> {
        let start = self.check_mmio(offset, data.len())?;
        self.mmio[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read a 64-bit MMIO word.
    pub fn mmio_u64(&self, offset: u64) -> Result<u64, DescriptorError> {
        let bytes = self.get_mmio(offset, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Fetch the four raw machine-config words for a context/slot pair.
    pub fn machine_config(&self, context: usize, slot: usize) -> Result<[u64; 4], DescriptorError> {
        let base = context as u64 * CONTEXT_STRIDE
            + ctx::MACHINE_CONFIG_BASE
            + slot as u64 * ctx::MACHINE_CONFIG_STRIDE;
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.mmio_u64(base + i as u64 * 8)?;
        }
        Ok(words)
    }

    /// Host address the completion status of `context` is flushed to.
    pub fn status_address(&self, context: usize) -> Result<u64, DescriptorError> {
        self.mmio_u64(context as u64 * CONTEXT_STRIDE + ctx::STATUS_ADDRESS)
    }

    /// Clear everything the host programmed; identity survives.
    pub fn reset(&mut self) {
        self.registers.fill(0);
        self.registers[(reg::AFU_IDENT / 8) as usize] = AFU_IDENT_VALUE;
        self.mmio.fill(0);
    }
}

/// Decode an MMIO offset into (context, offset-within-context), if it falls
/// inside a describable context block.
pub fn split_context_offset(offset: u64) -> Option<(usize, u64)> {
    if offset >= MMIO_SIZE {
        return None;
    }
    Some(((offset / CONTEXT_STRIDE) as usize, offset % CONTEXT_STRIDE))
}

/// Decode a within-context offset into a machine-config slot index, when it
/// lands in the machine-config region.
pub fn machine_slot(within: u64) -> Option<(usize, u64)> {
    if within >= ctx::MACHINE_CONFIG_END {
        return None;
    }
    Some((
        (within / ctx::MACHINE_CONFIG_STRIDE) as usize,
        within % ctx::MACHINE_CONFIG_STRIDE,
    ))
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::new()
    }
}
