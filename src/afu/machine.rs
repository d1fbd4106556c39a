//! Command-generating machine.
//!
//! One machine is one synthetic test thread: it holds a host-programmed
//! configuration (what command to send, where, how often) and at most one
//! in-flight command at a time. Between commands it counts down a random
//! inter-command delay; the pool controller decides which machine actually
//! issues each cycle.
//!
//! # Raw configuration layout
//!
//! The host programs a machine through four 64-bit MMIO words:
//!
//! ```text
//! word 0  [1:0]   enable mode (0 = disabled, 1 = once, 2 = always)
//!         [15:8]  command opcode (wire encoding)
//!         [19:16] transfer size class (size = 1 << class bytes)
//!         [23:20] abort mode
//!         [47:32] minimum inter-command delay (cycles)
//!         [63:48] maximum inter-command delay (cycles)
//! word 1  address window base
//! word 2  address window size in bytes
//! word 3  reserved
//! ```
//!
//! Word 0 is the trigger: the host writes words 1..3 first and the control
//! word last.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use super::command::{Command, CommandKind, CommandState};
use crate::tlx::{AfuCmdOp, CommandRecord};

// Word 0 field positions.
const ENABLE_MASK: u64 = 0x3;
const OPCODE_SHIFT: u64 = 8;
const OPCODE_MASK: u64 = 0xFF;
const SIZE_CLASS_SHIFT: u64 = 16;
const SIZE_CLASS_MASK: u64 = 0xF;
const ABORT_SHIFT: u64 = 20;
const ABORT_MASK: u64 = 0xF;
const MIN_DELAY_SHIFT: u64 = 32;
const MAX_DELAY_SHIFT: u64 = 48;
const DELAY_MASK: u64 = 0xFFFF;

/// Largest transfer size class (4 KiB).
const MAX_SIZE_CLASS: u64 = 12;

/// Host-visible enable mode of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableMode {
    Disabled,
    /// Issue exactly one command, then self-disable.
    EnabledOnce,
    /// Issue commands indefinitely.
    EnabledAlways,
}

/// Machine configuration errors. These are host programming mistakes, not
/// runtime conditions: the controller answers the offending MMIO write with
/// a failed completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineConfigError {
    #[error("unknown enable mode {0}")]
    BadEnableMode(u64),
    #[error("opcode 0x{0:02X} is not a machine-generatable command")]
    UnknownOpcode(u8),
    #[error("size class {0} out of range")]
    BadSizeClass(u64),
    #[error("delay range {min}..{max} is inverted")]
    BadDelayRange { min: u16, max: u16 },
    #[error("window size {window:#X} is not a multiple of transfer size {size}")]
    WindowNotMultiple { window: u64, size: u32 },
}

/// One synthetic command generator.
pub struct Machine {
    slot: usize,
    context: u16,
    enable: EnableMode,
    op: AfuCmdOp,
    kind: CommandKind,
    /// Transfer size in bytes.
    size: u32,
    abort: u8,
    base: u64,
    window: u64,
    min_delay: u16,
    max_delay: u16,
    /// Cycles left before the next issue.
    delay: u32,
    /// The most recent command; stays around after completion so a resend
    /// request can re-emit it.
    command: Option<Command>,
    issue_count: u64,
    rng: StdRng,
}

impl Machine {
    /// Create a disabled machine for the given slot.
    pub fn new(slot: usize, context: u16, seed: u64) -> Self {
        Self {
            slot,
            context,
            enable: EnableMode::Disabled,
            op: AfuCmdOp::Load,
            kind: CommandKind::Load,
            size: 64,
            abort: 0,
            base: 0,
            window: 0,
            min_delay: 0,
            max_delay: 0,
            delay: 0,
            command: None,
            issue_count: 0,
            rng: StdRng::seed_from_u64(seed ^ ((context as u64) << 32) ^ slot as u64),
        }
    }

    /// Apply a raw four-word configuration.
    pub fn configure(&mut self, raw: &[u64; 4]) -> Result<(), MachineConfigError> {
        let word0 = raw[0];

        let enable = match word0 & ENABLE_MASK {
            0 => EnableMode::Disabled,
            1 => EnableMode::EnabledOnce,
            2 => EnableMode::EnabledAlways,
            other => return Err(MachineConfigError::BadEnableMode(other)),
        };
        if enable == EnableMode::Disabled {
            // Disabling needs no further validation; runtime state survives
            // so an in-flight command can still complete.
            self.enable = EnableMode::Disabled;
            self.delay = 0;
            return Ok(());
        }

        let raw_op = ((word0 >> OPCODE_SHIFT) & OPCODE_MASK) as u8;
        let op = match raw_op {
            0x10 => AfuCmdOp::Load,
            0x20 => AfuCmdOp::Store,
            0x58 => AfuCmdOp::Interrupt,
            other => return Err(MachineConfigError::UnknownOpcode(other)),
        };
        let kind = CommandKind::from_op(op);

        let size_class = (word0 >> SIZE_CLASS_SHIFT) & SIZE_CLASS_MASK;
        if size_class > MAX_SIZE_CLASS {
            return Err(MachineConfigError::BadSizeClass(size_class));
        }
        let size = if kind == CommandKind::Other {
            0
        } else {
            1u32 << size_class
        };

        let min_delay = ((word0 >> MIN_DELAY_SHIFT) & DELAY_MASK) as u16;
        let max_delay = ((word0 >> MAX_DELAY_SHIFT) & DELAY_MASK) as u16;
        if max_delay < min_delay {
            return Err(MachineConfigError::BadDelayRange {
                min: min_delay,
                max: max_delay,
            });
        }

        let window = raw[2];
        if kind != CommandKind::Other {
            // The offset draw only produces size-aligned addresses when the
            // window divides evenly; a host that configures otherwise made
            // a configuration error.
            if window == 0 || window % size as u64 != 0 {
                return Err(MachineConfigError::WindowNotMultiple { window, size });
            }
        }

        self.enable = enable;
        self.op = op;
        self.kind = kind;
        self.size = size;
        self.abort = ((word0 >> ABORT_SHIFT) & ABORT_MASK) as u8;
        self.base = raw[1];
        self.window = window;
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self.delay = self.draw_delay();

        log::debug!(
            "machine {}/{} configured: {:?} {:?} size={} window=[{:#X}+{:#X}] delay={}..{}",
            self.context, self.slot, self.enable, self.op, self.size,
            self.base, self.window, self.min_delay, self.max_delay
        );
        Ok(())
    }

    fn draw_delay(&mut self) -> u32 {
        self.rng.gen_range(self.min_delay..=self.max_delay) as u32
    }

    /// Tick the inter-command delay. Runs exactly once per device cycle for
    /// every machine, whether or not anything was issued.
    pub fn advance_one_cycle(&mut self) {
        if self.enable == EnableMode::Disabled {
            self.delay = 0;
        } else if self.delay > 0 && !self.in_flight() {
            self.delay -= 1;
        }
    }

    /// True when a command is out and its terminal response has not been
    /// processed yet.
    #[inline]
    pub fn in_flight(&self) -> bool {
        self.command.as_ref().map_or(false, |c| !c.is_completed())
    }

    /// True when nothing remains outstanding: either no command was ever
    /// issued or the last one completed.
    #[inline]
    pub fn is_completed(&self) -> bool {
        !self.in_flight()
    }

    /// True when the machine would issue if handed a tag right now.
    pub fn ready_to_issue(&self) -> bool {
        self.enable != EnableMode::Disabled && !self.in_flight() && self.delay == 0
    }

    /// Issue a new command carrying `tag`. Returns false when the machine
    /// is disabled, still counting down, or has a command in flight.
    pub fn try_issue(&mut self, tag: u8, now: u64) -> bool {
        if !self.ready_to_issue() {
            return false;
        }

        let address = self.draw_address();
        let data = match self.kind {
            CommandKind::Store => Some((0..self.size).map(|_| self.rng.gen()).collect()),
            _ => None,
        };

        self.command = Some(Command {
            kind: self.kind,
            op: self.op,
            tag,
            address,
            size: self.size,
            state: CommandState::Created,
            issued_at: now,
            data,
        });
        self.issue_count += 1;
        self.delay = self.draw_delay();

        if self.enable == EnableMode::EnabledOnce {
            self.enable = EnableMode::Disabled;
        }

        log::debug!(
            "machine {}/{} issued {:?} tag={} addr={:#X} size={}",
            self.context, self.slot, self.op, tag, address, self.size
        );
        true
    }

    /// Pick a random offset inside the window, aligned to the transfer
    /// size. Tag-only commands target the window base directly.
    fn draw_address(&mut self) -> u64 {
        if self.kind == CommandKind::Other || self.window == 0 {
            return self.base;
        }
        let slots = self.window / self.size as u64;
        let slot = self.rng.gen_range(0..slots);
        self.base + slot * self.size as u64
    }

    /// Hand out the wire record for the in-flight command and mark it sent.
    ///
    /// # Panics
    ///
    /// Panics if no command is in flight.
    pub fn take_record(&mut self) -> CommandRecord {
        let cmd = self
            .command
            .as_mut()
            .expect("take_record with no command in flight");
        cmd.state = CommandState::Sent;
        cmd.record()
    }

    /// Re-emit the last command's payload unchanged, for a
    /// protocol-mandated retry.
    ///
    /// # Panics
    ///
    /// Panics if no command was ever issued.
    pub fn resend(&mut self) -> CommandRecord {
        match &self.command {
            Some(cmd) => {
                log::debug!(
                    "machine {}/{} resending {:?} tag={}",
                    self.context, self.slot, cmd.op, cmd.tag
                );
                cmd.record()
            }
            None => panic!(
                "resend on machine {}/{} with no prior command",
                self.context, self.slot
            ),
        }
    }

    /// Record that the in-flight command's terminal response was processed.
    ///
    /// # Panics
    ///
    /// Panics if nothing is in flight.
    pub fn complete(&mut self) {
        match self.command.as_mut() {
            Some(cmd) if cmd.state == CommandState::Sent => {
                cmd.state = CommandState::Completed;
            }
            _ => panic!(
                "completion on machine {}/{} with no command in flight",
                self.context, self.slot
            ),
        }
    }

    /// Tag of the in-flight command, if any.
    pub fn in_flight_tag(&self) -> Option<u8> {
        self.command.as_ref().filter(|c| !c.is_completed()).map(|c| c.tag)
    }

    /// The most recent command (completed or not).
    pub fn last_command(&self) -> Option<&Command> {
        self.command.as_ref()
    }

    #[inline]
    pub fn enable_mode(&self) -> EnableMode {
        self.enable
    }

    #[inline]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    #[inline]
    pub fn issue_count(&self) -> u64 {
        self.issue_count
    }

    #[inline]
    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Force the machine off without touching in-flight state.
    pub fn disable(&mut self) {
        self.enable = EnableMode::Disabled;
        self.delay = 0;
    }

    /// Drop all runtime state back to the post-construction default.
    pub fn reset(&mut self) {
        self.enable = EnableMode::Disabled;
        self.command = None;
        self.delay = 0;
        self.issue_count = 0;
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("slot", &self.slot)
            .field("context", &self.context)
            .field("enable", &self.enable)
            .field("op", &self.op)
            .field("delay", &self.delay)
            .field("in_flight", &self.in_flight())
            .field("issue_count", &self.issue_count)
            .finish()
    }
}
