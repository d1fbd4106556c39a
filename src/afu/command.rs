//! Synthetic commands generated by the machines.
//!
//! A [`Command`] is the machine-side view of one in-flight operation: the
//! decoded variant, the wire fields, and where it is in its
//! created → sent → completed lifecycle. The wire-facing twin is
//! [`CommandRecord`], built on demand when the command goes out.
//!
//! [`CommandRecord`]: crate::tlx::CommandRecord

use crate::tlx::{AfuCmdOp, CommandRecord};

/// Closed set of command variants a machine can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Reads host memory; completion needs a data pull.
    Load,
    /// Writes host memory; payload rides with the command.
    Store,
    /// Tag-only traffic (interrupts); no data either way.
    Other,
}

impl CommandKind {
    /// Derive the variant from the wire opcode.
    pub fn from_op(op: AfuCmdOp) -> Self {
        match op {
            AfuCmdOp::Load => CommandKind::Load,
            AfuCmdOp::Store => CommandKind::Store,
            AfuCmdOp::AssignActag | AfuCmdOp::Interrupt => CommandKind::Other,
        }
    }
}

/// Lifecycle of a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Built but not yet on the wire.
    Created,
    /// On the wire, waiting for its terminal response.
    Sent,
    /// Terminal response fully processed.
    Completed,
}

/// One synthetic command, owned by the machine that issued it.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub op: AfuCmdOp,
    /// Correlation tag, held until the terminal response is processed.
    pub tag: u8,
    pub address: u64,
    /// Transfer size in bytes.
    pub size: u32,
    pub state: CommandState,
    /// Cycle the command was issued on.
    pub issued_at: u64,
    /// Store payload, generated at issue time.
    pub data: Option<Vec<u8>>,
}

impl Command {
    /// Build the wire record for this command. Called once at issue and
    /// again verbatim on a protocol-mandated resend.
    pub fn record(&self) -> CommandRecord {
        CommandRecord {
            op: self.op,
            tag: self.tag,
            address: self.address,
            size: self.size,
            parity: command_parity(self.op, self.tag, self.address),
            data: self.data.clone(),
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state == CommandState::Completed
    }
}

/// Odd parity over the command header fields (opcode, tag, address).
pub fn command_parity(op: AfuCmdOp, tag: u8, address: u64) -> bool {
    let ones = (op as u64).count_ones() + (tag as u64).count_ones() + address.count_ones();
    ones % 2 == 0
}
