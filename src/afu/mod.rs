//! The simulated accelerator function unit.
//!
//! Layered bottom-up: the [`broker`] hands out correlation tags and channel
//! credits, [`machine`]s generate individual commands, a [`pool`] arbitrates
//! 64 machines per context, and the [`controller`] ties it all to a
//! transport and runs the per-cycle dispatch loop. The [`descriptor`] and
//! [`memory`] are the two host-addressable spaces.

pub mod broker;
pub mod command;
pub mod controller;
pub mod descriptor;
pub mod machine;
pub mod memory;
pub mod pool;

pub use broker::{CreditChannel, TagBroker, DEFAULT_SEND_CREDITS, TAG_COUNT};
pub use command::{Command, CommandKind, CommandState};
pub use controller::{AfuController, AfuState, AfuStats};
pub use descriptor::{Descriptor, DescriptorError, MMIO_BASE, MMIO_SIZE};
pub use machine::{EnableMode, Machine, MachineConfigError};
pub use memory::SparseMemory;
pub use pool::{MachinePool, MACHINES_PER_POOL};
