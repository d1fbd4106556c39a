//! Machine pool controller.
//!
//! One pool per context, owning exactly 64 machine slots. Once per device
//! cycle the pool decides which single slot, if any, issues: a rotating
//! last-served pointer gives priority round-robin fairness, and the broker
//! is consulted for the tag and channel credits before anything is
//! committed. Nothing here fails; lack of progress is a `None`.

use super::broker::{CreditChannel, TagBroker};
use super::command::CommandKind;
use super::machine::{EnableMode, Machine, MachineConfigError};
use crate::tlx::CommandRecord;

/// Machine slots per context.
pub const MACHINES_PER_POOL: usize = 64;

/// The 64-slot pool for one context.
pub struct MachinePool {
    context: u16,
    machines: Vec<Machine>,
    /// Slot index served most recently; the next scan starts just after it.
    last_served: usize,
}

impl MachinePool {
    pub fn new(context: u16, seed: u64) -> Self {
        let machines = (0..MACHINES_PER_POOL)
            .map(|slot| Machine::new(slot, context, seed))
            .collect();
        Self {
            context,
            machines,
            last_served: MACHINES_PER_POOL - 1,
        }
    }

    #[inline]
    pub fn context(&self) -> u16 {
        self.context
    }

    /// Apply a raw configuration to one slot.
    pub fn configure_machine(
        &mut self,
        slot: usize,
        raw: &[u64; 4],
    ) -> Result<(), MachineConfigError> {
        self.machines[slot].configure(raw)
    }

    #[inline]
    pub fn machine(&self, slot: usize) -> &Machine {
        &self.machines[slot]
    }

    /// Pick and serve at most one slot this cycle.
    ///
    /// Takes the command-channel credit and a tag up front; scans forward
    /// (wrapping) from just after the last-served slot; the first ready
    /// machine whose issue succeeds is served and becomes the new
    /// last-served pointer. On no taker everything taken is handed straight
    /// back so nothing leaks.
    pub fn send_command(&mut self, broker: &mut TagBroker, now: u64) -> Option<CommandRecord> {
        if !broker.try_take(CreditChannel::Command) {
            return None;
        }
        let Some(tag) = broker.allocate_tag() else {
            broker.give_back(CreditChannel::Command);
            return None;
        };

        for step in 1..=MACHINES_PER_POOL {
            let slot = (self.last_served + step) % MACHINES_PER_POOL;
            let machine = &mut self.machines[slot];
            if !machine.ready_to_issue() {
                continue;
            }
            // Store payload rides on the data channel; a store slot cannot
            // be served while that channel is dry.
            let wants_data = machine.kind() == CommandKind::Store;
            if wants_data && !broker.try_take(CreditChannel::CommandData) {
                continue;
            }

            let issued = machine.try_issue(tag, now);
            debug_assert!(issued, "ready machine refused to issue");
            self.last_served = slot;
            log::trace!("context {} served slot {} tag {}", self.context, slot, tag);
            return Some(machine.take_record());
        }

        broker.release_tag(tag);
        broker.give_back(CreditChannel::Command);
        None
    }

    /// Slot index of the machine whose in-flight command carries `tag`.
    pub fn slot_with_tag(&self, tag: u8) -> Option<usize> {
        self.machines
            .iter()
            .position(|m| m.in_flight_tag() == Some(tag))
    }

    /// Re-invoke one slot's resend path. Used only after a retry-requested
    /// response for that slot's command; the caller holds the credits.
    pub fn resend_command(&mut self, slot: usize) -> CommandRecord {
        self.machines[slot].resend()
    }

    /// Find the machine whose in-flight command carries `tag`.
    pub fn machine_with_tag(&mut self, tag: u8) -> Option<&mut Machine> {
        self.machines
            .iter_mut()
            .find(|m| m.in_flight_tag() == Some(tag))
    }

    /// Tick every machine's delay counter. Runs exactly once per device
    /// cycle regardless of whether a command was sent.
    pub fn advance_cycle(&mut self) {
        for machine in &mut self.machines {
            machine.advance_one_cycle();
        }
    }

    /// Force every slot off; in-flight commands still drain normally.
    pub fn disable_all(&mut self) {
        for machine in &mut self.machines {
            machine.disable();
        }
    }

    /// True when every slot reports completed.
    pub fn all_completed(&self) -> bool {
        self.machines.iter().all(|m| m.is_completed())
    }

    /// True when no slot is enabled any more.
    pub fn all_disabled(&self) -> bool {
        self.machines
            .iter()
            .all(|m| m.enable_mode() == EnableMode::Disabled)
    }

    /// True when any slot ever issued a command.
    pub fn any_issued(&self) -> bool {
        self.machines.iter().any(|m| m.issue_count() > 0)
    }

    /// Total commands issued across all slots.
    pub fn total_issued(&self) -> u64 {
        self.machines.iter().map(|m| m.issue_count()).sum()
    }

    /// Drop every machine back to its unconfigured state.
    pub fn reset(&mut self) {
        for machine in &mut self.machines {
            machine.reset();
        }
        self.last_served = MACHINES_PER_POOL - 1;
    }

    #[cfg(test)]
    pub(crate) fn set_last_served(&mut self, slot: usize) {
        self.last_served = slot;
    }

    #[cfg(test)]
    pub(crate) fn last_served(&self) -> usize {
        self.last_served
    }
}

impl std::fmt::Debug for MachinePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachinePool")
            .field("context", &self.context)
            .field("last_served", &self.last_served)
            .field("total_issued", &self.total_issued())
            .field("all_completed", &self.all_completed())
            .finish()
    }
}
