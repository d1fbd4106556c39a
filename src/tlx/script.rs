//! Scripted in-process link partner.
//!
//! [`ScriptedHost`] plays the host side of the link without any real wire:
//! a queue of [`HostAction`]s feeds commands to the device one per cycle,
//! and every AFU command is answered automatically after a fixed latency.
//! Credits are returned the same way a real partner would, one flag per
//! channel per cycle. Used by the self-test binary and the integration
//! tests; anything byte-exact about a real link would live in a different
//! [`Transport`] implementation.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::events::{
    AfuCmdOp, CommandRecord, DataBeat, EventBatch, HostCmdOp, HostCommandRecord, HostRespOp,
    InitialCredits, OutboundResponse, ResponseRecord, ResultCode,
};
use super::transport::{Transport, TransportError};

/// Largest single-beat transfer; bigger writes go out as block commands.
const PARTIAL_MAX: usize = 64;

/// One scripted step. The host performs at most one action per cycle, in
/// script order, waiting for the device to accept each.
#[derive(Debug, Clone)]
pub enum HostAction {
    /// Announce the link credit capacity (once, at bring-up).
    AnnounceCredits { cmd: u32, data: u32 },
    /// Config-space register write.
    ConfigWrite { offset: u64, value: u64 },
    /// Config-space register read.
    ConfigRead { offset: u64 },
    /// 64-bit MMIO write (offset relative to the MMIO base).
    MmioWrite { offset: u64, value: u64 },
    /// Generic memory write; turns into a block command past 64 bytes.
    MemoryWrite { address: u64, data: Vec<u8> },
    /// Generic memory read.
    MemoryRead { address: u64, size: u32 },
    /// Do nothing for this many cycles.
    Idle(u64),
    /// Raise the external reset event.
    Reset,
}

/// Something scheduled for delivery at a future cycle.
#[derive(Debug, Clone)]
enum Delivery {
    Response(ResponseRecord),
    ResponseData(DataBeat),
    CommandData(DataBeat),
}

/// The scripted host model.
pub struct ScriptedHost {
    script: VecDeque<HostAction>,
    /// Cycles between seeing an AFU command and delivering its response.
    latency: u64,
    cycle: u64,
    deliveries: Vec<(u64, Delivery)>,
    /// Credits owed back, per channel (command, response, cmd-data,
    /// resp-data). Returned one per channel per cycle.
    credit_owed: [u32; 4],
    /// Host-side memory image, written by AFU stores.
    memory: BTreeMap<u64, u8>,
    /// Payloads of outstanding block writes, keyed by host tag.
    write_payloads: HashMap<u8, Vec<u8>>,
    /// Planned interrupt outcomes; drained front-first, default `Done`.
    interrupt_plan: VecDeque<ResultCode>,
    next_tag: u8,
    announced: bool,
    commands_seen: Vec<CommandRecord>,
    responses_seen: Vec<OutboundResponse>,
    config_responses_seen: Vec<OutboundResponse>,
}

impl ScriptedHost {
    pub fn new(latency: u64) -> Self {
        Self {
            script: VecDeque::new(),
            latency: latency.max(1),
            cycle: 0,
            deliveries: Vec::new(),
            credit_owed: [0; 4],
            memory: BTreeMap::new(),
            write_payloads: HashMap::new(),
            interrupt_plan: VecDeque::new(),
            next_tag: 0,
            announced: false,
            commands_seen: Vec::new(),
            responses_seen: Vec::new(),
            config_responses_seen: Vec::new(),
        }
    }

    /// Append one action to the script.
    pub fn push(&mut self, action: HostAction) {
        self.script.push_back(action);
    }

    /// Append a whole bring-up script in order.
    pub fn script(&mut self, actions: impl IntoIterator<Item = HostAction>) {
        self.script.extend(actions);
    }

    /// Plan the outcome codes of upcoming interrupt commands, front first.
    pub fn plan_interrupts(&mut self, codes: impl IntoIterator<Item = ResultCode>) {
        self.interrupt_plan.extend(codes);
    }

    /// True once every scripted action has been handed to the device.
    pub fn script_drained(&self) -> bool {
        self.script.is_empty()
    }

    /// Every AFU command observed so far.
    pub fn commands_seen(&self) -> &[CommandRecord] {
        &self.commands_seen
    }

    /// Every memory-command completion observed so far.
    pub fn responses_seen(&self) -> &[OutboundResponse] {
        &self.responses_seen
    }

    /// Every config-space completion observed so far.
    pub fn config_responses_seen(&self) -> &[OutboundResponse] {
        &self.config_responses_seen
    }

    /// Read back the host memory image (zero for untouched bytes).
    pub fn memory_bytes(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.memory.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    fn claim_tag(&mut self) -> u8 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    fn schedule(&mut self, delivery: Delivery) {
        self.deliveries.push((self.cycle + self.latency, delivery));
    }

    fn owe_credit(&mut self, channel: usize) {
        self.credit_owed[channel] += 1;
    }

    /// Move due deliveries into the batch, at most one per category.
    fn drain_due(&mut self, batch: &mut EventBatch) {
        let now = self.cycle;
        let mut i = 0;
        while i < self.deliveries.len() {
            if self.deliveries[i].0 > now {
                i += 1;
                continue;
            }
            let slot_free = match &self.deliveries[i].1 {
                Delivery::Response(_) => batch.response.is_none(),
                Delivery::ResponseData(_) => batch.response_data.is_none(),
                Delivery::CommandData(_) => batch.command_data.is_none(),
            };
            if !slot_free {
                i += 1;
                continue;
            }
            match self.deliveries.swap_remove(i).1 {
                Delivery::Response(r) => batch.response = Some(r),
                Delivery::ResponseData(b) => batch.response_data = Some(b),
                Delivery::CommandData(b) => batch.command_data = Some(b),
            }
        }
    }

    /// Turn the next scripted action into batch content, if its slot is
    /// free this cycle.
    fn run_script(&mut self, batch: &mut EventBatch) {
        let Some(action) = self.script.front().cloned() else {
            return;
        };
        match action {
            HostAction::AnnounceCredits { cmd, data } => {
                if !self.announced {
                    batch.initial_credits = Some(InitialCredits { cmd, data });
                    self.announced = true;
                }
            }
            HostAction::ConfigWrite { offset, value } => {
                if batch.config.is_some() {
                    return;
                }
                let tag = self.claim_tag();
                batch.config = Some(HostCommandRecord {
                    op: HostCmdOp::ConfigWrite,
                    tag,
                    address: offset,
                    size: 8,
                    data: Some(value.to_le_bytes().to_vec()),
                });
            }
            HostAction::ConfigRead { offset } => {
                if batch.config.is_some() {
                    return;
                }
                let tag = self.claim_tag();
                batch.config = Some(HostCommandRecord {
                    op: HostCmdOp::ConfigRead,
                    tag,
                    address: offset,
                    size: 8,
                    data: None,
                });
            }
            HostAction::MmioWrite { offset, value } => {
                if batch.command.is_some() {
                    return;
                }
                let tag = self.claim_tag();
                batch.command = Some(HostCommandRecord {
                    op: HostCmdOp::PartialWrite,
                    tag,
                    address: crate::afu::MMIO_BASE + offset,
                    size: 8,
                    data: Some(value.to_le_bytes().to_vec()),
                });
            }
            HostAction::MemoryWrite { address, data } => {
                if batch.command.is_some() {
                    return;
                }
                let tag = self.claim_tag();
                if data.len() <= PARTIAL_MAX {
                    batch.command = Some(HostCommandRecord {
                        op: HostCmdOp::PartialWrite,
                        tag,
                        address,
                        size: data.len() as u32,
                        data: Some(data),
                    });
                } else {
                    batch.command = Some(HostCommandRecord {
                        op: HostCmdOp::WriteBlock,
                        tag,
                        address,
                        size: data.len() as u32,
                        data: None,
                    });
                    self.write_payloads.insert(tag, data);
                }
            }
            HostAction::MemoryRead { address, size } => {
                if batch.command.is_some() {
                    return;
                }
                let tag = self.claim_tag();
                let op = if size as usize <= PARTIAL_MAX {
                    HostCmdOp::PartialRead
                } else {
                    HostCmdOp::ReadBlock
                };
                batch.command = Some(HostCommandRecord {
                    op,
                    tag,
                    address,
                    size,
                    data: None,
                });
            }
            HostAction::Idle(n) => {
                self.script.pop_front();
                if n > 1 {
                    self.script.push_front(HostAction::Idle(n - 1));
                }
                return;
            }
            HostAction::Reset => {
                batch.reset = true;
            }
        }
        self.script.pop_front();
    }
}

impl Transport for ScriptedHost {
    fn poll_events(&mut self) -> Result<EventBatch, TransportError> {
        let mut batch = EventBatch::default();

        // One credit flag per channel per cycle.
        let flags = [
            &mut batch.credits.command,
            &mut batch.credits.response,
            &mut batch.credits.command_data,
            &mut batch.credits.response_data,
        ];
        for (owed, flag) in self.credit_owed.iter_mut().zip(flags) {
            if *owed > 0 {
                *owed -= 1;
                *flag = true;
            }
        }

        self.drain_due(&mut batch);
        self.run_script(&mut batch);

        self.cycle += 1;
        Ok(batch)
    }

    fn send_command(&mut self, cmd: &CommandRecord) -> Result<(), TransportError> {
        log::trace!("host saw command {:?} tag {}", cmd.op, cmd.tag);
        self.owe_credit(0);
        if cmd.data.is_some() {
            self.owe_credit(2);
        }
        match cmd.op {
            AfuCmdOp::AssignActag => {
                // Handshake only; nothing comes back.
            }
            AfuCmdOp::Load => {
                self.schedule(Delivery::Response(ResponseRecord {
                    op: HostRespOp::ReadResponse,
                    tag: cmd.tag,
                    code: ResultCode::Done,
                    dlength: cmd.size,
                }));
            }
            AfuCmdOp::Store => {
                let data = cmd
                    .data
                    .as_ref()
                    .ok_or_else(|| TransportError::Malformed("store without payload".into()))?;
                for (i, &b) in data.iter().enumerate() {
                    self.memory.insert(cmd.address + i as u64, b);
                }
                self.schedule(Delivery::Response(ResponseRecord {
                    op: HostRespOp::WriteResponse,
                    tag: cmd.tag,
                    code: ResultCode::Done,
                    dlength: 0,
                }));
            }
            AfuCmdOp::Interrupt => {
                let code = self.interrupt_plan.pop_front().unwrap_or(ResultCode::Done);
                self.schedule(Delivery::Response(ResponseRecord {
                    op: HostRespOp::InterruptResp,
                    tag: cmd.tag,
                    code,
                    dlength: 0,
                }));
            }
        }
        self.commands_seen.push(cmd.clone());
        Ok(())
    }

    fn send_response(&mut self, resp: &OutboundResponse) -> Result<(), TransportError> {
        self.owe_credit(1);
        if resp.data.is_some() {
            self.owe_credit(3);
        }
        self.responses_seen.push(resp.clone());
        Ok(())
    }

    fn send_config_response(&mut self, resp: &OutboundResponse) -> Result<(), TransportError> {
        // Dedicated channel, no credits involved.
        self.config_responses_seen.push(resp.clone());
        Ok(())
    }

    fn pull_response_data(&mut self, tag: u8, size: u32) -> Result<(), TransportError> {
        let address = self
            .commands_seen
            .iter()
            .rev()
            .find(|c| c.tag == tag && c.op == AfuCmdOp::Load)
            .map(|c| c.address)
            .ok_or_else(|| TransportError::Malformed(format!("data pull for unknown tag {}", tag)))?;
        let data = self.memory_bytes(address, size as usize);
        self.schedule(Delivery::ResponseData(DataBeat { tag, data, bad: false }));
        Ok(())
    }

    fn pull_command_data(&mut self, tag: u8, size: u32) -> Result<(), TransportError> {
        let data = self
            .write_payloads
            .remove(&tag)
            .ok_or_else(|| TransportError::Malformed(format!("no payload staged for tag {}", tag)))?;
        if data.len() != size as usize {
            return Err(TransportError::Malformed(format!(
                "payload size mismatch for tag {}: staged {}, pulled {}",
                tag,
                data.len(),
                size
            )));
        }
        self.schedule(Delivery::CommandData(DataBeat { tag, data, bad: false }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_delivers_one_action_per_cycle() {
        let mut host = ScriptedHost::new(1);
        host.script([
            HostAction::AnnounceCredits { cmd: 4, data: 4 },
            HostAction::ConfigWrite { offset: 0x08, value: 1 },
        ]);

        let b1 = host.poll_events().unwrap();
        assert!(b1.initial_credits.is_some());
        assert!(b1.config.is_none());

        let b2 = host.poll_events().unwrap();
        assert!(b2.config.is_some());
        assert!(host.script_drained());
    }

    #[test]
    fn test_store_lands_in_host_memory_and_is_answered() {
        let mut host = ScriptedHost::new(1);
        host.send_command(&CommandRecord {
            op: AfuCmdOp::Store,
            tag: 7,
            address: 0x100,
            size: 2,
            parity: false,
            data: Some(vec![0xAA, 0xBB]),
        })
        .unwrap();

        assert_eq!(host.memory_bytes(0x100, 2), vec![0xAA, 0xBB]);
        // Next poll returns the command and command-data credits
        let batch = host.poll_events().unwrap();
        assert!(batch.credits.command);
        assert!(batch.credits.command_data);
        // The write ack arrives after the latency
        let batch = host.poll_events().unwrap();
        let resp = batch.response.unwrap();
        assert_eq!(resp.op, HostRespOp::WriteResponse);
        assert_eq!(resp.tag, 7);
    }

    #[test]
    fn test_load_data_pull_round_trip() {
        let mut host = ScriptedHost::new(1);
        host.memory.insert(0x200, 0x5A);
        host.send_command(&CommandRecord {
            op: AfuCmdOp::Load,
            tag: 3,
            address: 0x200,
            size: 4,
            parity: false,
            data: None,
        })
        .unwrap();

        let mut resp = None;
        for _ in 0..4 {
            let batch = host.poll_events().unwrap();
            if let Some(r) = batch.response {
                resp = Some(r);
                break;
            }
        }
        let resp = resp.unwrap();
        assert_eq!(resp.op, HostRespOp::ReadResponse);

        host.pull_response_data(3, 4).unwrap();
        let mut beat = None;
        for _ in 0..4 {
            let batch = host.poll_events().unwrap();
            if let Some(b) = batch.response_data {
                beat = Some(b);
                break;
            }
        }
        let beat = beat.unwrap();
        assert_eq!(beat.data, vec![0x5A, 0, 0, 0]);
    }

    #[test]
    fn test_interrupt_plan_front_first() {
        let mut host = ScriptedHost::new(1);
        host.plan_interrupts([ResultCode::Retry, ResultCode::Done]);

        for expect in [ResultCode::Retry, ResultCode::Done, ResultCode::Done] {
            host.send_command(&CommandRecord {
                op: AfuCmdOp::Interrupt,
                tag: 9,
                address: 0,
                size: 0,
                parity: false,
                data: None,
            })
            .unwrap();
            let mut seen = None;
            for _ in 0..4 {
                let batch = host.poll_events().unwrap();
                if let Some(r) = batch.response {
                    seen = Some(r.code);
                    break;
                }
            }
            assert_eq!(seen, Some(expect));
        }
    }

    #[test]
    fn test_one_credit_flag_per_cycle() {
        let mut host = ScriptedHost::new(1);
        host.owe_credit(0);
        host.owe_credit(0);

        let b1 = host.poll_events().unwrap();
        assert!(b1.credits.command);
        let b2 = host.poll_events().unwrap();
        assert!(b2.credits.command);
        let b3 = host.poll_events().unwrap();
        assert!(!b3.credits.command);
    }
}
