//! Top-level device controller.
//!
//! Owns the transport event pump and the device lifecycle. Each cycle it
//! drains returned credits into the broker, dispatches inbound events by
//! category (config space, memory access, responses), advances the
//! lifecycle, and, while Running, either flushes completed-context status
//! or asks the active pool to issue one command. The flow-control rule is
//! absolute: no send without first taking the matching credit.
//!
//! A device reset wipes the broker and pools while the link partner may
//! still hold responses, beats and credit flags for pre-reset traffic.
//! Those stragglers are legal link events, not protocol violations, and
//! are logged and dropped when their tag no longer has an owner.
//!
//! # Cycle ordering
//!
//! 1. Poll the transport (a transport error is fatal).
//! 2. Capture the one-time initial credit announcement.
//! 3. Apply credit give-backs before any send decision.
//! 4. Dispatch a pending config-space operation.
//! 5. Dispatch a pending memory command (MMIO vs secondary space by
//!    address range; multi-beat writes run through the memory sub-state).
//! 6. Dispatch a pending response, including the interrupt result-code
//!    branch and read-data continuation.
//! 7. Advance the lifecycle; prefer status flush over new work.
//! 8. Tick every machine's delay counter exactly once.

use std::collections::VecDeque;

use anyhow::{Context as _, Result};

use super::broker::{CreditChannel, TagBroker};
use super::command::{command_parity, CommandKind};
use super::descriptor::{
    self, control, ctx, reg, Descriptor, MAX_CONTEXTS, MMIO_BASE, MMIO_SIZE,
};
use super::memory::SparseMemory;
use super::pool::MachinePool;
use crate::tlx::{
    AfuCmdOp, AfuRespOp, CommandRecord, DataBeat, HostCmdOp, HostCommandRecord, HostRespOp,
    OutboundResponse, ResponseRecord, ResultCode, Transport,
};

/// Coarse operating mode of the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfuState {
    /// Powered but not enabled.
    Idle,
    /// Explicit reset in progress; broker and pools are cleared.
    Reset,
    /// Enabled, waiting for a context to attach.
    Ready,
    /// Attached and generating traffic.
    Running,
    /// Draining: no new work, waiting for every machine to complete.
    WaitingForLastResponses,
    /// Done; the poll loop exits.
    Halt,
}

impl AfuState {
    fn status_code(self) -> u64 {
        match self {
            AfuState::Idle => 0,
            AfuState::Reset => 1,
            AfuState::Ready => 2,
            AfuState::Running => 3,
            AfuState::WaitingForLastResponses => 4,
            AfuState::Halt => 5,
        }
    }
}

/// Config-space completion sub-state.
#[derive(Debug, Clone)]
enum ConfigState {
    Idle,
    /// A config operation arrived and awaits its completion.
    Ready(HostCommandRecord),
}

/// Multi-beat write sub-state.
#[derive(Debug, Clone)]
enum MemoryState {
    Idle,
    /// A block write is pulling its payload, then waiting to acknowledge.
    Ready(PendingWrite),
}

#[derive(Debug, Clone)]
struct PendingWrite {
    cmd: HostCommandRecord,
    /// Payload once the beat arrived; `None` while still pulling.
    data: Option<Vec<u8>>,
    /// Beat arrived marked bad; answer with a failure.
    bad: bool,
}

/// Running counters, reported in the end-of-run summary.
#[derive(Debug, Default, Clone)]
pub struct AfuStats {
    pub cycles: u64,
    pub commands_issued: u64,
    pub responses_handled: u64,
    pub host_commands: u64,
    pub config_ops: u64,
    pub retries: u64,
    pub status_flushes: u64,
}

/// The device controller.
pub struct AfuController<T: Transport> {
    transport: T,
    broker: TagBroker,
    descriptor: Descriptor,
    memory: SparseMemory,
    /// Dense pool table, indexed by context id.
    pools: Vec<MachinePool>,
    /// The single context currently scheduled for issue.
    active_context: Option<usize>,
    state: AfuState,
    config_state: ConfigState,
    memory_state: MemoryState,
    /// Tags whose read-response data pull is outstanding
    /// (the response sub-state WaitingForData).
    pending_read_data: Vec<u8>,
    /// Inbound memory commands not yet dispatched.
    host_commands: VecDeque<HostCommandRecord>,
    /// Context whose attach handshake still has to go out.
    pending_attach: Option<usize>,
    /// Tags whose retry-requested response deferred a resend; served
    /// front-first, one per cycle.
    pending_resends: VecDeque<u8>,
    /// Host declared the test run finished.
    test_complete: bool,
    /// Host requested an explicit reset through config space.
    reset_requested: bool,
    /// Link partner's announced capacity, remembered across device resets.
    link_credits: Option<(u32, u32)>,
    /// Per-context: completion status already flushed to the host.
    flushed: Vec<bool>,
    /// In-flight status-flush store: (tag, context).
    flush_in_flight: Option<(u8, usize)>,
    seed: u64,
    cycle: u64,
    stats: AfuStats,
}

impl<T: Transport> AfuController<T> {
    pub fn new(transport: T, send_credit_max: u32, seed: u64) -> Self {
        Self {
            transport,
            broker: TagBroker::new(send_credit_max, seed),
            descriptor: Descriptor::new(),
            memory: SparseMemory::new(),
            pools: Vec::new(),
            active_context: None,
            state: AfuState::Idle,
            config_state: ConfigState::Idle,
            memory_state: MemoryState::Idle,
            pending_read_data: Vec::new(),
            host_commands: VecDeque::new(),
            pending_attach: None,
            pending_resends: VecDeque::new(),
            test_complete: false,
            reset_requested: false,
            link_credits: None,
            flushed: Vec::new(),
            flush_in_flight: None,
            seed,
            cycle: 0,
            stats: AfuStats::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> AfuState {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> &AfuStats {
        &self.stats
    }

    #[inline]
    pub fn broker(&self) -> &TagBroker {
        &self.broker
    }

    #[inline]
    pub fn memory(&self) -> &SparseMemory {
        &self.memory
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn pool(&self, context: usize) -> Option<&MachinePool> {
        self.pools.get(context)
    }

    /// Run until Halt or the cycle budget runs out. Returns the cycles
    /// executed; a transport failure ends the run with an error.
    pub fn run(&mut self, max_cycles: u64) -> Result<u64> {
        let start = self.cycle;
        while self.cycle - start < max_cycles {
            if !self.step()? {
                break;
            }
        }
        Ok(self.cycle - start)
    }

    /// Execute one device cycle. Returns false once the device halted.
    pub fn step(&mut self) -> Result<bool> {
        if self.state == AfuState::Halt {
            return Ok(false);
        }

        // 1: one batch per cycle; transport failure is fatal.
        let batch = self
            .transport
            .poll_events()
            .context("transport poll failed, shutting down")?;
        self.cycle += 1;
        self.stats.cycles += 1;

        // 2: capture the partner's capacity exactly once.
        if let Some(init) = batch.initial_credits {
            if self.link_credits.is_none() {
                self.broker.init_link_credits(init.cmd, init.data);
                self.link_credits = Some((init.cmd, init.data));
            } else {
                log::warn!("duplicate initial credit announcement ignored");
            }
        }

        // 3: give-backs land before any send decision this cycle. Flags
        // for pre-reset sends can arrive after the counters were reseeded;
        // those are stale and get dropped.
        let returns = [
            (batch.credits.command, CreditChannel::Command),
            (batch.credits.response, CreditChannel::Response),
            (batch.credits.command_data, CreditChannel::CommandData),
            (batch.credits.response_data, CreditChannel::ResponseData),
        ];
        for (flag, channel) in returns {
            if flag && !self.broker.try_give_back(channel) {
                log::debug!("stale credit flag on {:?} dropped", channel);
            }
        }

        if batch.reset {
            self.on_external_reset();
        }

        if let Some(cfg) = batch.config {
            match self.config_state {
                ConfigState::Idle => self.config_state = ConfigState::Ready(cfg),
                ConfigState::Ready(_) => {
                    log::warn!("config operation arrived while one is pending, dropped");
                }
            }
        }
        if let Some(cmd) = batch.command {
            self.host_commands.push_back(cmd);
        }

        // 4
        self.dispatch_config()?;
        // 5
        self.dispatch_memory(batch.command_data)?;
        // 6
        if let Some(resp) = batch.response {
            self.dispatch_response(resp)?;
        }
        if let Some(beat) = batch.response_data {
            self.dispatch_response_data(beat);
        }
        // 7
        self.advance_lifecycle()?;
        // 8: every machine ticks exactly once per cycle.
        for pool in &mut self.pools {
            pool.advance_cycle();
        }

        Ok(self.state != AfuState::Halt)
    }

    // =====================================================================
    // Config space
    // =====================================================================

    fn dispatch_config(&mut self) -> Result<()> {
        let cmd = match std::mem::replace(&mut self.config_state, ConfigState::Idle) {
            ConfigState::Idle => return Ok(()),
            ConfigState::Ready(cmd) => cmd,
        };
        self.stats.config_ops += 1;

        // Config completions ride the dedicated config channel; they are
        // not counted against the broker's credit pools.
        match cmd.op {
            HostCmdOp::ConfigRead => match self.descriptor.get_register(cmd.address) {
                Ok(value) => {
                    let len = (cmd.size as usize).clamp(1, 8);
                    self.transport.send_config_response(&OutboundResponse {
                        op: AfuRespOp::ReadDone,
                        tag: cmd.tag,
                        data: Some(value.to_le_bytes()[..len].to_vec()),
                    })?;
                }
                Err(e) => {
                    log::warn!("config read rejected: {}", e);
                    self.transport.send_config_response(&OutboundResponse {
                        op: AfuRespOp::ReadFailed,
                        tag: cmd.tag,
                        data: None,
                    })?;
                }
            },
            HostCmdOp::ConfigWrite => {
                let value = cmd.data.as_deref().and_then(|d| {
                    let mut bytes = [0u8; 8];
                    if d.is_empty() || d.len() > 8 {
                        return None;
                    }
                    bytes[..d.len()].copy_from_slice(d);
                    Some(u64::from_le_bytes(bytes))
                });
                let outcome = match value {
                    Some(value) => self
                        .descriptor
                        .set_register(cmd.address, value)
                        .map(|()| value)
                        .map_err(|e| e.to_string()),
                    None => Err("config write without a sane payload".to_string()),
                };
                match outcome {
                    Ok(value) => {
                        self.react_config_write(cmd.address, value);
                        self.transport.send_config_response(&OutboundResponse {
                            op: AfuRespOp::WriteDone,
                            tag: cmd.tag,
                            data: None,
                        })?;
                    }
                    Err(e) => {
                        log::warn!("config write rejected: {}", e);
                        self.transport.send_config_response(&OutboundResponse {
                            op: AfuRespOp::WriteFailed,
                            tag: cmd.tag,
                            data: None,
                        })?;
                    }
                }
            }
            other => {
                log::warn!("non-config opcode {:?} on the config channel, dropped", other);
            }
        }
        Ok(())
    }

    fn react_config_write(&mut self, offset: u64, value: u64) {
        match offset {
            reg::AFU_CONTROL => {
                if value & control::RESET != 0 {
                    self.reset_requested = true;
                    // Self-clearing bit
                    let _ = self
                        .descriptor
                        .set_register(reg::AFU_CONTROL, value & !control::RESET);
                }
            }
            reg::CONTEXT_COUNT => {
                self.ensure_pools(value as usize);
            }
            _ => {}
        }
    }

    /// (Re)build the dense pool table for the discovered context count.
    /// Machines are recreated from scratch on every context change.
    fn ensure_pools(&mut self, count: usize) {
        let count = count.clamp(0, MAX_CONTEXTS);
        if count == self.pools.len() {
            return;
        }
        log::info!("context table rebuilt for {} context(s)", count);
        self.pools = (0..count)
            .map(|c| MachinePool::new(c as u16, self.seed))
            .collect();
        self.flushed = vec![false; count];
        self.active_context = None;
        self.flush_in_flight = None;
        self.pending_resends.clear();
    }

    // =====================================================================
    // Memory commands (MMIO and secondary space)
    // =====================================================================

    #[inline]
    fn is_mmio(address: u64) -> bool {
        (MMIO_BASE..MMIO_BASE + MMIO_SIZE).contains(&address)
    }

    fn dispatch_memory(&mut self, command_data: Option<DataBeat>) -> Result<()> {
        // Continue a multi-beat write first: payload beat, then the ack.
        if let Some(beat) = command_data {
            match &mut self.memory_state {
                MemoryState::Ready(pw) if pw.data.is_none() && pw.cmd.tag == beat.tag => {
                    pw.bad = beat.bad;
                    pw.data = Some(beat.data);
                }
                _ => {
                    // Straggler from before a reset dropped the write.
                    log::warn!("payload beat for tag {} with no write pulling, dropped", beat.tag);
                }
            }
        }

        if let MemoryState::Ready(pw) = &self.memory_state {
            if pw.data.is_some() {
                if self.broker.try_take(CreditChannel::Response) {
                    let MemoryState::Ready(PendingWrite { cmd, data, bad }) =
                        std::mem::replace(&mut self.memory_state, MemoryState::Idle)
                    else {
                        unreachable!()
                    };
                    match data {
                        Some(_) if bad => {
                            log::warn!("block write tag {} pulled bad data", cmd.tag);
                            self.send_memory_response(AfuRespOp::WriteFailed, cmd.tag, None)?;
                        }
                        Some(data) => self.apply_write(&cmd, &data)?,
                        None => unreachable!(),
                    }
                }
                // No response credit: acknowledge a later cycle.
                return Ok(());
            }
            // Still pulling; the queued commands wait their turn.
            return Ok(());
        }

        let Some(cmd) = self.host_commands.front().cloned() else {
            return Ok(());
        };

        match cmd.op {
            HostCmdOp::PartialRead | HostCmdOp::ReadBlock => {
                if self.dispatch_memory_read(&cmd)? {
                    self.host_commands.pop_front();
                    self.stats.host_commands += 1;
                }
            }
            HostCmdOp::PartialWrite => {
                // Single beat: payload rides inline, apply and acknowledge
                // in one go.
                if !self.broker.try_take(CreditChannel::Response) {
                    return Ok(());
                }
                self.host_commands.pop_front();
                self.stats.host_commands += 1;
                let data = cmd.data.clone().unwrap_or_default();
                self.apply_write(&cmd, &data)?;
            }
            HostCmdOp::WriteBlock => {
                // Multi beat: pull the payload, acknowledge once it landed.
                self.host_commands.pop_front();
                self.stats.host_commands += 1;
                self.transport.pull_command_data(cmd.tag, cmd.size)?;
                self.memory_state = MemoryState::Ready(PendingWrite {
                    cmd,
                    data: None,
                    bad: false,
                });
            }
            HostCmdOp::ConfigRead | HostCmdOp::ConfigWrite => {
                log::warn!("config opcode {:?} on the command channel, dropped", cmd.op);
                self.host_commands.pop_front();
            }
        }
        Ok(())
    }

    /// Read MMIO or secondary memory and answer. Returns false when credits
    /// ran dry and the command has to wait.
    fn dispatch_memory_read(&mut self, cmd: &HostCommandRecord) -> Result<bool> {
        let len = cmd.size as usize;
        let result: Result<Vec<u8>, String> = if Self::is_mmio(cmd.address) {
            self.descriptor
                .get_mmio(cmd.address - MMIO_BASE, len)
                .map(|b| b.to_vec())
                .map_err(|e| e.to_string())
        } else {
            let mut buf = vec![0u8; len];
            self.memory.read(cmd.address, &mut buf);
            Ok(buf)
        };

        match result {
            Ok(data) => {
                // Data rides with the response: both credits or nothing.
                if !self.broker.try_take(CreditChannel::Response) {
                    return Ok(false);
                }
                if !self.broker.try_take(CreditChannel::ResponseData) {
                    self.broker.give_back(CreditChannel::Response);
                    return Ok(false);
                }
                self.transport.send_response(&OutboundResponse {
                    op: AfuRespOp::ReadDone,
                    tag: cmd.tag,
                    data: Some(data),
                })?;
            }
            Err(e) => {
                if !self.broker.try_take(CreditChannel::Response) {
                    return Ok(false);
                }
                log::warn!("memory read at {:#X} rejected: {}", cmd.address, e);
                self.transport.send_response(&OutboundResponse {
                    op: AfuRespOp::ReadFailed,
                    tag: cmd.tag,
                    data: None,
                })?;
            }
        }
        Ok(true)
    }

    /// Apply a write whose payload is in hand and acknowledge it exactly
    /// once. The caller already took the response credit.
    fn apply_write(&mut self, cmd: &HostCommandRecord, data: &[u8]) -> Result<()> {
        if Self::is_mmio(cmd.address) {
            let offset = cmd.address - MMIO_BASE;
            let ok = match self.descriptor.set_mmio(offset, data) {
                Ok(()) => self.react_mmio_write(offset),
                Err(e) => {
                    log::warn!("mmio write at {:#X} rejected: {}", cmd.address, e);
                    false
                }
            };
            let op = if ok { AfuRespOp::WriteDone } else { AfuRespOp::WriteFailed };
            self.send_memory_response(op, cmd.tag, None)
        } else {
            self.memory.write(cmd.address, data);
            self.send_memory_response(AfuRespOp::WriteDone, cmd.tag, None)
        }
    }

    fn send_memory_response(
        &mut self,
        op: AfuRespOp,
        tag: u8,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        self.transport.send_response(&OutboundResponse { op, tag, data })?;
        Ok(())
    }

    /// React to a landed MMIO write: machine configuration, context start,
    /// test-complete marks. Returns false when the write was malformed and
    /// the completion should fail.
    fn react_mmio_write(&mut self, offset: u64) -> bool {
        let Some((context, within)) = descriptor::split_context_offset(offset) else {
            log::warn!("mmio write outside any context block: {:#X}", offset);
            return false;
        };

        if let Some((slot, word)) = descriptor::machine_slot(within) {
            // Word 0 is the configuration trigger; the other words are
            // plain storage until it lands.
            if word != 0 {
                return true;
            }
            if context >= self.pools.len() {
                log::warn!("machine config for undiscovered context {}", context);
                return false;
            }
            let raw = match self.descriptor.machine_config(context, slot) {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("machine config fetch failed: {}", e);
                    return false;
                }
            };
            return match self.pools[context].configure_machine(slot, &raw) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("machine {}/{} rejected config: {}", context, slot, e);
                    false
                }
            };
        }

        match within {
            ctx::CONTEXT_CONTROL => {
                let value = self.descriptor.mmio_u64(offset).unwrap_or(0);
                if value & ctx::GO != 0 {
                    if context >= self.pools.len() {
                        log::warn!("start request for undiscovered context {}", context);
                        return false;
                    }
                    self.pending_attach = Some(context);
                }
                true
            }
            ctx::CONTEXT_STATUS => {
                let value = self.descriptor.mmio_u64(offset).unwrap_or(0);
                if value & ctx::TEST_COMPLETE != 0 {
                    log::info!("host declared context {} test complete", context);
                    self.test_complete = true;
                }
                true
            }
            _ => true,
        }
    }

    // =====================================================================
    // Responses
    // =====================================================================

    fn dispatch_response(&mut self, resp: ResponseRecord) -> Result<()> {
        self.stats.responses_handled += 1;

        // A status-flush store completes outside any machine.
        if let Some((tag, context)) = self.flush_in_flight {
            if tag == resp.tag {
                match resp.op {
                    HostRespOp::WriteResponse => {
                        log::info!("context {} status flushed", context);
                    }
                    other => {
                        log::warn!("status flush for context {} answered {:?}", context, other);
                    }
                }
                self.flushed[context] = true;
                self.flush_in_flight = None;
                self.broker.release_tag(tag);
                return Ok(());
            }
        }

        if !self.broker.tag_in_use(resp.tag) {
            // Straggler for a tag dropped by a device reset.
            log::warn!("response for unowned tag {}, dropped", resp.tag);
            return Ok(());
        }

        match resp.op {
            HostRespOp::ReadResponse => match resp.code {
                ResultCode::Done => {
                    // Data arrives a later cycle; hold the tag open.
                    self.pending_read_data.push(resp.tag);
                    self.transport.pull_response_data(resp.tag, resp.dlength)?;
                }
                ResultCode::Retry => self.schedule_retry(resp.tag),
                code => {
                    log::warn!("read tag {} ended {:?}", resp.tag, code);
                    self.complete_tag(resp.tag);
                }
            },
            HostRespOp::ReadFailed => {
                log::warn!("read tag {} failed", resp.tag);
                self.complete_tag(resp.tag);
            }
            HostRespOp::WriteResponse => {
                self.complete_tag(resp.tag);
            }
            HostRespOp::WriteFailed => {
                log::warn!("write tag {} failed", resp.tag);
                self.complete_tag(resp.tag);
            }
            HostRespOp::TouchResp => {
                // Bare response: completion, nothing follows.
                self.complete_tag(resp.tag);
            }
            HostRespOp::InterruptResp => match resp.code {
                ResultCode::Done => self.complete_tag(resp.tag),
                ResultCode::Retry => self.schedule_retry(resp.tag),
                ResultCode::Pending => {
                    // Held by the host; a follow-up response arrives later
                    // on the same tag. Defer indefinitely.
                    log::debug!("interrupt tag {} pending", resp.tag);
                }
                code => {
                    log::error!("interrupt tag {} failed with {:?}", resp.tag, code);
                    self.complete_tag(resp.tag);
                }
            },
        }
        Ok(())
    }

    fn dispatch_response_data(&mut self, beat: DataBeat) {
        let Some(pos) = self.pending_read_data.iter().position(|&t| t == beat.tag) else {
            log::warn!("data beat for tag {} with no pull outstanding, dropped", beat.tag);
            return;
        };
        self.pending_read_data.swap_remove(pos);
        if beat.bad {
            log::warn!("read tag {} returned bad data", beat.tag);
        }
        self.complete_tag(beat.tag);
    }

    /// Mark the command carrying `tag` completed and hand the tag back.
    fn complete_tag(&mut self, tag: u8) {
        let machine = self
            .pools
            .iter_mut()
            .find_map(|p| p.machine_with_tag(tag));
        match machine {
            Some(machine) => machine.complete(),
            None => panic!("terminal response for tag {} with no owning machine", tag),
        }
        self.broker.release_tag(tag);
    }

    /// A retry-requested response defers exactly one resend of the command
    /// carrying `tag`; the owning machine and the tag stay put.
    fn schedule_retry(&mut self, tag: u8) {
        log::debug!("retry requested for tag {}", tag);
        self.pending_resends.push_back(tag);
        self.stats.retries += 1;
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    fn on_external_reset(&mut self) {
        match self.state {
            AfuState::Running => {
                log::info!("external reset: draining outstanding responses");
                for pool in &mut self.pools {
                    pool.disable_all();
                }
                self.state = AfuState::WaitingForLastResponses;
                self.set_status();
            }
            AfuState::Halt => {}
            other => {
                log::debug!("external reset ignored in {:?}", other);
            }
        }
    }

    fn advance_lifecycle(&mut self) -> Result<()> {
        match self.state {
            AfuState::Idle => {
                let ctrl = self.descriptor.get_register(reg::AFU_CONTROL).unwrap_or(0);
                if ctrl & control::ENABLE != 0 {
                    let count = self
                        .descriptor
                        .get_register(reg::CONTEXT_COUNT)
                        .unwrap_or(0)
                        .max(1);
                    self.ensure_pools(count as usize);
                    log::info!("device enabled, {} context(s)", self.pools.len());
                    self.state = AfuState::Ready;
                    self.set_status();
                }
            }
            AfuState::Reset => {
                self.apply_reset();
                self.state = AfuState::Ready;
                self.set_status();
                log::info!("reset complete");
            }
            AfuState::Ready => {
                if self.reset_requested {
                    self.reset_requested = false;
                    self.state = AfuState::Reset;
                    self.set_status();
                } else if let Some(context) = self.pending_attach {
                    self.try_attach(context)?;
                }
            }
            AfuState::Running => {
                if self.reset_requested {
                    self.reset_requested = false;
                    log::info!("explicit reset requested while running");
                    self.state = AfuState::Reset;
                    self.set_status();
                } else if self.test_complete {
                    self.test_complete = false;
                    log::info!("test complete, returning to ready");
                    self.state = AfuState::Ready;
                    self.set_status();
                } else if let Some(context) = self.pending_attach {
                    // Context switch while running: attach the new one.
                    self.try_attach(context)?;
                } else if self.try_resend()? {
                    // Deferred retry goes out before anything new.
                } else if self.try_flush_status()? {
                    // Completed-context status beats new work.
                } else if let Some(context) = self.active_context {
                    let record =
                        self.pools[context].send_command(&mut self.broker, self.cycle);
                    if let Some(record) = record {
                        self.transport.send_command(&record)?;
                        self.stats.commands_issued += 1;
                    }
                }
            }
            AfuState::WaitingForLastResponses => {
                // Retries still drain while waiting, and a completed
                // context's status still goes out before the device stops.
                let _ = self.try_resend()?;
                if self.pools.iter().all(|p| p.all_completed())
                    && !self.try_flush_status()?
                    && self.flush_in_flight.is_none()
                {
                    log::info!("all machines completed, halting");
                    self.state = AfuState::Halt;
                    self.set_status();
                }
            }
            AfuState::Halt => {}
        }
        Ok(())
    }

    /// Send the attach handshake for `context` once a command credit is
    /// available. The assign-actag command is tag-less and draws no
    /// response.
    fn try_attach(&mut self, context: usize) -> Result<()> {
        if !self.broker.try_take(CreditChannel::Command) {
            return Ok(());
        }
        let record = CommandRecord {
            op: AfuCmdOp::AssignActag,
            tag: 0,
            address: context as u64,
            size: 0,
            parity: command_parity(AfuCmdOp::AssignActag, 0, context as u64),
            data: None,
        };
        self.transport.send_command(&record)?;
        self.pending_attach = None;
        self.active_context = Some(context);
        if self.state != AfuState::Running {
            self.state = AfuState::Running;
            self.set_status();
        }
        log::info!("context {} attached, running", context);
        Ok(())
    }

    /// Resend the oldest retried command if the credits allow. The tag is
    /// resolved back to the machine that owns it; the slot served most
    /// recently is irrelevant here. Returns true when the issue slot of
    /// this cycle was consumed.
    fn try_resend(&mut self) -> Result<bool> {
        loop {
            let Some(&tag) = self.pending_resends.front() else {
                return Ok(false);
            };
            let target = (0..self.pools.len())
                .find_map(|c| self.pools[c].slot_with_tag(tag).map(|s| (c, s)));
            let Some((context, slot)) = target else {
                // The owner was torn down by a reset; nothing to resend.
                log::debug!("retried tag {} no longer has an owner, dropped", tag);
                self.pending_resends.pop_front();
                continue;
            };
            if !self.broker.try_take(CreditChannel::Command) {
                return Ok(true); // keep the slot; retry again next cycle
            }
            if self.pools[context].machine(slot).kind() == CommandKind::Store
                && !self.broker.try_take(CreditChannel::CommandData)
            {
                self.broker.give_back(CreditChannel::Command);
                return Ok(true);
            }
            let record = self.pools[context].resend_command(slot);
            self.transport.send_command(&record)?;
            self.pending_resends.pop_front();
            log::debug!("resent tag {} from machine {}/{}", tag, context, slot);
            return Ok(true);
        }
    }

    /// Flush one completed context's status to its host-provided status
    /// address. Returns true when the issue slot of this cycle was used.
    fn try_flush_status(&mut self) -> Result<bool> {
        if self.flush_in_flight.is_some() {
            return Ok(false);
        }
        // Eligible once the context's programmed work is over: every slot
        // disabled again, everything issued has completed.
        let candidate = (0..self.pools.len()).find(|&c| {
            !self.flushed[c]
                && self.pools[c].any_issued()
                && self.pools[c].all_disabled()
                && self.pools[c].all_completed()
                && self.descriptor.status_address(c).unwrap_or(0) != 0
        });
        let Some(context) = candidate else {
            return Ok(false);
        };

        if !self.broker.try_take(CreditChannel::Command) {
            return Ok(true);
        }
        let Some(tag) = self.broker.allocate_tag() else {
            self.broker.give_back(CreditChannel::Command);
            return Ok(true);
        };
        if !self.broker.try_take(CreditChannel::CommandData) {
            self.broker.release_tag(tag);
            self.broker.give_back(CreditChannel::Command);
            return Ok(true);
        }

        let address = self.descriptor.status_address(context).unwrap_or(0);
        let status = 1u64 | (self.pools[context].total_issued() << 8);
        let record = CommandRecord {
            op: AfuCmdOp::Store,
            tag,
            address,
            size: 8,
            parity: command_parity(AfuCmdOp::Store, tag, address),
            data: Some(status.to_le_bytes().to_vec()),
        };
        self.transport.send_command(&record)?;
        self.flush_in_flight = Some((tag, context));
        self.stats.status_flushes += 1;
        log::info!("flushing context {} status to {:#X}", context, address);
        Ok(true)
    }

    /// Explicit device reset: broker and pools are cleared first, the
    /// remembered link capacity reseeds the channels, every sub-state
    /// drops its work.
    fn apply_reset(&mut self) {
        self.broker.reset();
        if let Some((cmd, data)) = self.link_credits {
            self.broker.init_link_credits(cmd, data);
        }
        for pool in &mut self.pools {
            pool.reset();
        }
        self.config_state = ConfigState::Idle;
        self.memory_state = MemoryState::Idle;
        self.pending_read_data.clear();
        self.host_commands.clear();
        self.pending_attach = None;
        self.pending_resends.clear();
        self.test_complete = false;
        self.active_context = None;
        self.flushed.iter_mut().for_each(|f| *f = false);
        self.flush_in_flight = None;
    }

    fn set_status(&mut self) {
        let _ = self
            .descriptor
            .set_register(reg::AFU_STATUS, self.state.status_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlx::{CreditReturn, EventBatch, InitialCredits, TransportError};

    /// Hand-driven transport double: tests enqueue batches and inspect
    /// everything the controller sent.
    #[derive(Default)]
    struct TestTransport {
        inbound: VecDeque<EventBatch>,
        sent_commands: Vec<CommandRecord>,
        sent_responses: Vec<OutboundResponse>,
        sent_config_responses: Vec<OutboundResponse>,
        response_pulls: Vec<(u8, u32)>,
        command_pulls: Vec<(u8, u32)>,
        fail: bool,
    }

    impl Transport for TestTransport {
        fn poll_events(&mut self) -> Result<EventBatch, TransportError> {
            if self.fail {
                return Err(TransportError::Closed);
            }
            Ok(self.inbound.pop_front().unwrap_or_default())
        }

        fn send_command(&mut self, cmd: &CommandRecord) -> Result<(), TransportError> {
            self.sent_commands.push(cmd.clone());
            Ok(())
        }

        fn send_response(&mut self, resp: &OutboundResponse) -> Result<(), TransportError> {
            self.sent_responses.push(resp.clone());
            Ok(())
        }

        fn send_config_response(&mut self, resp: &OutboundResponse) -> Result<(), TransportError> {
            self.sent_config_responses.push(resp.clone());
            Ok(())
        }

        fn pull_response_data(&mut self, tag: u8, size: u32) -> Result<(), TransportError> {
            self.response_pulls.push((tag, size));
            Ok(())
        }

        fn pull_command_data(&mut self, tag: u8, size: u32) -> Result<(), TransportError> {
            self.command_pulls.push((tag, size));
            Ok(())
        }
    }

    fn controller() -> AfuController<TestTransport> {
        AfuController::new(TestTransport::default(), 8, 42)
    }

    fn batch_with(f: impl FnOnce(&mut EventBatch)) -> EventBatch {
        let mut batch = EventBatch::default();
        f(&mut batch);
        batch
    }

    fn config_write(offset: u64, value: u64) -> HostCommandRecord {
        HostCommandRecord {
            op: HostCmdOp::ConfigWrite,
            tag: 0xC0,
            address: offset,
            size: 8,
            data: Some(value.to_le_bytes().to_vec()),
        }
    }

    fn mmio_write(offset: u64, value: u64) -> HostCommandRecord {
        HostCommandRecord {
            op: HostCmdOp::PartialWrite,
            tag: 0xA0,
            address: MMIO_BASE + offset,
            size: 8,
            data: Some(value.to_le_bytes().to_vec()),
        }
    }

    /// 64-byte load machine, enable-always, zero delay.
    const LOAD_ALWAYS: u64 = 2 | (0x10 << 8) | (6 << 16);
    /// One-shot interrupt machine.
    const INTERRUPT_ONCE: u64 = 1 | (0x58 << 8);

    /// Drive the controller through enable + one machine config + go.
    fn bring_up(afu: &mut AfuController<TestTransport>, machine_word0: u64) {
        let slot0 = ctx::MACHINE_CONFIG_BASE;
        for batch in [
            batch_with(|b| b.initial_credits = Some(InitialCredits { cmd: 8, data: 8 })),
            batch_with(|b| b.config = Some(config_write(reg::AFU_CONTROL, control::ENABLE))),
            batch_with(|b| b.command = Some(mmio_write(slot0 + 8, 0x1000_0000))), // base
            batch_with(|b| b.command = Some(mmio_write(slot0 + 16, 0x1000))), // window
            batch_with(|b| b.command = Some(mmio_write(slot0, machine_word0))),
            batch_with(|b| b.command = Some(mmio_write(ctx::STATUS_ADDRESS, 0x9000))),
            batch_with(|b| b.command = Some(mmio_write(ctx::CONTEXT_CONTROL, ctx::GO))),
        ] {
            afu.transport_mut().inbound.push_back(batch);
            afu.step().unwrap();
        }
    }

    #[test]
    fn test_enable_moves_idle_to_ready() {
        let mut afu = controller();
        assert_eq!(afu.state(), AfuState::Idle);

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.initial_credits = Some(InitialCredits { cmd: 4, data: 4 });
            b.config = Some(config_write(reg::AFU_CONTROL, control::ENABLE));
        }));
        afu.step().unwrap();
        assert_eq!(afu.state(), AfuState::Ready);
        // The enable write was acknowledged on the config channel
        assert_eq!(afu.transport().sent_config_responses.len(), 1);
        assert_eq!(afu.transport().sent_config_responses[0].op, AfuRespOp::WriteDone);
    }

    #[test]
    fn test_go_sends_attach_and_runs() {
        let mut afu = controller();
        bring_up(&mut afu, LOAD_ALWAYS);

        assert_eq!(afu.state(), AfuState::Running);
        let attach = &afu.transport().sent_commands[0];
        assert_eq!(attach.op, AfuCmdOp::AssignActag);
    }

    #[test]
    fn test_load_issue_and_completion_releases_tag() {
        let mut afu = controller();
        bring_up(&mut afu, LOAD_ALWAYS);

        afu.step().unwrap();
        let load = afu
            .transport()
            .sent_commands
            .iter()
            .find(|c| c.op == AfuCmdOp::Load)
            .cloned()
            .unwrap();
        assert!(afu.broker().tag_in_use(load.tag));

        // Read response, then the data beat a cycle later
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::ReadResponse,
                tag: load.tag,
                code: ResultCode::Done,
                dlength: load.size,
            });
        }));
        afu.step().unwrap();
        assert_eq!(afu.transport().response_pulls, vec![(load.tag, load.size)]);
        assert!(afu.broker().tag_in_use(load.tag));

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response_data = Some(DataBeat {
                tag: load.tag,
                data: vec![0u8; load.size as usize],
                bad: false,
            });
        }));
        afu.step().unwrap();
        assert!(!afu.broker().tag_in_use(load.tag));
    }

    #[test]
    fn test_multi_beat_write_acknowledged_exactly_once() {
        let mut afu = controller();
        bring_up(&mut afu, 0); // no machines enabled

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.command = Some(HostCommandRecord {
                op: HostCmdOp::WriteBlock,
                tag: 0x31,
                address: 0x4000,
                size: 128,
                data: None,
            });
        }));
        afu.step().unwrap();
        // Sub-state left Idle: the payload pull went out, no ack yet
        assert_eq!(afu.transport().command_pulls, vec![(0x31, 128)]);
        let before = afu.transport().sent_responses.len();

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.command_data = Some(DataBeat {
                tag: 0x31,
                data: vec![0xAB; 128],
                bad: false,
            });
        }));
        afu.step().unwrap();
        afu.step().unwrap();

        let acks: Vec<_> = afu.transport().sent_responses[before..]
            .iter()
            .filter(|r| r.tag == 0x31)
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].op, AfuRespOp::WriteDone);

        // The payload actually landed in secondary memory
        assert!(afu.memory().is_known(0x4000));
    }

    #[test]
    fn test_address_range_split_mmio_vs_memory() {
        let mut afu = controller();
        bring_up(&mut afu, 0);

        // Secondary-space read of untouched memory answers zeroes
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.command = Some(HostCommandRecord {
                op: HostCmdOp::PartialRead,
                tag: 0x40,
                address: 0x8000,
                size: 8,
                data: None,
            });
        }));
        afu.step().unwrap();
        let resp = afu.transport().sent_responses.last().unwrap();
        assert_eq!(resp.op, AfuRespOp::ReadDone);
        assert_eq!(resp.data.as_deref(), Some(&[0u8; 8][..]));

        // MMIO read of the status address we programmed during bring-up
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.command = Some(HostCommandRecord {
                op: HostCmdOp::PartialRead,
                tag: 0x41,
                address: MMIO_BASE + ctx::STATUS_ADDRESS,
                size: 8,
                data: None,
            });
        }));
        afu.step().unwrap();
        let resp = afu.transport().sent_responses.last().unwrap();
        assert_eq!(resp.op, AfuRespOp::ReadDone);
        assert_eq!(
            resp.data.as_deref(),
            Some(&0x9000u64.to_le_bytes()[..])
        );
    }

    #[test]
    fn test_malformed_config_offset_answers_failed() {
        let mut afu = controller();
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.initial_credits = Some(InitialCredits { cmd: 4, data: 4 });
            b.config = Some(HostCommandRecord {
                op: HostCmdOp::ConfigRead,
                tag: 0x11,
                address: 0xFF8 + 0x1000, // far out of range
                size: 8,
                data: None,
            });
        }));
        afu.step().unwrap();
        let resp = afu.transport().sent_config_responses.last().unwrap();
        assert_eq!(resp.op, AfuRespOp::ReadFailed);
    }

    #[test]
    fn test_interrupt_retry_resends_then_completes() {
        let mut afu = controller();
        bring_up(&mut afu, INTERRUPT_ONCE);
        afu.step().unwrap();

        let intr = afu
            .transport()
            .sent_commands
            .iter()
            .find(|c| c.op == AfuCmdOp::Interrupt)
            .cloned()
            .unwrap();

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::InterruptResp,
                tag: intr.tag,
                code: ResultCode::Retry,
                dlength: 0,
            });
        }));
        afu.step().unwrap();
        // The resend went out on the cycle after the retry, unchanged
        let resent = afu.transport().sent_commands.last().unwrap();
        assert_eq!(*resent, intr);

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::InterruptResp,
                tag: intr.tag,
                code: ResultCode::Done,
                dlength: 0,
            });
        }));
        afu.step().unwrap();
        assert!(!afu.broker().tag_in_use(intr.tag));
        assert!(afu.pool(0).unwrap().all_completed());
    }

    #[test]
    fn test_interrupt_pending_defers_indefinitely() {
        let mut afu = controller();
        bring_up(&mut afu, INTERRUPT_ONCE);
        afu.step().unwrap();
        let intr = afu
            .transport()
            .sent_commands
            .iter()
            .find(|c| c.op == AfuCmdOp::Interrupt)
            .cloned()
            .unwrap();
        let sent_before = afu.transport().sent_commands.len();

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::InterruptResp,
                tag: intr.tag,
                code: ResultCode::Pending,
                dlength: 0,
            });
        }));
        afu.step().unwrap();
        for _ in 0..5 {
            afu.step().unwrap();
        }
        // No resend, no completion: the tag stays held
        assert_eq!(afu.transport().sent_commands.len(), sent_before);
        assert!(afu.broker().tag_in_use(intr.tag));

        // Follow-up transition completes it
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::InterruptResp,
                tag: intr.tag,
                code: ResultCode::Done,
                dlength: 0,
            });
        }));
        afu.step().unwrap();
        assert!(!afu.broker().tag_in_use(intr.tag));
    }

    #[test]
    fn test_external_reset_drains_to_halt() {
        let mut afu = controller();
        bring_up(&mut afu, INTERRUPT_ONCE);
        afu.step().unwrap();
        let intr = afu
            .transport()
            .sent_commands
            .iter()
            .find(|c| c.op == AfuCmdOp::Interrupt)
            .cloned()
            .unwrap();
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::InterruptResp,
                tag: intr.tag,
                code: ResultCode::Done,
                dlength: 0,
            });
        }));
        afu.step().unwrap();
        // Status flush for the completed context goes out and completes
        afu.step().unwrap();
        let flush = afu.transport().sent_commands.last().cloned().unwrap();
        assert_eq!(flush.op, AfuCmdOp::Store);
        assert_eq!(flush.address, 0x9000);
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::WriteResponse,
                tag: flush.tag,
                code: ResultCode::Done,
                dlength: 0,
            });
        }));
        afu.step().unwrap();

        // Everything completed; the reset event drains straight to Halt
        afu.transport_mut().inbound.push_back(batch_with(|b| b.reset = true));
        afu.step().unwrap();
        assert_eq!(afu.state(), AfuState::Halt);
    }

    #[test]
    fn test_explicit_reset_clears_and_returns_ready() {
        let mut afu = controller();
        bring_up(&mut afu, LOAD_ALWAYS);
        afu.step().unwrap();
        assert!(afu.broker().tags_in_use() > 0);

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.config = Some(config_write(reg::AFU_CONTROL, control::ENABLE | control::RESET));
        }));
        afu.step().unwrap();
        afu.step().unwrap();
        assert_eq!(afu.state(), AfuState::Ready);
        assert_eq!(afu.broker().tags_in_use(), 0);
        assert!(afu.pool(0).unwrap().all_completed());
        // Link capacity survives the reset
        assert!(afu.broker().credits(CreditChannel::Command) > 0);
    }

    #[test]
    fn test_issue_respects_command_credit() {
        let mut afu = controller();
        // Only one command credit on the link
        let slot0 = ctx::MACHINE_CONFIG_BASE;
        for batch in [
            batch_with(|b| b.initial_credits = Some(InitialCredits { cmd: 1, data: 4 })),
            batch_with(|b| b.config = Some(config_write(reg::AFU_CONTROL, control::ENABLE))),
            batch_with(|b| b.command = Some(mmio_write(slot0 + 8, 0x1000))),
            batch_with(|b| b.command = Some(mmio_write(slot0 + 16, 0x1000))),
            batch_with(|b| b.command = Some(mmio_write(slot0, LOAD_ALWAYS))),
            batch_with(|b| b.command = Some(mmio_write(ctx::CONTEXT_CONTROL, ctx::GO))),
        ] {
            afu.transport_mut().inbound.push_back(batch);
            afu.step().unwrap();
        }
        // The attach consumed the only command credit; nothing else can go
        // out until the partner returns it.
        let sent = afu.transport().sent_commands.len();
        assert_eq!(sent, 1);
        afu.step().unwrap();
        assert_eq!(afu.transport().sent_commands.len(), sent);

        afu.transport_mut()
            .inbound
            .push_back(batch_with(|b| b.credits = CreditReturn { command: true, ..Default::default() }));
        afu.step().unwrap();
        assert_eq!(afu.transport().sent_commands.len(), sent + 1);
        assert_eq!(afu.transport().sent_commands.last().unwrap().op, AfuCmdOp::Load);
    }

    #[test]
    fn test_straggler_events_after_reset_are_dropped() {
        let mut afu = controller();
        bring_up(&mut afu, LOAD_ALWAYS);
        afu.step().unwrap();
        let load = afu
            .transport()
            .sent_commands
            .iter()
            .find(|c| c.op == AfuCmdOp::Load)
            .cloned()
            .unwrap();
        assert!(afu.broker().tag_in_use(load.tag));

        // Explicit reset while the load's response is still on the wire
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.config = Some(config_write(reg::AFU_CONTROL, control::ENABLE | control::RESET));
        }));
        afu.step().unwrap();
        afu.step().unwrap();
        assert_eq!(afu.state(), AfuState::Ready);
        assert_eq!(afu.broker().tags_in_use(), 0);

        // The pre-reset response arrives late, together with a credit flag
        // for a pre-reset send; both are dropped, not fatal
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.credits = CreditReturn { command: true, ..Default::default() };
            b.response = Some(ResponseRecord {
                op: HostRespOp::ReadResponse,
                tag: load.tag,
                code: ResultCode::Done,
                dlength: load.size,
            });
        }));
        afu.step().unwrap();
        // No pull went out for the dropped response
        assert!(afu.transport().response_pulls.is_empty());

        // A straggler data beat is equally harmless
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response_data = Some(DataBeat {
                tag: load.tag,
                data: vec![0u8; load.size as usize],
                bad: false,
            });
        }));
        afu.step().unwrap();
        assert!(!afu.broker().tag_in_use(load.tag));
    }

    #[test]
    fn test_retry_resends_owning_machine_not_last_served() {
        let mut afu = controller();
        // Slot 0: one-shot interrupt; slot 1: always-on loads
        let slot0 = ctx::MACHINE_CONFIG_BASE;
        let slot1 = slot0 + ctx::MACHINE_CONFIG_STRIDE;
        for batch in [
            batch_with(|b| b.initial_credits = Some(InitialCredits { cmd: 8, data: 8 })),
            batch_with(|b| b.config = Some(config_write(reg::AFU_CONTROL, control::ENABLE))),
            batch_with(|b| b.command = Some(mmio_write(slot0, INTERRUPT_ONCE))),
            batch_with(|b| b.command = Some(mmio_write(slot1 + 8, 0x1000))),
            batch_with(|b| b.command = Some(mmio_write(slot1 + 16, 0x1000))),
            batch_with(|b| b.command = Some(mmio_write(slot1, LOAD_ALWAYS))),
            batch_with(|b| b.command = Some(mmio_write(ctx::CONTEXT_CONTROL, ctx::GO))),
        ] {
            afu.transport_mut().inbound.push_back(batch);
            afu.step().unwrap();
        }
        // Interrupt issues first, then the load; both stay in flight
        afu.step().unwrap();
        afu.step().unwrap();
        let intr = afu
            .transport()
            .sent_commands
            .iter()
            .find(|c| c.op == AfuCmdOp::Interrupt)
            .cloned()
            .unwrap();
        let load = afu
            .transport()
            .sent_commands
            .iter()
            .find(|c| c.op == AfuCmdOp::Load)
            .cloned()
            .unwrap();

        // The retry lands after another machine was served; the resend
        // must carry the retried command, not the last-served one
        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::InterruptResp,
                tag: intr.tag,
                code: ResultCode::Retry,
                dlength: 0,
            });
        }));
        afu.step().unwrap();
        let resent = afu.transport().sent_commands.last().unwrap();
        assert_eq!(*resent, intr);
        assert!(afu.broker().tag_in_use(load.tag));

        afu.transport_mut().inbound.push_back(batch_with(|b| {
            b.response = Some(ResponseRecord {
                op: HostRespOp::InterruptResp,
                tag: intr.tag,
                code: ResultCode::Done,
                dlength: 0,
            });
        }));
        afu.step().unwrap();
        assert!(!afu.broker().tag_in_use(intr.tag));
        assert!(afu.broker().tag_in_use(load.tag));
    }

    #[test]
    fn test_transport_failure_is_fatal() {
        let mut afu = controller();
        afu.transport_mut().fail = true;
        assert!(afu.step().is_err());
    }
}
