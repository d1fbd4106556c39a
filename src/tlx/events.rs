//! Wire-facing event records.
//!
//! The transport delivers one [`EventBatch`] per poll. A batch carries at
//! most one inbound record per category (command, config command, response,
//! data beat) plus the four credit-return flags. The exact bit layout of the
//! records on the link is the transport's concern; the AFU model only sees
//! these decoded structs.

/// Opcodes for commands the AFU sends toward the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AfuCmdOp {
    /// Attach handshake: claim an address-translation tag for a context.
    AssignActag = 0x50,
    /// Read from host memory.
    Load = 0x10,
    /// Write to host memory.
    Store = 0x20,
    /// Raise an interrupt toward the host.
    Interrupt = 0x58,
}

/// Opcodes for commands the host sends toward the AFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostCmdOp {
    /// Configuration-space register read.
    ConfigRead = 0xE0,
    /// Configuration-space register write.
    ConfigWrite = 0xE1,
    /// Partial (single-beat, <= 64 byte) memory read.
    PartialRead = 0x28,
    /// Partial (single-beat, <= 64 byte) memory write; payload rides inline.
    PartialWrite = 0x30,
    /// Full block memory read.
    ReadBlock = 0x21,
    /// Full block memory write; payload is pulled in separate beats.
    WriteBlock = 0x81,
}

impl HostCmdOp {
    /// True for the configuration-space opcodes.
    #[inline]
    pub fn is_config(self) -> bool {
        matches!(self, HostCmdOp::ConfigRead | HostCmdOp::ConfigWrite)
    }

    /// True for the read-class opcodes.
    #[inline]
    pub fn is_read(self) -> bool {
        matches!(self, HostCmdOp::ConfigRead | HostCmdOp::PartialRead | HostCmdOp::ReadBlock)
    }
}

/// Opcodes for responses the host sends back for AFU commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostRespOp {
    /// Address-touch acknowledged; no data follows.
    TouchResp = 0x02,
    /// Read completed; data beats follow on request.
    ReadResponse = 0x04,
    /// Read failed.
    ReadFailed = 0x05,
    /// Write acknowledged.
    WriteResponse = 0x08,
    /// Write failed.
    WriteFailed = 0x09,
    /// Interrupt outcome; see [`ResultCode`].
    InterruptResp = 0x0C,
}

/// Opcodes for responses the AFU sends back for host commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AfuRespOp {
    /// Read completed; data rides with the response.
    ReadDone = 0x01,
    /// Read failed.
    ReadFailed = 0x02,
    /// Write applied and acknowledged.
    WriteDone = 0x04,
    /// Write failed.
    WriteFailed = 0x05,
}

/// Result code carried by a host response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// Command completed.
    Done = 0x0,
    /// Partner asks for a single retry of the same command.
    Retry = 0x2,
    /// Interrupt accepted but held pending; a follow-up response arrives
    /// later on the same tag.
    Pending = 0x4,
    /// Data integrity error on the returned payload.
    DataError = 0x8,
    /// Command rejected outright.
    Failed = 0xE,
}

impl ResultCode {
    /// Decode a raw result-code nibble; unknown codes map to `Failed`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x0 => ResultCode::Done,
            0x2 => ResultCode::Retry,
            0x4 => ResultCode::Pending,
            0x8 => ResultCode::DataError,
            _ => ResultCode::Failed,
        }
    }
}

/// A command the AFU puts on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub op: AfuCmdOp,
    /// Correlation tag; owned by the broker from issue to release.
    pub tag: u8,
    pub address: u64,
    /// Transfer size in bytes (0 for tag-only commands).
    pub size: u32,
    /// Odd parity over opcode, tag and address.
    pub parity: bool,
    /// Store payload; `None` for reads and tag-only commands.
    pub data: Option<Vec<u8>>,
}

/// A command received from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommandRecord {
    pub op: HostCmdOp,
    /// Host-side correlation tag, echoed back in our response.
    pub tag: u8,
    pub address: u64,
    pub size: u32,
    /// Inline payload for partial writes and config writes.
    pub data: Option<Vec<u8>>,
}

/// A response received from the host for one of our commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseRecord {
    pub op: HostRespOp,
    /// Tag of the command being answered.
    pub tag: u8,
    pub code: ResultCode,
    /// Length class of the data that follows (read responses only).
    pub dlength: u32,
}

/// A response the AFU sends back for a host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub op: AfuRespOp,
    /// Host tag being answered.
    pub tag: u8,
    /// Read payload; `None` for acknowledgements and failures.
    pub data: Option<Vec<u8>>,
}

/// One payload beat pulled from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBeat {
    /// Tag the beat belongs to.
    pub tag: u8,
    pub data: Vec<u8>,
    /// Set when the beat arrived marked bad (integrity error).
    pub bad: bool,
}

/// One-time initial credit announcement from the link partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialCredits {
    /// Capacity of the command and command-data channels.
    pub cmd: u32,
    /// Capacity of the response and response-data channels.
    pub data: u32,
}

/// Credit-return flags observed this cycle, one per outbound channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditReturn {
    pub command: bool,
    pub response: bool,
    pub command_data: bool,
    pub response_data: bool,
}

/// Everything the transport delivered for one cycle.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    /// Present exactly once per link bring-up.
    pub initial_credits: Option<InitialCredits>,
    pub credits: CreditReturn,
    /// Pending config-space operation.
    pub config: Option<HostCommandRecord>,
    /// Pending generic (memory) command.
    pub command: Option<HostCommandRecord>,
    /// Pending response for one of our commands.
    pub response: Option<ResponseRecord>,
    /// Read-response payload beat we previously requested.
    pub response_data: Option<DataBeat>,
    /// Write-command payload beat we previously requested.
    pub command_data: Option<DataBeat>,
    /// Externally triggered reset/error event.
    pub reset: bool,
}

impl EventBatch {
    /// True when the batch carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.initial_credits.is_none()
            && self.credits == CreditReturn::default()
            && self.config.is_none()
            && self.command.is_none()
            && self.response.is_none()
            && self.response_data.is_none()
            && self.command_data.is_none()
            && !self.reset
    }
}
