//! Transport abstraction between the AFU model and its link partner.
//!
//! The controller only ever sees this trait: one event batch in per cycle,
//! decoded records out. The concrete wire layout, framing and link-level
//! timeouts all live behind the implementation. [`ScriptedHost`] provides an
//! in-process implementation for self-test runs and integration tests.
//!
//! [`ScriptedHost`]: super::script::ScriptedHost

use thiserror::Error;

use super::events::{CommandRecord, EventBatch, OutboundResponse};

/// Transport-level failures. All of these are fatal to the simulated device;
/// the controller shuts down in an orderly way when it sees one.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link partner went away.
    #[error("link closed by partner")]
    Closed,
    /// The link delivered something that could not be decoded.
    #[error("malformed record on the link: {0}")]
    Malformed(String),
    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-to-point link to the host model.
pub trait Transport {
    /// Poll for the events of one cycle. An empty batch is normal; an error
    /// is fatal.
    fn poll_events(&mut self) -> Result<EventBatch, TransportError>;

    /// Put an AFU command on the wire. The caller must already hold the
    /// command-channel credit (and the command-data credit when payload
    /// rides along).
    fn send_command(&mut self, cmd: &CommandRecord) -> Result<(), TransportError>;

    /// Answer a host memory command. The caller must already hold the
    /// response-channel credit (and the response-data credit when data
    /// rides along).
    fn send_response(&mut self, resp: &OutboundResponse) -> Result<(), TransportError>;

    /// Answer a host config-space command. Config completions ride the
    /// dedicated config channel and are not counted against the broker's
    /// credit pools.
    fn send_config_response(&mut self, resp: &OutboundResponse) -> Result<(), TransportError>;

    /// Request the payload beats of a read response we received earlier.
    /// The beats arrive in later batches as `response_data`.
    fn pull_response_data(&mut self, tag: u8, size: u32) -> Result<(), TransportError>;

    /// Request the payload beats of a multi-beat host write command.
    /// The beats arrive in later batches as `command_data`.
    fn pull_command_data(&mut self, tag: u8, size: u32) -> Result<(), TransportError>;
}
