//! TLX link layer: wire records, the transport trait and the scripted host.
//!
//! "TLX" is the device-side half of the coherent-attach protocol this crate
//! models. The AFU core consumes decoded records and produces decoded
//! records; everything byte-exact about the link is kept behind the
//! [`Transport`] trait.

pub mod events;
pub mod script;
pub mod transport;

pub use events::{
    AfuCmdOp, AfuRespOp, CommandRecord, CreditReturn, DataBeat, EventBatch, HostCmdOp,
    HostCommandRecord, HostRespOp, InitialCredits, OutboundResponse, ResponseRecord, ResultCode,
};
pub use script::{HostAction, ScriptedHost};
pub use transport::{Transport, TransportError};
