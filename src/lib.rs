//! tlx-afu-sim library
//!
//! Software model of a TLX-attached accelerator function unit: an
//! event-driven protocol engine with per-context pools of command
//! generators, a tag/credit broker enforcing link flow control, and a
//! scripted host model for driving self-test runs.

pub mod afu;
pub mod config;
pub mod tlx;

pub use afu::{AfuController, AfuState, AfuStats};
pub use config::Config;
pub use tlx::{HostAction, ScriptedHost, Transport};
