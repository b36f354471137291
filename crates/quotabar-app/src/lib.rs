//! Quotabar - AI-assistant quota tracking from the command line.
//!
//! This crate wires the core logic to the outside world:
//!
//! - [`poller`]: replays captured requests and reads local quota
//! - [`connect`]: drives login-window captures
//! - [`output`]: terminal rendering

pub mod connect;
pub mod output;
pub mod poller;

pub use connect::Connector;
pub use poller::{refresh_period, PollOutcome, Poller, ProviderReport};
