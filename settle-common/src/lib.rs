//! Settle: bounded polling checkers for eventually consistent systems.
//!
//! Every checker evaluates a backend-specific condition repeatedly until it
//! holds or a time/attempt budget runs out, and reports a uniform result:
//!
//! - [`wait`]: HTTP and TCP readiness probes
//! - [`db_poll`]: parameterized SQL queries with row conditions
//! - [`broker`]: Kafka consume-until-match and acknowledged publish
//! - [`transform`]: path-based field extraction over decoded JSON
//!
//! The [`action`] module exposes all of them behind a single
//! `execute(cancel, config) -> OutputData` contract.

#![forbid(unsafe_code)]

pub mod action;
pub mod broker;
pub mod config;
pub mod db_poll;
pub mod error;
pub mod logging;
pub mod path;
pub mod poll;
pub mod redact;
pub mod transform;
pub mod wait;

pub use action::{Action, ActionRegistry, OutputData};
pub use config::{EnvError, EnvParser, Settings};
pub use error::{ActionError, CheckError, CheckFailure, ConfigError};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use poll::{Evaluation, PollOutcome, PollSpec, PollStatus, poll};
