//! Command-file protocol.
//!
//! ```text
//! command.txt on the visible volume
//!     ↓ tokenizer + parser       (grammar only, no device state)
//!     ↓ dispatch::prepare        (authenticate, validate, resolve; no mutation)
//!     ↓ dispatch::apply          (inside the transport bracket:
//!                                 persist → complete → activate → remount)
//! outcome recorded on the volume: file deleted, or renamed to command-failed.txt
//! ```
//!
//! `CommandWatcher` drives the above from the periodic directory scan.

pub mod dispatch;
pub mod parser;
pub mod report;
pub mod tokenizer;
pub mod watcher;

pub use dispatch::{apply, prepare, Plan};
pub use parser::{parse, parse_bytes, Command, CommandKind, ParseError, RecordSpec, TableSpec};
pub use report::render;
pub use tokenizer::{Token, Tokenizer};
pub use watcher::{CommandWatcher, PollOutcome};

use crate::controller::ControllerError;
use crate::store::ValidationError;
use crate::volume::VolumeError;

/// Error types for command execution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Authentication failed")]
    Authentication,
    #[error("Unrecognized command keyword")]
    UnknownCommand,
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),
}
