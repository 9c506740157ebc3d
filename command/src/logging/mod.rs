//! burrow logs
//!
//! The engine logs through the `log` facade. This module installs the
//! logger behind it: one line per record, written to standard output,
//! standard error or a file, prefixed with the time, the process id, a tag
//! naming the program and the emitting thread.

pub mod logs;

pub use crate::logging::logs::*;

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("invalid log target {0}: {1}")]
    InvalidLogTarget(String, &'static str),
    #[error("invalid log level {0}")]
    InvalidLogLevel(String),
    #[error("could not open log file {0}: {1}")]
    OpenFile(String, std::io::Error),
    #[error("a logger is already installed: {0}")]
    SetLogger(log::SetLoggerError),
}
