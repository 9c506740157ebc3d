//! Configuration, logging and shared types of the burrow proxy

pub mod config;
pub mod logging;
pub mod ready;
