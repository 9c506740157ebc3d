//! End-to-end tests: a real [`burrow_lib::Server`] between mock clients and
//! mock targets, all on the loopback interface

#[macro_use]
extern crate log;

pub mod burrow;
pub mod http_utils;
pub mod mock;

#[cfg(test)]
mod tests;

/// read size of the mock peers
pub const BUFFER_SIZE: usize = 4096;
