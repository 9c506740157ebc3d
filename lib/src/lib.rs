//! # burrow engine
//!
//! A forward HTTP/HTTPS proxy built on readiness notification (`mio`).
//!
//! The [`Server`](server::Server) owns the listening socket and a signal
//! channel. Accepted connections are handed round-robin to a pool of
//! [`Worker`](worker::Worker)s, one thread each, which own their clients
//! exclusively: a client record never leaves the worker that accepted it,
//! and the outbound half of a tunnel is created in the same worker.
//!
//! A client goes through these states:
//!
//! ```plain
//! HEADER -> RESOLVER -> CONNECT -> RESPONSE (CONNECT requests) -> FORWARD_ALL -> STOP
//!                                \-> FORWARD_HEADER (other requests) -/
//! ```
//!
//! Host names are resolved by a shared [`Resolver`](resolver::Resolver)
//! running on its own threads, so a worker never blocks on the network.
//!
//! ```no_run
//! use burrow_command::config::Config;
//! use burrow_lib::server::Server;
//!
//! let server = Server::start(Config::default()).expect("could not start the proxy");
//! let handle = server.handle();
//! // handle.stop() from another thread, or SIGINT, ends run()
//! server.run().expect("proxy failed");
//! ```

#[macro_use]
extern crate log;

#[macro_use]
pub mod metrics;

pub mod buffer;
pub mod slab;
pub mod socket;

#[macro_use]
pub mod protocol;

pub mod resolver;
pub mod server;
pub mod worker;

pub use burrow_command;

pub use crate::{
    server::{Server, ServerError, ServerHandle},
    worker::{Worker, WorkerError, WorkerReport},
};

/// Internal invariant violation
///
/// Reached when the OS refuses to update or remove a registration the
/// engine made itself, or when a signal nobody asked for is delivered.
/// The state of the event loop can no longer be trusted, so this panics:
/// the process stops in production, a test can catch it.
#[track_caller]
pub fn fatal(context: &str) -> ! {
    error!("FATAL\t{}", context);
    panic!("burrow internal invariant violated: {context}");
}
