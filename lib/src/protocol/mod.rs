//! Per-connection protocol: request parsing and the client state machine

#[macro_use]
pub mod client;
pub mod request;

use std::fmt;

pub use crate::protocol::{
    client::Client,
    request::{parse, ParsedRequest, RequestError, Target},
};

/// sent verbatim to the inbound socket once a tunnel is established
pub const CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// a proxied request, parsed and rewritten before forwarding
    Http,
    /// a `CONNECT` tunnel, relayed opaquely
    Https,
}

/// Transitions only go forward, in declaration order, possibly skipping
/// states. `Stop` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    Header,
    Resolver,
    Connect,
    Response,
    ForwardHeader,
    ForwardAll,
    Stop,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Http => write!(f, "HTTP"),
            ClientKind::Https => write!(f, "HTTPS"),
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Header => "HEADER",
            ClientState::Resolver => "RESOLVER",
            ClientState::Connect => "CONNECT",
            ClientState::Response => "RESPONSE",
            ClientState::ForwardHeader => "FORWARD_HEADER",
            ClientState::ForwardAll => "FORWARD_ALL",
            ClientState::Stop => "STOP",
        };
        f.write_str(name)
    }
}
