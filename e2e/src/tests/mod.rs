mod tests;

use std::net::SocketAddr;

use burrow_command::config::Config;

use crate::{
    burrow::Proxy,
    mock::{
        aggregator::{Aggregator, SimpleAggregator},
        async_backend::{BackendHandle, RequestHandler},
    },
};

#[derive(Debug, PartialEq, Eq)]
pub enum State {
    Success,
    Fail,
}

/// Runs `test` until it fails, at most `tries` times
pub fn repeat_until_error_or<F>(tries: usize, message: &str, test: F) -> State
where
    F: Fn() -> State,
{
    println!("{message}");
    for i in 0..tries {
        let state = test();
        if state != State::Success {
            println!("------------------------------------------------------------------");
            println!("attempt {}/{} failed: {}", i + 1, tries, message);
            return state;
        }
    }
    State::Success
}

pub fn local_address() -> SocketAddr {
    "127.0.0.1:0".parse().expect("could not parse local address")
}

/// an address nothing listens on
pub fn closed_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind(local_address()).expect("could not bind");
    listener.local_addr().expect("could not get local address")
}

pub fn spawn_backend<S: Into<String>>(
    name: S,
    handler: RequestHandler<SimpleAggregator>,
) -> BackendHandle<SimpleAggregator> {
    BackendHandle::spawn_detached_backend(name, local_address(), SimpleAggregator::new(), handler)
}

/// a proxy and one target behind it
pub fn setup_test<S: Into<String>>(
    name: S,
    config: Config,
    handler: RequestHandler<SimpleAggregator>,
) -> (Proxy, BackendHandle<SimpleAggregator>) {
    let name = name.into();
    let backend = spawn_backend(format!("{name}_BACKEND"), handler);
    let proxy = Proxy::start(name, config).expect("could not start the proxy");
    (proxy, backend)
}
