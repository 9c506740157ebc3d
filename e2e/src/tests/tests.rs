use std::{
    collections::BTreeMap,
    io::Write,
    net::{IpAddr, Ipv4Addr},
    thread,
};

use nix::sys::signal::Signal;
use serial_test::serial;

use burrow_command::config::ResolverMode;
use burrow_lib::protocol::CONNECT_RESPONSE;

use crate::{
    burrow::Proxy,
    http_utils::{connect_request, http_ok_response, http_request},
    mock::{async_backend::BackendHandle, client::Client},
    tests::{closed_address, repeat_until_error_or, setup_test, spawn_backend, State},
};

/// Connects through the proxy and checks the CONNECT answer
fn open_tunnel(client: &mut Client) -> bool {
    if !client.connect() || client.send().is_none() {
        return false;
    }
    match client.receive_exact(CONNECT_RESPONSE.len()) {
        Some(answer) if answer == CONNECT_RESPONSE => true,
        other => {
            println!("{}: unexpected CONNECT answer {:?}", client.name, other);
            false
        }
    }
}

/// sends each message and expects it back
fn echo_round_trips(client: &mut Client, count: usize) -> bool {
    for i in 0..count {
        let message = format!("ping{i}\n");
        if client.send_bytes(message.as_bytes()).is_none() {
            return false;
        }
        match client.receive_exact(message.len()) {
            Some(echo) if echo == message.as_bytes() => {}
            other => {
                println!("{}: unexpected echo {:?}", client.name, other);
                return false;
            }
        }
    }
    true
}

pub fn try_connect_tunnel(nb_clients: usize, nb_requests: usize) -> State {
    let (mut proxy, mut backend) = setup_test(
        "CONNECT",
        Proxy::empty_config(),
        BackendHandle::echo_handler(),
    );
    let authority = format!("example.com:{}", backend.address.port());

    let mut clients = (0..nb_clients)
        .map(|i| Client::new(format!("client{i}"), proxy.address, connect_request(&authority)))
        .collect::<Vec<_>>();

    let mut state = State::Success;
    for client in clients.iter_mut() {
        if !open_tunnel(client) {
            state = State::Fail;
        }
    }
    for client in clients.iter_mut() {
        if !echo_round_trips(client, nb_requests) {
            state = State::Fail;
        }
    }

    for client in clients.iter_mut() {
        client.disconnect();
    }
    proxy.soft_stop();
    if !proxy.wait_for_server_stop() {
        state = State::Fail;
    }

    let aggregator = backend.stop_and_get_aggregator();
    println!("{} aggregated: {:?}", backend.name, aggregator.map(|a| a.requests_received));
    state
}

pub fn try_http_forward() -> State {
    let (mut proxy, mut backend) = setup_test(
        "HTTP",
        Proxy::empty_config(),
        BackendHandle::http_handler("pong"),
    );
    let host = format!("example.com:{}", backend.address.port());

    let mut client = Client::new(
        "client",
        proxy.address,
        http_request("GET", format!("http://{host}/index.html?q=1"), &host),
    );
    if !client.connect() || client.send().is_none() {
        return State::Fail;
    }

    // the target closes after its answer, the proxy forwards it then closes
    let response = client.receive_until_close();
    proxy.soft_stop();
    let stopped = proxy.wait_for_server_stop();
    let Some(aggregator) = backend.stop_and_get_aggregator() else {
        return State::Fail;
    };

    let forwarded = String::from_utf8_lossy(&aggregator.received).to_string();
    println!("target received: {forwarded:?}");

    let expected_head = format!("GET /index.html?q=1 HTTP/1.1\r\nHost: {host}\r\nAccept: */*\r\n\r\n");
    if response.as_deref() == Some(http_ok_response("pong").as_bytes())
        && forwarded == expected_head
        && stopped
    {
        State::Success
    } else {
        println!("unexpected response {response:?}");
        State::Fail
    }
}

pub fn try_header_overflow() -> State {
    let config = Proxy::empty_config();
    let buffer_size = config.buffer_size;
    let (mut proxy, mut backend) = setup_test("OVERFLOW", config, BackendHandle::echo_handler());

    let mut garbage = b"GET http://example.com/".to_vec();
    garbage.extend(std::iter::repeat(b'a').take(buffer_size + 1024));

    let mut client = Client::new("client", proxy.address, garbage);
    if !client.connect() {
        return State::Fail;
    }
    // the proxy may close while this is still being written
    let _ = client.send();
    let closed = client.is_closed();

    proxy.soft_stop();
    let stopped = proxy.wait_for_server_stop();
    let requests = backend
        .stop_and_get_aggregator()
        .map_or(usize::MAX, |aggregator| aggregator.requests_received);

    if closed && stopped && requests == 0 {
        State::Success
    } else {
        println!("closed: {closed}, stopped: {stopped}, target requests: {requests}");
        State::Fail
    }
}

pub fn try_unresolvable_host() -> State {
    let mut config = Proxy::empty_config();
    // lookups fail right away, nothing listens there
    config.resolver.mode = ResolverMode::Doh;
    config.resolver.doh_url = format!("http://{}/dns-query", closed_address());

    let mut proxy = Proxy::start("UNRESOLVABLE", config).expect("could not start the proxy");

    let mut client = Client::new("client", proxy.address, connect_request("nowhere.test:443"));
    if !client.connect() || client.send().is_none() {
        return State::Fail;
    }
    let closed = client.is_closed();

    proxy.soft_stop();
    if closed && proxy.wait_for_server_stop() {
        State::Success
    } else {
        State::Fail
    }
}

pub fn try_doh_lookup() -> State {
    let mut target = spawn_backend("DOH_TARGET", BackendHandle::echo_handler());

    let mut table = BTreeMap::new();
    table.insert("tunnel.test".to_owned(), "127.0.0.1".to_owned());
    let mut doh = spawn_backend("DOH_SERVER", BackendHandle::doh_handler(table));

    let mut config = Proxy::empty_config();
    config.resolver.mode = ResolverMode::Doh;
    config.resolver.doh_url = format!("http://{}/dns-query", doh.address);
    let mut proxy = Proxy::start("DOH", config).expect("could not start the proxy");

    let authority = format!("tunnel.test:{}", target.address.port());
    let mut state = State::Success;

    // the second lookup is answered by the cache
    for i in 0..2 {
        let mut client = Client::new(format!("client{i}"), proxy.address, connect_request(&authority));
        if !open_tunnel(&mut client) || !echo_round_trips(&mut client, 3) {
            state = State::Fail;
        }
    }

    let mut unknown = Client::new("unknown", proxy.address, connect_request("missing.test:443"));
    if !unknown.connect() || unknown.send().is_none() || !unknown.is_closed() {
        state = State::Fail;
    }

    proxy.soft_stop();
    if !proxy.wait_for_server_stop() {
        state = State::Fail;
    }
    target.stop_and_get_aggregator();

    let queries = doh
        .stop_and_get_aggregator()
        .map_or(0, |aggregator| aggregator.requests_received);
    if queries != 2 {
        println!("expected 2 DNS queries, got {queries}");
        state = State::Fail;
    }
    state
}

pub fn try_connect_refused() -> State {
    let mut proxy =
        Proxy::start("REFUSED", Proxy::empty_config()).expect("could not start the proxy");

    let authority = format!("example.com:{}", closed_address().port());
    let mut client = Client::new("client", proxy.address, connect_request(&authority));
    if !client.connect() || client.send().is_none() {
        return State::Fail;
    }
    // no CONNECT answer, only a close
    let closed = client.is_closed();

    proxy.soft_stop();
    if closed && proxy.wait_for_server_stop() {
        State::Success
    } else {
        State::Fail
    }
}

pub fn try_address_fallback() -> State {
    let mut config = Proxy::empty_config();
    // the target only listens on 127.0.0.1
    config.resolver.hosts.insert(
        "fallback.test".to_owned(),
        vec![
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        ],
    );
    let (mut proxy, mut backend) = setup_test("FALLBACK", config, BackendHandle::echo_handler());

    let authority = format!("fallback.test:{}", backend.address.port());
    let mut client = Client::new("client", proxy.address, connect_request(&authority));
    let mut state = State::Success;
    if !open_tunnel(&mut client) || !echo_round_trips(&mut client, 2) {
        state = State::Fail;
    }

    client.disconnect();
    proxy.soft_stop();
    if !proxy.wait_for_server_stop() {
        state = State::Fail;
    }
    backend.stop_and_get_aggregator();
    state
}

pub fn try_large_relay(size: usize) -> State {
    let (mut proxy, mut backend) = setup_test(
        "LARGE",
        Proxy::empty_config(),
        BackendHandle::echo_handler(),
    );
    let authority = format!("example.com:{}", backend.address.port());

    let mut client = Client::new("client", proxy.address, connect_request(&authority));
    if !open_tunnel(&mut client) {
        return State::Fail;
    }

    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let Some(mut writer) = client
        .stream
        .as_ref()
        .and_then(|stream| stream.try_clone().ok())
    else {
        return State::Fail;
    };

    // written from another thread so the echo is drained while sending
    let sent = payload.clone();
    let sender = thread::spawn(move || writer.write_all(&sent).is_ok());

    let received = client.receive_exact(size);
    let written = sender.join().unwrap_or(false);

    client.disconnect();
    proxy.soft_stop();
    let stopped = proxy.wait_for_server_stop();
    backend.stop_and_get_aggregator();

    if written && stopped && received.as_deref() == Some(payload.as_slice()) {
        State::Success
    } else {
        println!(
            "written: {written}, stopped: {stopped}, received {} bytes",
            received.map_or(0, |r| r.len())
        );
        State::Fail
    }
}

pub fn try_target_close_drain(size: usize) -> State {
    let payload: Vec<u8> = (0..size).map(|i| (i % 13) as u8 + b'a').collect();
    let (mut proxy, mut backend) = setup_test(
        "DRAIN",
        Proxy::empty_config(),
        BackendHandle::send_and_close_handler(payload.clone()),
    );
    let authority = format!("example.com:{}", backend.address.port());

    let mut client = Client::new("client", proxy.address, connect_request(&authority));
    if !open_tunnel(&mut client) || client.send_bytes(b"go").is_none() {
        return State::Fail;
    }

    // everything the target sent arrives before the close
    let received = client.receive_until_close();

    proxy.soft_stop();
    let stopped = proxy.wait_for_server_stop();
    backend.stop_and_get_aggregator();

    if stopped && received.as_deref() == Some(payload.as_slice()) {
        State::Success
    } else {
        println!(
            "stopped: {stopped}, received {:?} bytes",
            received.map(|r| r.len())
        );
        State::Fail
    }
}

pub fn try_signal_stop(signal: Signal) -> State {
    let (mut proxy, mut backend) = setup_test(
        "SIGNAL_STOP",
        Proxy::empty_config(),
        BackendHandle::echo_handler(),
    );
    let authority = format!("example.com:{}", backend.address.port());

    let mut client = Client::new("client", proxy.address, connect_request(&authority));
    if !open_tunnel(&mut client) || !echo_round_trips(&mut client, 1) {
        return State::Fail;
    }

    if !proxy.send_signal(signal) {
        return State::Fail;
    }
    let stopped = proxy.wait_for_server_stop();
    // tunnels still open are closed at shutdown
    let closed = client.is_closed();
    backend.stop_and_get_aggregator();

    if stopped && closed {
        State::Success
    } else {
        println!("stopped: {stopped}, closed: {closed}");
        State::Fail
    }
}

pub fn try_sighup_is_ignored() -> State {
    let (mut proxy, mut backend) = setup_test(
        "SIGHUP",
        Proxy::empty_config(),
        BackendHandle::echo_handler(),
    );
    let authority = format!("example.com:{}", backend.address.port());

    if !proxy.send_signal(Signal::SIGHUP) {
        return State::Fail;
    }

    let mut client = Client::new("client", proxy.address, connect_request(&authority));
    let mut state = State::Success;
    if !open_tunnel(&mut client) || !echo_round_trips(&mut client, 2) {
        state = State::Fail;
    }

    client.disconnect();
    proxy.soft_stop();
    if !proxy.wait_for_server_stop() {
        state = State::Fail;
    }
    backend.stop_and_get_aggregator();
    state
}

#[test]
fn test_connect_tunnel() {
    assert_eq!(
        repeat_until_error_or(
            3,
            "CONNECT: tunnels relay bytes both ways",
            || try_connect_tunnel(1, 10)
        ),
        State::Success
    );
}

#[test]
fn test_many_tunnels() {
    assert_eq!(
        repeat_until_error_or(
            2,
            "CONNECT: concurrent tunnels spread over the workers",
            || try_connect_tunnel(10, 20)
        ),
        State::Success
    );
}

#[test]
fn test_http_forward() {
    assert_eq!(
        repeat_until_error_or(
            3,
            "HTTP: absolute-form requests are rewritten and forwarded",
            try_http_forward
        ),
        State::Success
    );
}

#[test]
fn test_header_overflow() {
    assert_eq!(
        repeat_until_error_or(
            3,
            "HEADER: a header larger than the buffer closes the client",
            try_header_overflow
        ),
        State::Success
    );
}

#[test]
fn test_unresolvable_host() {
    assert_eq!(
        repeat_until_error_or(
            2,
            "RESOLVER: a failed lookup closes the client",
            try_unresolvable_host
        ),
        State::Success
    );
}

#[test]
fn test_doh_lookup() {
    assert_eq!(
        repeat_until_error_or(
            1,
            "RESOLVER: pending DNS-over-HTTPS lookups resume their clients",
            try_doh_lookup
        ),
        State::Success
    );
}

#[test]
fn test_connect_refused() {
    assert_eq!(
        repeat_until_error_or(
            3,
            "CONNECT: a refused connection closes the client",
            try_connect_refused
        ),
        State::Success
    );
}

#[test]
fn test_address_fallback() {
    assert_eq!(
        repeat_until_error_or(
            2,
            "CONNECT: the next address is tried after a failure",
            try_address_fallback
        ),
        State::Success
    );
}

#[test]
fn test_large_relay() {
    assert_eq!(
        repeat_until_error_or(
            2,
            "FORWARD: a megabyte survives backpressure intact",
            || try_large_relay(1024 * 1024)
        ),
        State::Success
    );
}

#[test]
fn test_target_close_drain() {
    assert_eq!(
        repeat_until_error_or(
            3,
            "FORWARD: bytes sent before the target closes are delivered",
            || try_target_close_drain(256 * 1024)
        ),
        State::Success
    );
}

#[test]
#[serial]
fn test_sigquit_stops_the_proxy() {
    assert_eq!(
        repeat_until_error_or(
            1,
            "SIGNALS: SIGQUIT stops the proxy and closes tunnels",
            || try_signal_stop(Signal::SIGQUIT)
        ),
        State::Success
    );
}

#[test]
#[serial]
fn test_sigint_stops_the_proxy() {
    assert_eq!(
        repeat_until_error_or(
            1,
            "SIGNALS: SIGINT stops the proxy and closes tunnels",
            || try_signal_stop(Signal::SIGINT)
        ),
        State::Success
    );
}

#[test]
#[serial]
fn test_sighup_is_ignored() {
    assert_eq!(
        repeat_until_error_or(1, "SIGNALS: SIGHUP changes nothing", try_sighup_is_ignored),
        State::Success
    );
}
