use std::{
    collections::BTreeMap,
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use futures::channel::mpsc;

use crate::{
    http_utils::{doh_answer, http_ok_response},
    mock::aggregator::{Aggregator, SimpleAggregator},
    BUFFER_SIZE,
};

/// Handle to a detached thread where a target server runs
/// (a thin wrapper around a TcpListener)
pub struct BackendHandle<T> {
    pub name: String,
    /// the bound address, the port is chosen by the OS
    pub address: SocketAddr,
    /// Allows to stop the backend within the thread
    pub stop_tx: mpsc::Sender<()>,
    /// Receives data from the backend on the thread
    pub aggregator_rx: mpsc::Receiver<T>,
}

pub type RequestHandler<A> = Box<dyn Fn(&TcpStream, &str, A) -> A + Send + Sync>;

impl<A: Aggregator + Send + Sync + 'static> BackendHandle<A> {
    pub fn spawn_detached_backend<S: Into<String>>(
        name: S,
        address: SocketAddr,
        mut aggregator: A,
        handler: RequestHandler<A>,
    ) -> Self {
        let name = name.into();
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (mut aggregator_tx, aggregator_rx) = mpsc::channel::<A>(1);

        let listener = TcpListener::bind(address)
            .unwrap_or_else(|error| panic!("could not bind to {address}: {error}"));
        let address = listener
            .local_addr()
            .expect("could not get the backend address");
        listener
            .set_nonblocking(true)
            .expect("could not set nonblocking on listener");

        let mut clients = Vec::new();
        let thread_name = name.to_owned();

        // The backend runs on this detached thread:
        // - accepts tcp connections
        // - calls handler on each live connections
        // - monitors stop_rx to stop itself
        thread::spawn(move || {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        debug!("{thread_name}: new connection");
                        stream
                            .set_nonblocking(true)
                            .expect("could not set nonblocking on client");
                        clients.push(stream);
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                    Err(error) => warn!("{thread_name}: IO Error: {error:?}"),
                }
                for client in &clients {
                    aggregator = handler(client, &thread_name, aggregator);
                }
                match stop_rx.try_next() {
                    Ok(Some(_)) => break,
                    _ => thread::sleep(Duration::from_millis(1)),
                }
            }
            drop(listener);
            aggregator_tx
                .try_send(aggregator)
                .expect("could not send aggregator");
        });

        Self {
            name,
            address,
            stop_tx,
            aggregator_rx,
        }
    }

    pub fn stop_and_get_aggregator(&mut self) -> Option<A> {
        self.stop_tx.try_send(()).ok()?;
        loop {
            match self.aggregator_rx.try_next() {
                Ok(Some(aggregator)) => return Some(aggregator),
                Ok(None) => return None,
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

/// writes everything, waiting for the socket when needed
fn write_blocking(mut stream: &TcpStream, data: &[u8]) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let result = stream.write_all(data);
    stream.set_nonblocking(true)?;
    result
}

impl BackendHandle<SimpleAggregator> {
    /// This creates a callback that sends back every byte it receives
    pub fn echo_handler() -> RequestHandler<SimpleAggregator> {
        Box::new(move |mut stream, backend_name, mut aggregator| {
            let mut buf = [0u8; BUFFER_SIZE];
            match stream.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    aggregator.add_request();
                    aggregator.received.extend_from_slice(&buf[..n]);
                    match write_blocking(stream, &buf[..n]) {
                        Ok(()) => aggregator.add_response(),
                        Err(error) => warn!("{backend_name}: could not echo: {error}"),
                    }
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                Err(error) => debug!("{backend_name}: read error: {error}"),
            }
            aggregator
        })
    }

    /// This creates a callback that answers any request with an HTTP OK
    /// response carrying `content`, then closes its side
    pub fn http_handler<S: Into<String>>(content: S) -> RequestHandler<SimpleAggregator> {
        let content = content.into();
        Box::new(move |mut stream, backend_name, mut aggregator| {
            let mut buf = [0u8; BUFFER_SIZE];
            match stream.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    aggregator.add_request();
                    aggregator.received.extend_from_slice(&buf[..n]);
                    if let Err(error) = write_blocking(stream, http_ok_response(&content).as_bytes())
                    {
                        warn!("{backend_name}: could not write response: {error}");
                        return aggregator;
                    }
                    aggregator.add_response();
                    let _ = stream.shutdown(Shutdown::Write);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                Err(error) => debug!("{backend_name}: read error: {error}"),
            }
            aggregator
        })
    }

    /// This creates a callback that sends `payload` as soon as anything is
    /// received, then closes its side
    pub fn send_and_close_handler(payload: Vec<u8>) -> RequestHandler<SimpleAggregator> {
        Box::new(move |mut stream, backend_name, mut aggregator| {
            let mut buf = [0u8; BUFFER_SIZE];
            match stream.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    aggregator.add_request();
                    aggregator.received.extend_from_slice(&buf[..n]);
                    if let Err(error) = write_blocking(stream, &payload) {
                        warn!("{backend_name}: could not write payload: {error}");
                        return aggregator;
                    }
                    aggregator.add_response();
                    let _ = stream.shutdown(Shutdown::Write);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                Err(error) => debug!("{backend_name}: read error: {error}"),
            }
            aggregator
        })
    }

    /// This creates a callback answering DNS-over-HTTPS JSON queries from
    /// a fixed table, unknown names get NXDOMAIN
    pub fn doh_handler(table: BTreeMap<String, String>) -> RequestHandler<SimpleAggregator> {
        Box::new(move |mut stream, backend_name, mut aggregator| {
            let mut buf = [0u8; BUFFER_SIZE];
            match stream.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    aggregator.add_request();
                    aggregator.received.extend_from_slice(&buf[..n]);

                    let request = String::from_utf8_lossy(&buf[..n]);
                    let name = request
                        .split_whitespace()
                        .nth(1)
                        .and_then(|path| path.split("name=").nth(1))
                        .map(|name| name.split('&').next().unwrap_or_default().to_owned())
                        .unwrap_or_default();
                    debug!("{backend_name}: query for {name}");

                    let answer = doh_answer(&name, table.get(&name).map(String::as_str));
                    if let Err(error) = write_blocking(stream, http_ok_response(answer).as_bytes()) {
                        warn!("{backend_name}: could not write answer: {error}");
                        return aggregator;
                    }
                    aggregator.add_response();
                    let _ = stream.shutdown(Shutdown::Write);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                Err(error) => debug!("{backend_name}: read error: {error}"),
            }
            aggregator
        })
    }
}
