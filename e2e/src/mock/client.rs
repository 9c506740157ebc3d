use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use crate::BUFFER_SIZE;

/// how long a mock client waits for the proxy
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A browser talking to the proxy, with blocking sockets
pub struct Client {
    pub name: String,
    pub address: SocketAddr,
    pub stream: Option<TcpStream>,
    pub request: Vec<u8>,
    pub requests_sent: usize,
    pub responses_received: usize,
}

impl Client {
    pub fn new<S: Into<String>, R: Into<Vec<u8>>>(name: S, address: SocketAddr, request: R) -> Self {
        Self {
            name: name.into(),
            address,
            stream: None,
            request: request.into(),
            requests_sent: 0,
            responses_received: 0,
        }
    }

    pub fn connect(&mut self) -> bool {
        match TcpStream::connect(self.address) {
            Ok(stream) => {
                if let Err(error) = stream.set_read_timeout(Some(CLIENT_TIMEOUT)) {
                    warn!("{}: could not set read timeout: {}", self.name, error);
                    return false;
                }
                let _ = stream.set_nodelay(true);
                self.stream = Some(stream);
                true
            }
            Err(error) => {
                warn!("{}: could not connect to {}: {}", self.name, self.address, error);
                false
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    pub fn send(&mut self) -> Option<usize> {
        let request = self.request.clone();
        self.send_bytes(&request)
    }

    pub fn send_bytes(&mut self, data: &[u8]) -> Option<usize> {
        let stream = self.stream.as_mut()?;
        match stream.write_all(data) {
            Ok(()) => {
                self.requests_sent += 1;
                Some(data.len())
            }
            Err(error) => {
                debug!("{}: could not send: {}", self.name, error);
                None
            }
        }
    }

    /// one read, `None` on timeout or once the proxy closed the connection
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        let stream = self.stream.as_mut()?;
        let mut buf = [0u8; BUFFER_SIZE];
        match stream.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                self.responses_received += 1;
                Some(buf[..n].to_vec())
            }
            Err(error) => {
                debug!("{}: could not receive: {}", self.name, error);
                None
            }
        }
    }

    pub fn receive_exact(&mut self, len: usize) -> Option<Vec<u8>> {
        let stream = self.stream.as_mut()?;
        let mut buf = vec![0u8; len];
        match stream.read_exact(&mut buf) {
            Ok(()) => {
                self.responses_received += 1;
                Some(buf)
            }
            Err(error) => {
                debug!("{}: could not receive {} bytes: {}", self.name, len, error);
                None
            }
        }
    }

    /// everything until the proxy closes the connection
    pub fn receive_until_close(&mut self) -> Option<Vec<u8>> {
        let stream = self.stream.as_mut()?;
        let mut received = Vec::new();
        match stream.read_to_end(&mut received) {
            Ok(_) => {
                self.responses_received += 1;
                Some(received)
            }
            Err(error) => {
                debug!("{}: connection did not close: {}", self.name, error);
                None
            }
        }
    }

    /// true once the proxy closed the connection, without sending anything
    pub fn is_closed(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };
        let mut buf = [0u8; BUFFER_SIZE];
        match stream.read(&mut buf) {
            Ok(0) => true,
            Ok(n) => {
                debug!("{}: unexpected {} bytes", self.name, n);
                false
            }
            Err(error) => matches!(
                error.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
            ),
        }
    }
}
