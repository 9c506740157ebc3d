//! Runs a real proxy on its own thread

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::mpsc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use nix::sys::{
    pthread::{pthread_kill, pthread_self, Pthread},
    signal::Signal,
};

use burrow_command::{
    config::{Config, ResolverMode},
    logging::setup_default_logging,
};
use burrow_lib::{Server, ServerError, ServerHandle};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

type Started = Result<(SocketAddr, ServerHandle, Pthread), ServerError>;

pub struct Proxy {
    pub name: String,
    pub address: SocketAddr,
    handle: ServerHandle,
    /// the thread signals must be sent to
    pthread: Pthread,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl Proxy {
    /// ephemeral port, two workers, system resolver, `example.com` is the
    /// loopback
    pub fn empty_config() -> Config {
        let mut config = Config {
            listen_port: 0,
            workers: 2,
            event_timeout: Duration::from_millis(50),
            linger_timeout: Duration::from_secs(1),
            ..Config::default()
        };
        config.resolver.mode = ResolverMode::System;
        config.resolver.hosts.insert(
            "example.com".to_owned(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        );
        config
    }

    /// Starts the server on a new thread. Its signal mask stays on that
    /// thread and the threads it spawns.
    pub fn start<S: Into<String>>(name: S, config: Config) -> Result<Proxy, ServerError> {
        setup_default_logging("info", "E2E");

        let name = name.into();
        let (started_tx, started_rx) = mpsc::channel::<Started>();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let server = match Server::start(config) {
                    Ok(server) => server,
                    Err(error) => {
                        let _ = started_tx.send(Err(error));
                        return Ok(());
                    }
                };
                let _ = started_tx.send(Ok((server.local_addr(), server.handle(), pthread_self())));
                server.run()
            })
            .expect("could not spawn the proxy thread");

        match started_rx.recv() {
            Ok(Ok((address, handle, pthread))) => {
                info!("{}: proxy listening on {}", name, address);
                Ok(Proxy {
                    name,
                    address,
                    handle,
                    pthread,
                    thread: Some(thread),
                })
            }
            Ok(Err(error)) => {
                let _ = thread.join();
                Err(error)
            }
            Err(_) => panic!("{name}: proxy thread died while starting"),
        }
    }

    pub fn soft_stop(&self) {
        self.handle.stop();
    }

    pub fn send_signal(&self, signal: Signal) -> bool {
        pthread_kill(self.pthread, signal).is_ok()
    }

    /// true if the server stopped cleanly in time
    pub fn wait_for_server_stop(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return false;
        };

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!("{}: proxy did not stop within {:?}", self.name, STOP_TIMEOUT);
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }

        match thread.join() {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                warn!("{}: proxy failed: {}", self.name, error);
                false
            }
            Err(_) => {
                warn!("{}: proxy thread panicked", self.name);
                false
            }
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.soft_stop();
            self.wait_for_server_stop();
        }
    }
}
