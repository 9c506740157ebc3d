//! The accept loop
//!
//! The [`Server`] owns the listening socket, a `signalfd` for SIGINT,
//! SIGQUIT and SIGHUP, the resolver, and the worker pool. Its thread does
//! nothing but accept connections and hand them round-robin to the workers.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use mio::{
    net::{TcpListener, TcpStream},
    unix::SourceFd,
    Events, Interest, Poll, Token, Waker,
};
use nix::sys::{
    signal::{SigSet, Signal},
    signalfd::{SfdFlags, SignalFd},
};
use socket2::{Domain, Protocol, Socket, Type};

use burrow_command::config::{Config, ConfigError};

use crate::{
    fatal,
    resolver::{ResolveError, Resolver},
    worker::{Worker, WorkerError},
};

const LISTENER: Token = Token(0);
const SIGNALS: Token = Token(1);
const WAKER: Token = Token(2);

const LISTEN_BACKLOG: i32 = 1024;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("could not bind to {address}: {error}")]
    Bind { address: SocketAddr, error: io::Error },
    #[error("could not set up the signal channel: {0}")]
    Signal(nix::Error),
    #[error("could not create the event loop: {0}")]
    Poll(io::Error),
    #[error("could not register {0}: {1}")]
    Register(&'static str, io::Error),
    #[error("could not start the resolver: {0}")]
    Resolver(#[from] ResolveError),
    #[error("could not create worker {index}: {error}")]
    Worker { index: usize, error: WorkerError },
    #[error("could not wait for events: {0}")]
    Wait(io::Error),
}

/// Stops a running [`Server`] from another thread
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(error) = self.waker.wake() {
            error!("SERVER\tcould not wake the accept loop: {}", error);
        }
    }
}

/// Hands out worker indexes in turn. The counter moves even when the
/// chosen worker refuses the connection.
#[derive(Debug)]
pub struct RoundRobin {
    next: usize,
    len: usize,
}

impl RoundRobin {
    pub fn new(len: usize) -> RoundRobin {
        RoundRobin { next: 0, len }
    }

    pub fn next_index(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let index = self.next;
        self.next = (self.next + 1) % self.len;
        Some(index)
    }
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    signals: SignalFd,
    poll: Poll,
    handle: ServerHandle,
    resolver: Option<Resolver>,
    workers: Vec<Worker>,
    round_robin: RoundRobin,
}

impl Server {
    /// Binds, arms the signal channel, then starts the resolver and the
    /// workers. Signals are blocked on the calling thread before any thread
    /// is spawned, so only the signal channel sees them.
    pub fn start(config: Config) -> Result<Server, ServerError> {
        config.validate()?;
        let address = config.listen_address()?;

        let mut listener = bind(address).map_err(|error| ServerError::Bind { address, error })?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| ServerError::Bind { address, error })?;

        let signals = signal_channel().map_err(ServerError::Signal)?;

        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|error| ServerError::Register("the listener", error))?;
        poll.registry()
            .register(
                &mut SourceFd(&signals.as_raw_fd()),
                SIGNALS,
                Interest::READABLE,
            )
            .map_err(|error| ServerError::Register("the signal channel", error))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER)
                .map_err(|error| ServerError::Register("the waker", error))?,
        );

        let resolver = Resolver::from_config(&config.resolver)?;

        let count = if config.workers == 0 {
            num_cpus::get()
        } else {
            config.workers
        };
        let workers = match start_workers(count, |index| {
            Worker::create(index, resolver.handle(), &config)
        }) {
            Ok(workers) => workers,
            Err(error) => {
                resolver.shutdown();
                return Err(error);
            }
        };

        info!(
            "SERVER\tlistening on {} with {} workers",
            local_addr,
            workers.len()
        );

        Ok(Server {
            listener,
            local_addr,
            signals,
            poll,
            handle: ServerHandle {
                stop: Arc::new(AtomicBool::new(false)),
                waker,
            },
            resolver: Some(resolver),
            round_robin: RoundRobin::new(workers.len()),
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accepts connections until SIGINT, SIGQUIT or [`ServerHandle::stop`],
    /// then destroys the workers and the resolver
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(16);
        let mut result = Ok(());

        'main: while !self.handle.stop.load(Ordering::Acquire) {
            if let Err(error) = self.poll.poll(&mut events, None) {
                if error.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("SERVER\tcould not wait for events: {}", error);
                result = Err(ServerError::Wait(error));
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    SIGNALS => {
                        if !self.read_signals() {
                            break 'main;
                        }
                    }
                    WAKER => {}
                    token => warn!("SERVER\tevent for unknown token {:?}", token),
                }
            }
        }

        self.shutdown();
        result
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    debug!("SERVER\taccepted connection from {}", address);
                    incr!("server.accepted");
                    self.dispatch(stream);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!("SERVER\tcould not accept connection: {}", error);
                    incr!("server.accept_error");
                    return;
                }
            }
        }
    }

    /// a refused connection is closed, there is no failover
    fn dispatch(&mut self, stream: TcpStream) {
        let Some(index) = self.round_robin.next_index() else {
            return;
        };
        let Some(worker) = self.workers.get(index) else {
            return;
        };

        if let Err(error) = worker.add_client(stream) {
            error!("SERVER\tworker {} refused a connection: {}", index, error);
            incr!("server.dispatch_error");
        }
    }

    /// `false` once the server must stop
    fn read_signals(&mut self) -> bool {
        loop {
            match self.signals.read_signal() {
                Ok(Some(info)) => match Signal::try_from(info.ssi_signo as i32) {
                    Ok(signal @ (Signal::SIGINT | Signal::SIGQUIT)) => {
                        info!("SERVER\treceived {:?}, stopping", signal);
                        return false;
                    }
                    Ok(Signal::SIGHUP) => {
                        info!("SERVER\treceived SIGHUP, nothing to reload");
                    }
                    other => fatal(&format!(
                        "SERVER\treceived unexpected signal {:?}",
                        other
                    )),
                },
                Ok(None) => return true,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(error) => {
                    error!("SERVER\tcould not read the signal channel: {}", error);
                    return true;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        info!("SERVER\tshutting down {} workers", self.workers.len());
        for mut worker in self.workers.drain(..) {
            match worker.destroy() {
                Some(report) => {
                    info!(
                        "SERVER\tworker {} stopped, {} clients closed",
                        report.index, report.drained
                    );
                    for (name, metric) in &report.metrics {
                        info!("SERVER\tworker {}\t{}: {}", report.index, name, metric);
                    }
                }
                None => warn!("SERVER\tworker {} left no report", worker.index),
            }
        }

        if let Some(resolver) = self.resolver.take() {
            resolver.shutdown();
        }
        info!("SERVER\tstopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.workers.is_empty() || self.resolver.is_some() {
            self.shutdown();
        }
    }
}

/// Creates `count` workers in order. If one fails, those already running
/// are destroyed before the error is returned.
fn start_workers<F>(count: usize, mut create: F) -> Result<Vec<Worker>, ServerError>
where
    F: FnMut(usize) -> Result<Worker, WorkerError>,
{
    let mut workers: Vec<Worker> = Vec::with_capacity(count);
    for index in 0..count {
        match create(index) {
            Ok(worker) => workers.push(worker),
            Err(error) => {
                error!("SERVER\tcould not create worker {}: {}", index, error);
                for mut worker in workers.drain(..) {
                    worker.destroy();
                }
                return Err(ServerError::Worker { index, error });
            }
        }
    }
    Ok(workers)
}

fn bind(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn signal_channel() -> nix::Result<SignalFd> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGQUIT);
    mask.add(Signal::SIGHUP);
    mask.thread_block()?;
    SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
}
