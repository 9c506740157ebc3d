//! Worker threads
//!
//! A [`Worker`] is the server-side handle of one event loop thread. New
//! connections are passed through a channel and the loop is woken through
//! its mio [`Waker`]; resolver threads use the same path to deliver lookup
//! results.

pub mod event_loop;

use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use mio::{net::TcpStream, Poll, Token, Waker};

use burrow_command::config::Config;

use crate::{
    metrics::FilteredMetric,
    resolver::{ResolveError, ResolverHandle},
    slab::{ClientId, SlabError},
    worker::event_loop::EventLoop,
};

/// never produced by a client id, see `slab`
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// interval of the alive handshake polling
const START_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("could not create the event loop: {0}")]
    Poll(io::Error),
    #[error("could not create the waker: {0}")]
    Waker(io::Error),
    #[error("could not spawn the worker thread: {0}")]
    Spawn(io::Error),
    #[error("worker {0} did not start within {1:?}")]
    StartTimeout(usize, Duration),
    #[error("worker {0} is dead")]
    Dead(usize),
    #[error("could not register socket: {0}")]
    Register(io::Error),
    #[error(transparent)]
    Slab(#[from] SlabError),
}

pub enum WorkerMessage {
    NewClient(TcpStream),
    Resolved {
        client: ClientId,
        result: Result<Vec<SocketAddr>, ResolveError>,
    },
}

/// What a worker thread hands back when it ends
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub index: usize,
    /// clients still open when the loop stopped
    pub drained: usize,
    pub metrics: BTreeMap<String, FilteredMetric>,
}

pub struct Worker {
    pub index: usize,
    alive: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    sender: Sender<WorkerMessage>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<WorkerReport>>,
}

impl Worker {
    /// Starts the worker thread and waits until its loop runs
    pub fn create(
        index: usize,
        resolver: ResolverHandle,
        config: &Config,
    ) -> Result<Worker, WorkerError> {
        let poll = Poll::new().map_err(WorkerError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(WorkerError::Waker)?);
        let (sender, inbox) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop::new(
            index,
            poll,
            resolver,
            inbox,
            sender.clone(),
            waker.clone(),
            alive.clone(),
            stopping.clone(),
            config,
        );

        let thread = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || event_loop.run())
            .map_err(WorkerError::Spawn)?;

        let mut worker = Worker {
            index,
            alive,
            stopping,
            sender,
            waker,
            thread: Some(thread),
        };

        let deadline = Instant::now() + config.worker_start_timeout;
        while !worker.is_alive() {
            let finished = worker
                .thread
                .as_ref()
                .map_or(true, |thread| thread.is_finished());
            if finished {
                worker.destroy();
                return Err(WorkerError::Dead(index));
            }
            if Instant::now() >= deadline {
                worker.destroy();
                return Err(WorkerError::StartTimeout(
                    index,
                    config.worker_start_timeout,
                ));
            }
            thread::sleep(START_POLL_INTERVAL);
        }

        debug!("WORKER {}\tstarted", index);
        Ok(worker)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// Hands a new connection over. On failure the socket is closed.
    ///
    /// Once queued the connection belongs to the worker: if the wake fails,
    /// the loop still finds it within `event_timeout`.
    pub fn add_client(&self, stream: TcpStream) -> Result<(), WorkerError> {
        if !self.is_alive() {
            return Err(WorkerError::Dead(self.index));
        }
        self.sender
            .send(WorkerMessage::NewClient(stream))
            .map_err(|_| WorkerError::Dead(self.index))?;
        if let Err(error) = self.waker.wake() {
            warn!("WORKER {}	could not wake for a new client: {}", self.index, error);
            incr!("worker.wake_error");
        }
        Ok(())
    }

    /// Stops the loop, joins the thread and returns its report. Clients
    /// still open are closed.
    pub fn destroy(&mut self) -> Option<WorkerReport> {
        let thread = self.thread.take()?;

        self.stopping.store(true, Ordering::Release);
        if let Err(error) = self.waker.wake() {
            debug!("WORKER {}\tcould not wake for shutdown: {}", self.index, error);
        }

        match thread.join() {
            Ok(report) => Some(report),
            Err(_) => {
                error!("WORKER {}\tthread panicked", self.index);
                None
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        io::Read,
        net::{IpAddr, TcpListener},
    };

    use crate::resolver::{Lookup, Resolver};

    struct NoLookup;

    impl Lookup for NoLookup {
        fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
            Err(ResolveError::NoAddress(host.to_owned()))
        }
    }

    fn resolver() -> Resolver {
        Resolver::start(Box::new(NoLookup), &Config::default().resolver)
            .expect("could not start resolver")
    }

    fn config() -> Config {
        Config {
            event_timeout: Duration::from_millis(50),
            ..Config::default()
        }
    }

    /// the proxy side as a mio stream, and the remote side
    fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        remote
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (TcpStream::from_std(accepted), remote)
    }

    #[test]
    fn create_returns_a_running_worker() {
        let resolver = resolver();
        let mut worker = Worker::create(3, resolver.handle(), &config()).unwrap();
        assert!(worker.is_alive());

        let report = worker.destroy().expect("a report");
        assert_eq!(report.index, 3);
        assert_eq!(report.drained, 0);
        assert!(!worker.is_alive());
        // the thread is already joined
        assert!(worker.destroy().is_none());

        resolver.shutdown();
    }

    #[test]
    fn destroy_drains_open_clients() {
        let resolver = resolver();
        let mut worker = Worker::create(0, resolver.handle(), &config()).unwrap();

        let (stream, mut remote) = socket_pair();
        worker.add_client(stream).unwrap();

        // the client idles in HEADER until the worker stops
        thread::sleep(Duration::from_millis(200));

        let report = worker.destroy().expect("a report");
        assert_eq!(report.drained, 1);

        let mut received = Vec::new();
        remote.read_to_end(&mut received).unwrap();
        assert!(received.is_empty());

        resolver.shutdown();
    }

    #[test]
    fn dead_worker_refuses_clients() {
        let resolver = resolver();
        let mut worker = Worker::create(1, resolver.handle(), &config()).unwrap();
        worker.destroy();

        let (stream, mut remote) = socket_pair();
        assert!(matches!(worker.add_client(stream), Err(WorkerError::Dead(1))));

        // the refused socket is closed
        let mut received = Vec::new();
        remote.read_to_end(&mut received).unwrap();
        assert!(received.is_empty());

        resolver.shutdown();
    }
}
