//! The event loop of a worker thread, and the client state machine it drives
//!
//! Every readiness event is routed to the client owning the token, then
//! [`EventLoop::drive`] runs the handler of the client's current state.
//! Handlers return the next state; a new state is entered right away with
//! an empty readiness, so each handler also runs once on entry. `Stop`
//! removes the client.
//!
//! Relaying between the two halves of a tunnel is done by
//! [`EventLoop::pump`]: bytes read from one socket wait in that record's
//! buffer until the peer's socket accepts them. When a write would block,
//! the peer registers write interest and its write-ready event resumes the
//! transfer, reading included, since an edge-triggered source will not
//! signal the data it already has.

use std::{
    collections::VecDeque,
    io::ErrorKind,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender},
        Arc,
    },
    time::{Duration, Instant},
};

use mio::{event::Event, net::TcpStream, Events, Interest, Poll, Registry, Waker};
use rusty_ulid::Ulid;

use burrow_command::{
    config::{Config, MAX_LOOP_ITERATIONS},
    ready::Ready,
};

use crate::{
    fatal,
    metrics::dump_local_metrics,
    protocol::{
        client::{Client, LookupState},
        parse, ClientKind, ClientState, CONNECT_RESPONSE,
    },
    resolver::{ResolveCallback, Resolution, ResolverHandle},
    slab::{ClientId, ClientSlab, Side},
    socket::{SocketHandler, SocketResult},
    worker::{WorkerError, WorkerMessage, WorkerReport, WAKER_TOKEN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pump {
    /// nothing more can move for now
    Done,
    /// the transfer went on for too long, it must resume later
    Yield,
    SourceClosed,
    SinkClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    Done,
    Blocked,
    Closed,
}

pub struct EventLoop {
    index: usize,
    poll: Poll,
    clients: ClientSlab<Client>,
    resolver: ResolverHandle,
    inbox: Receiver<WorkerMessage>,
    /// cloned into resolver callbacks
    outbox: Sender<WorkerMessage>,
    waker: Arc<Waker>,
    alive: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    /// actions for the next loop turn, the poll does not wait while any
    /// is pending
    deferred: VecDeque<(ClientId, Ready)>,
    lingering: Vec<ClientId>,
    buffer_size: usize,
    max_events: usize,
    event_timeout: Duration,
    linger_timeout: Duration,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        poll: Poll,
        resolver: ResolverHandle,
        inbox: Receiver<WorkerMessage>,
        outbox: Sender<WorkerMessage>,
        waker: Arc<Waker>,
        alive: Arc<AtomicBool>,
        stopping: Arc<AtomicBool>,
        config: &Config,
    ) -> EventLoop {
        EventLoop {
            index,
            poll,
            clients: ClientSlab::new(config.slab_capacity, config.max_clients_per_worker),
            resolver,
            inbox,
            outbox,
            waker,
            alive,
            stopping,
            deferred: VecDeque::new(),
            lingering: Vec::new(),
            buffer_size: config.buffer_size,
            max_events: config.max_events,
            event_timeout: config.event_timeout,
            linger_timeout: config.linger_timeout,
        }
    }

    /// Thread body: runs until asked to stop or until waiting fails
    pub fn run(mut self) -> WorkerReport {
        let mut events = Events::with_capacity(self.max_events);
        self.alive.store(true, Ordering::Release);
        info!("WORKER {}\tevent loop running", self.index);

        while !self.stopping.load(Ordering::Acquire) {
            let timeout = if self.deferred.is_empty() {
                self.event_timeout
            } else {
                Duration::ZERO
            };

            if let Err(error) = self.poll.poll(&mut events, Some(timeout)) {
                if error.kind() == ErrorKind::Interrupted {
                    info!("WORKER {}\tinterrupted, stopping", self.index);
                } else {
                    error!("WORKER {}\tcould not wait for events: {}", self.index, error);
                    incr!("worker.poll_error");
                }
                break;
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                match self.clients.resolve(event.token()) {
                    Some((id, side)) => self.drive(id, side, readiness(event)),
                    None => trace!(
                        "WORKER {}\tevent for a client that left: {:?}",
                        self.index,
                        event.token()
                    ),
                }
            }

            self.process_inbox();
            self.run_deferred();
            self.expire_lingering(Instant::now());
        }

        self.alive.store(false, Ordering::Release);
        self.shutdown()
    }

    fn process_inbox(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                WorkerMessage::NewClient(stream) => self.accept(stream),
                WorkerMessage::Resolved { client, result } => {
                    let waiting = match self.clients.get_mut(client) {
                        Some(record) if record.state == ClientState::Resolver => {
                            record.lookup = LookupState::Done(result);
                            true
                        }
                        _ => false,
                    };
                    if waiting {
                        self.drive(client, Side::Inbound, Ready::EMPTY);
                    } else {
                        trace!(
                            "WORKER {}\tlookup result for a client that left: {}",
                            self.index,
                            client
                        );
                    }
                }
            }
        }
    }

    fn run_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for (id, ready) in deferred {
            if self.clients.contains(id) {
                self.drive(id, Side::Inbound, ready);
            }
        }
    }

    fn expire_lingering(&mut self, now: Instant) {
        if self.lingering.is_empty() {
            return;
        }

        for id in std::mem::take(&mut self.lingering) {
            let deadline = match self.clients.get(id).and_then(|client| client.lingering) {
                Some(deadline) => deadline,
                None => continue,
            };

            if now >= deadline {
                if let Some(client) = self.clients.get(id) {
                    info!(
                        "{} could not flush {} bytes before the linger timeout",
                        log_context!(client),
                        client.buffer.len()
                    );
                }
                incr!("client.linger_timeout");
                self.remove_client(id);
            } else {
                self.lingering.push(id);
            }
        }
    }

    fn defer(&mut self, id: ClientId, ready: Ready) {
        self.deferred.push_back((id, ready));
    }

    fn accept(&mut self, stream: TcpStream) {
        match self.add_client(
            stream,
            ClientState::Header,
            ClientKind::Http,
            None,
            Ulid::generate(),
        ) {
            Ok(id) => {
                incr!("client.accepted");
                if let Some(client) = self.clients.get(id) {
                    debug!("{} new client", log_context!(client));
                }
                // data may have arrived before the registration
                self.drive(id, Side::Inbound, Ready::READABLE);
            }
            Err(error) => {
                incr!("client.rejected");
                warn!("WORKER {}\tcould not add client: {}", self.index, error);
            }
        }
    }

    /// Allocates a record and registers `socket` readable. If either step
    /// fails the socket is dropped, and so closed.
    pub fn add_client(
        &mut self,
        socket: TcpStream,
        state: ClientState,
        kind: ClientKind,
        peer: Option<ClientId>,
        session: Ulid,
    ) -> Result<ClientId, WorkerError> {
        let registry = self.poll.registry();
        let buffer_size = self.buffer_size;

        let id = self.clients.insert_with::<WorkerError, _>(move |id| {
            let mut socket = socket;
            registry
                .register(&mut socket, id.token(Side::Inbound), Interest::READABLE)
                .map_err(WorkerError::Register)?;
            Ok(Client::new(
                id,
                session,
                socket,
                state,
                kind,
                peer,
                buffer_size,
            ))
        })?;

        gauge_add!("client.active", 1);
        Ok(id)
    }

    /// The deletion protocol. A surviving peer is unlinked first and left
    /// to flush what it still holds, then the record is deregistered and
    /// freed; its sockets close when it is dropped.
    pub fn remove_client(&mut self, id: ClientId) {
        let peer = match self.clients.get_mut(id) {
            Some(client) => client.peer.take(),
            None => return,
        };
        if let Some(peer) = peer {
            self.unlink(id, peer);
        }

        let Some(mut client) = self.clients.remove(id) else {
            return;
        };
        client.deregister(self.poll.registry());
        client.state = ClientState::Stop;

        info!(
            "{} closed, sent {} bytes, received {} bytes in {:?}",
            log_context!(client),
            client.bytes_sent,
            client.bytes_received,
            client.created.elapsed()
        );
        incr!("client.closed");
        gauge_add!("client.active", -1);
        time!("client.duration", client.created.elapsed().as_millis());
    }

    /// the survivor takes over the bytes meant for its socket and lingers
    fn unlink(&mut self, departing: ClientId, survivor: ClientId) {
        let registry = self.poll.registry();
        let deadline = Instant::now() + self.linger_timeout;

        let Some((departing, client)) = self.clients.get2_mut(departing, survivor) else {
            return;
        };

        client.peer = None;
        client.buffer.clear();
        // nothing may precede the CONNECT answer
        if client.state != ClientState::Response {
            client.buffer.extend_from_slice(departing.buffer.data());
        }
        client.lingering = Some(deadline);
        client.update_interest(registry, Ready::READABLE | Ready::WRITABLE);
        debug!(
            "{} peer left, {} bytes left to flush",
            log_context!(client),
            client.buffer.len()
        );

        self.lingering.push(survivor);
        self.defer(survivor, Ready::WRITABLE);
    }

    /// Runs state handlers until the state settles
    pub fn drive(&mut self, id: ClientId, side: Side, ready: Ready) {
        let mut side = side;
        let mut ready = ready;

        loop {
            let Some(client) = self.clients.get(id) else {
                return;
            };

            if client.lingering.is_some() {
                if self.linger(id, ready) == ClientState::Stop {
                    self.remove_client(id);
                }
                return;
            }

            let state = client.state;
            if side == Side::Outbound && state != ClientState::Connect {
                return;
            }

            let next = match state {
                ClientState::Header => self.header(id, ready),
                ClientState::Resolver => self.resolve(id, ready),
                ClientState::Connect => self.connect(id, side, ready),
                ClientState::Response => self.response(id, ready),
                ClientState::ForwardHeader => self.forward_header(id, ready),
                ClientState::ForwardAll => self.forward_all(id, ready),
                ClientState::Stop => ClientState::Stop,
            };

            if next == ClientState::Stop {
                self.remove_client(id);
                return;
            }

            let Some(client) = self.clients.get_mut(id) else {
                return;
            };
            // a handler that lost the peer leaves the client lingering
            if next == state || client.lingering.is_some() {
                return;
            }

            debug_assert!(next > state, "{state} -> {next} goes backwards");
            debug!("{} {} -> {}", log_context!(client), state, next);
            client.state = next;
            side = Side::Inbound;
            ready = Ready::EMPTY;
        }
    }

    fn header(&mut self, id: ClientId, ready: Ready) -> ClientState {
        let Some(client) = self.clients.get_mut(id) else {
            return ClientState::Stop;
        };
        if ready.is_error() {
            debug!("{} socket error while reading the header", log_context!(client));
            return ClientState::Stop;
        }

        let (size, socket_state) = client.socket.socket_read(client.buffer.space());
        client.buffer.fill(size);
        client.bytes_received += size;
        count!("bytes_in", size as i64);
        trace!("{} read {} bytes", log_context!(client), size);

        match parse(client.buffer.data()) {
            Ok(Some(request)) => {
                info!(
                    "{} {} {}",
                    log_context!(client),
                    request.method,
                    request.target
                );

                match request.rewritten {
                    Some(ref rewritten) => {
                        if !client.buffer.replace_head(request.header_len, rewritten) {
                            warn!("{} rewritten header does not fit", log_context!(client));
                            incr!("client.header_overflow");
                            return ClientState::Stop;
                        }
                    }
                    // the CONNECT header is for us, what follows is for the target
                    None if request.kind == ClientKind::Https => {
                        client.buffer.consume(request.header_len);
                    }
                    None => {}
                }

                client.kind = request.kind;
                client.target = Some(request.target);
                ClientState::Resolver
            }
            Ok(None) if client.buffer.is_full() => {
                warn!(
                    "{} request header exceeds {} bytes",
                    log_context!(client),
                    client.buffer.capacity()
                );
                incr!("client.header_overflow");
                ClientState::Stop
            }
            Ok(None) => match socket_state {
                SocketResult::Closed | SocketResult::Error => {
                    debug!("{} left before sending a header", log_context!(client));
                    ClientState::Stop
                }
                SocketResult::Continue | SocketResult::WouldBlock => ClientState::Header,
            },
            Err(error) => {
                warn!("{} invalid request: {}", log_context!(client), error);
                incr!("client.invalid_request");
                ClientState::Stop
            }
        }
    }

    fn resolve(&mut self, id: ClientId, ready: Ready) -> ClientState {
        let Some(client) = self.clients.get_mut(id) else {
            return ClientState::Stop;
        };
        if ready.is_error() {
            return ClientState::Stop;
        }

        let addresses = match std::mem::replace(&mut client.lookup, LookupState::Pending) {
            LookupState::NotStarted => {
                let Some(target) = client.target.clone() else {
                    error!("{} no target to resolve", log_context!(client));
                    return ClientState::Stop;
                };

                let outbox = self.outbox.clone();
                let waker = self.waker.clone();
                let callback: ResolveCallback = Box::new(move |result| {
                    if outbox
                        .send(WorkerMessage::Resolved { client: id, result })
                        .is_ok()
                    {
                        if let Err(error) = waker.wake() {
                            error!("could not wake worker with a lookup result: {}", error);
                        }
                    }
                });

                match self.resolver.lookup(&target.host, target.port, callback) {
                    Resolution::Ready(addresses) => addresses,
                    Resolution::Pending => {
                        debug!("{} waiting for {} to resolve", log_context!(client), target);
                        return ClientState::Resolver;
                    }
                    Resolution::Failed(error) => {
                        warn!("{} could not resolve {}: {}", log_context!(client), target, error);
                        incr!("client.resolve_failure");
                        return ClientState::Stop;
                    }
                }
            }
            LookupState::Pending => return ClientState::Resolver,
            LookupState::Done(Ok(addresses)) => addresses,
            LookupState::Done(Err(error)) => {
                warn!(
                    "{} could not resolve {}: {}",
                    log_context!(client),
                    client.target_name(),
                    error
                );
                incr!("client.resolve_failure");
                return ClientState::Stop;
            }
        };

        if addresses.is_empty() {
            warn!("{} no address for {}", log_context!(client), client.target_name());
            incr!("client.resolve_failure");
            return ClientState::Stop;
        }
        debug!("{} candidates: {:?}", log_context!(client), addresses);
        client.candidates = addresses.into();
        ClientState::Connect
    }

    fn connect(&mut self, id: ClientId, side: Side, ready: Ready) -> ClientState {
        let registry = self.poll.registry();
        let Some(client) = self.clients.get_mut(id) else {
            return ClientState::Stop;
        };

        if side == Side::Inbound {
            if ready.is_error() {
                return ClientState::Stop;
            }
            if ready.is_empty() && client.outbound.is_none() {
                return self.connect_next(id);
            }
            return ClientState::Connect;
        }

        let Some(stream) = client.outbound.as_mut() else {
            return ClientState::Connect;
        };

        let failure = match stream.take_error() {
            Ok(Some(error)) | Err(error) => Some(error),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => None,
                Err(error) if error.kind() == ErrorKind::NotConnected => {
                    if !ready.is_error() && !ready.is_hup() {
                        // spurious wakeup, still connecting
                        return ClientState::Connect;
                    }
                    Some(error)
                }
                Err(error) => Some(error),
            },
        };

        if let Some(error) = failure {
            debug!(
                "{} could not connect to {:?}: {}",
                log_context!(client),
                client.connecting_to,
                error
            );
            incr!("client.connect_attempt_failure");
            return self.connect_next(id);
        }

        let Some(mut stream) = client.outbound.take() else {
            return ClientState::Connect;
        };
        if let Err(error) = registry.deregister(&mut stream) {
            fatal(&format!(
                "{} could not deregister established connection: {}",
                log_context!(client),
                error
            ));
        }

        let kind = client.kind;
        let session = client.session;
        info!(
            "{} connected to {} at {:?}",
            log_context!(client),
            client.target_name(),
            client.connecting_to
        );

        match self.add_client(stream, ClientState::ForwardAll, kind, Some(id), session) {
            Ok(peer) => {
                if let Some(client) = self.clients.get_mut(id) {
                    client.peer = Some(peer);
                }
                incr!("client.connected");
                match kind {
                    ClientKind::Https => ClientState::Response,
                    ClientKind::Http => ClientState::ForwardHeader,
                }
            }
            Err(error) => {
                if let Some(client) = self.clients.get(id) {
                    error!("{} could not add the target side: {}", log_context!(client), error);
                }
                ClientState::Stop
            }
        }
    }

    /// Starts a connection to the next candidate, dropping the previous
    /// attempt. Once none is left the host is evicted from the resolver
    /// cache.
    fn connect_next(&mut self, id: ClientId) -> ClientState {
        let registry = self.poll.registry();
        let Some(client) = self.clients.get_mut(id) else {
            return ClientState::Stop;
        };

        if let Some(mut failed) = client.outbound.take() {
            if let Err(error) = registry.deregister(&mut failed) {
                fatal(&format!(
                    "{} could not deregister failed connection: {}",
                    log_context!(client),
                    error
                ));
            }
        }

        while let Some(address) = client.candidates.pop_front() {
            let mut stream = match TcpStream::connect(address) {
                Ok(stream) => stream,
                Err(error) => {
                    debug!("{} could not connect to {}: {}", log_context!(client), address, error);
                    continue;
                }
            };

            if let Err(error) =
                registry.register(&mut stream, id.token(Side::Outbound), Interest::WRITABLE)
            {
                error!(
                    "{} could not register connection to {}: {}",
                    log_context!(client),
                    address,
                    error
                );
                continue;
            }

            trace!("{} connecting to {}", log_context!(client), address);
            client.outbound = Some(stream);
            client.connecting_to = Some(address);
            return ClientState::Connect;
        }

        warn!(
            "{} could not connect to any address of {}",
            log_context!(client),
            client.target_name()
        );
        incr!("client.connect_failure");
        if let Some(target) = &client.target {
            self.resolver.forget(&target.host);
        }
        ClientState::Stop
    }

    fn response(&mut self, id: ClientId, ready: Ready) -> ClientState {
        let registry = self.poll.registry();
        let Some(client) = self.clients.get_mut(id) else {
            return ClientState::Stop;
        };
        if ready.is_error() || client.peer.is_none() {
            return ClientState::Stop;
        }

        let (size, socket_state) =
            client.socket.socket_write(&CONNECT_RESPONSE[client.response_written..]);
        client.response_written += size;
        client.bytes_sent += size;

        if client.response_written == CONNECT_RESPONSE.len() {
            client.want_writable(registry, false);
            return ClientState::ForwardAll;
        }

        match socket_state {
            SocketResult::Closed | SocketResult::Error => {
                debug!("{} could not answer the CONNECT request", log_context!(client));
                ClientState::Stop
            }
            SocketResult::Continue | SocketResult::WouldBlock => {
                client.want_writable(registry, true);
                ClientState::Response
            }
        }
    }

    fn forward_header(&mut self, id: ClientId, ready: Ready) -> ClientState {
        if ready.is_error() {
            return ClientState::Stop;
        }
        let Some(peer) = self.clients.get(id).and_then(|client| client.peer) else {
            return ClientState::Stop;
        };

        let registry = self.poll.registry();
        let Some((client, target)) = self.clients.get2_mut(id, peer) else {
            return ClientState::Stop;
        };

        match flush(client, target, registry) {
            Flush::Done => ClientState::ForwardAll,
            Flush::Blocked => ClientState::ForwardHeader,
            Flush::Closed => {
                warn!("{} could not forward the request header", log_context!(client));
                ClientState::Stop
            }
        }
    }

    fn forward_all(&mut self, id: ClientId, ready: Ready) -> ClientState {
        if ready.is_error() {
            return ClientState::Stop;
        }
        let Some(peer) = self.clients.get(id).and_then(|client| client.peer) else {
            return ClientState::Stop;
        };
        let entry = ready.is_empty();

        if entry || ready.is_readable() || ready.is_hup() {
            match self.pump(id, peer) {
                Pump::Done => {}
                Pump::Yield => self.defer(id, Ready::READABLE),
                Pump::SourceClosed => return ClientState::Stop,
                Pump::SinkClosed => {
                    self.remove_client(peer);
                    return ClientState::ForwardAll;
                }
            }
        }

        if entry || ready.is_writable() {
            match self.clients.get(peer).map(|client| client.state) {
                Some(ClientState::ForwardAll) => match self.pump(peer, id) {
                    Pump::Done => {}
                    Pump::Yield => self.defer(peer, Ready::READABLE),
                    Pump::SourceClosed => self.remove_client(peer),
                    Pump::SinkClosed => return ClientState::Stop,
                },
                // the peer is still sending its request header through us
                Some(ClientState::ForwardHeader) => self.defer(peer, Ready::WRITABLE),
                _ => {}
            }
        }

        ClientState::ForwardAll
    }

    /// Moves bytes from `src`'s socket to `dst`'s socket through `src`'s
    /// buffer, for at most `MAX_LOOP_ITERATIONS` buffers
    fn pump(&mut self, src: ClientId, dst: ClientId) -> Pump {
        let registry = self.poll.registry();
        let Some((source, sink)) = self.clients.get2_mut(src, dst) else {
            return Pump::SinkClosed;
        };
        // the CONNECT answer goes first
        let sink_open = sink.state != ClientState::Response;

        for _ in 0..MAX_LOOP_ITERATIONS {
            if sink_open && !source.buffer.is_empty() {
                match flush(source, sink, registry) {
                    Flush::Done => {}
                    Flush::Blocked => return Pump::Done,
                    Flush::Closed => return Pump::SinkClosed,
                }
            }

            if source.state != ClientState::ForwardAll || source.buffer.is_full() {
                return Pump::Done;
            }

            let (size, socket_state) = source.socket.socket_read(source.buffer.space());
            source.buffer.fill(size);
            source.bytes_received += size;
            count!("bytes_in", size as i64);

            match socket_state {
                SocketResult::Continue => {}
                SocketResult::WouldBlock => {
                    if sink_open && !source.buffer.is_empty() {
                        if let Flush::Closed = flush(source, sink, registry) {
                            return Pump::SinkClosed;
                        }
                    }
                    return Pump::Done;
                }
                SocketResult::Closed | SocketResult::Error => {
                    // last chance, what is left moves to the survivor
                    if sink_open && !source.buffer.is_empty() {
                        let _ = flush(source, sink, registry);
                    }
                    debug!("{} closed by the other end", log_context!(source));
                    return Pump::SourceClosed;
                }
            }
        }

        Pump::Yield
    }

    /// flushes what a client holds after its peer left
    fn linger(&mut self, id: ClientId, ready: Ready) -> ClientState {
        let Some(client) = self.clients.get_mut(id) else {
            return ClientState::Stop;
        };
        if ready.is_error() || client.buffer.is_empty() {
            return ClientState::Stop;
        }

        let (size, socket_state) = client.socket.socket_write(client.buffer.data());
        client.buffer.consume(size);
        client.bytes_sent += size;
        count!("bytes_out", size as i64);

        match socket_state {
            SocketResult::Closed | SocketResult::Error => ClientState::Stop,
            _ if client.buffer.is_empty() => ClientState::Stop,
            _ => client.state,
        }
    }

    /// Closes every client still open and hands the metrics over
    fn shutdown(mut self) -> WorkerReport {
        let registry = self.poll.registry();
        let mut drained = 0;

        self.clients.drain(|_, mut client| {
            client.deregister(registry);
            debug!("{} closed at shutdown", log_context!(client));
            incr!("client.closed");
            gauge_add!("client.active", -1);
            drained += 1;
        });

        info!(
            "WORKER {}\tstopped, {} clients closed at shutdown",
            self.index, drained
        );
        WorkerReport {
            index: self.index,
            drained,
            metrics: dump_local_metrics(),
        }
    }
}

/// writes the source's buffer to the sink's socket
fn flush(source: &mut Client, sink: &mut Client, registry: &Registry) -> Flush {
    let (size, socket_state) = sink.socket.socket_write(source.buffer.data());
    source.buffer.consume(size);
    sink.bytes_sent += size;
    count!("bytes_out", size as i64);

    match socket_state {
        SocketResult::Closed | SocketResult::Error => Flush::Closed,
        _ if source.buffer.is_empty() => {
            sink.want_writable(registry, false);
            Flush::Done
        }
        _ => {
            sink.want_writable(registry, true);
            Flush::Blocked
        }
    }
}

fn readiness(event: &Event) -> Ready {
    let mut ready = Ready::EMPTY;
    if event.is_readable() {
        ready.insert(Ready::READABLE);
    }
    if event.is_writable() {
        ready.insert(Ready::WRITABLE);
    }
    if event.is_error() {
        ready.insert(Ready::ERROR);
    }
    if event.is_read_closed() || event.is_write_closed() {
        ready.insert(Ready::HUP);
    }
    ready
}
