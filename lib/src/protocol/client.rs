//! One half of a proxy session
//!
//! An inbound record owns the browser-facing socket and walks the whole
//! state machine. Once its target connection is established, that socket
//! becomes a second record, in `ForwardAll` from the start, and the two are
//! linked through their `peer` ids. Records only ever reach each other
//! through the worker's slab.

use std::{collections::VecDeque, net::SocketAddr, time::Instant};

use mio::{net::TcpStream, Interest, Registry};
use rusty_ulid::Ulid;

use burrow_command::ready::Ready;

use crate::{
    buffer::Buffer,
    fatal,
    protocol::{ClientKind, ClientState, Target},
    resolver::ResolveError,
    slab::{ClientId, Side},
};

/// Prefix of every log line about a client
macro_rules! log_context {
    ($client:expr) => {
        format!(
            "CLIENT\t{}\tClient(slot={}, state={}, kind={}, address={}, peer={}, interest={})\t >>>",
            $client.session,
            $client.id,
            $client.state,
            $client.kind,
            $client
                .session_address
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            $client
                .peer
                .map(|peer| peer.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            $client.interest,
        )
    };
}

#[derive(Debug)]
pub enum LookupState {
    NotStarted,
    Pending,
    Done(Result<Vec<SocketAddr>, ResolveError>),
}

pub struct Client {
    pub id: ClientId,
    /// shared by both halves of a tunnel
    pub session: Ulid,
    pub kind: ClientKind,
    pub state: ClientState,
    /// registered under `id.token(Side::Inbound)` for the record's whole life
    pub socket: TcpStream,
    /// target connection in progress, registered under the outbound token
    pub outbound: Option<TcpStream>,
    /// mirrors the registration of `socket`
    pub interest: Ready,
    pub peer: Option<ClientId>,
    pub target: Option<Target>,
    pub lookup: LookupState,
    /// resolved addresses not tried yet
    pub candidates: VecDeque<SocketAddr>,
    pub connecting_to: Option<SocketAddr>,
    pub response_written: usize,
    pub bytes_sent: usize,
    pub bytes_received: usize,
    /// bytes read from `socket`, not yet written to the peer
    pub buffer: Buffer,
    /// set once the peer is gone: pending output must be flushed before
    /// this deadline
    pub lingering: Option<Instant>,
    pub created: Instant,
    pub session_address: Option<SocketAddr>,
}

impl Client {
    /// `socket` must already be registered readable under the inbound token
    /// of `id`
    pub fn new(
        id: ClientId,
        session: Ulid,
        socket: TcpStream,
        state: ClientState,
        kind: ClientKind,
        peer: Option<ClientId>,
        buffer_size: usize,
    ) -> Client {
        let session_address = socket.peer_addr().ok();
        Client {
            id,
            session,
            kind,
            state,
            socket,
            outbound: None,
            interest: Ready::READABLE,
            peer,
            target: None,
            lookup: LookupState::NotStarted,
            candidates: VecDeque::new(),
            connecting_to: None,
            response_written: 0,
            bytes_sent: 0,
            bytes_received: 0,
            buffer: Buffer::new(buffer_size),
            lingering: None,
            created: Instant::now(),
            session_address,
        }
    }

    /// Reregisters the socket if `interest` differs from the current one.
    /// Read interest is always kept, to notice the socket closing.
    pub fn update_interest(&mut self, registry: &Registry, interest: Ready) {
        let interest = interest | Ready::READABLE;
        if interest == self.interest {
            return;
        }

        let mut mio_interest = Interest::READABLE;
        if interest.is_writable() {
            mio_interest |= Interest::WRITABLE;
        }

        if let Err(error) =
            registry.reregister(&mut self.socket, self.id.token(Side::Inbound), mio_interest)
        {
            fatal(&format!(
                "{} could not reregister socket with interest {}: {}",
                log_context!(self),
                interest,
                error
            ));
        }
        trace!(
            "{} interest {} -> {}",
            log_context!(self),
            self.interest,
            interest
        );
        self.interest = interest;
    }

    pub fn want_writable(&mut self, registry: &Registry, writable: bool) {
        let mut interest = self.interest;
        if writable {
            interest.insert(Ready::WRITABLE);
        } else {
            interest.remove(Ready::WRITABLE);
        }
        self.update_interest(registry, interest);
    }

    /// Removes every registration of the record, sockets close on drop
    pub fn deregister(&mut self, registry: &Registry) {
        if let Err(error) = registry.deregister(&mut self.socket) {
            fatal(&format!(
                "{} could not deregister socket: {}",
                log_context!(self),
                error
            ));
        }
        if let Some(mut outbound) = self.outbound.take() {
            if let Err(error) = registry.deregister(&mut outbound) {
                fatal(&format!(
                    "{} could not deregister pending connection: {}",
                    log_context!(self),
                    error
                ));
            }
        }
    }

    pub fn target_name(&self) -> String {
        self.target
            .as_ref()
            .map(|target| target.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }
}
