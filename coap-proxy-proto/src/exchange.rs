use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;

use crate::{
    forward::BindingHandle,
    message::{MessageId, MessageKind, Token},
};

/// Internal identifier for an [`Exchange`] in an [`ExchangeTable`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct ExchangeHandle(pub(crate) usize);

impl From<ExchangeHandle> for usize {
    fn from(x: ExchangeHandle) -> Self {
        x.0
    }
}

/// Which side of a message exchange the proxy is playing
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Role {
    /// Sent by the proxy; retired by the peer's ack or reset, or by expiry
    OutboundPendingAck,
    /// Received from a client; retired once the forwarded outcome has been
    /// dispatched back
    InboundAwaitingResponse,
}

/// Bookkeeping for one message exchange with one peer
///
/// An exchange covers a single confirmable or non-confirmable message and the
/// acknowledgement or reset that ends it. It does not cover the semantic
/// request/response pairing, which is tracked by bindings.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) role: Role,
    pub(crate) kind: MessageKind,
    /// Whether the message carried a request method, making its token worth
    /// indexing for response matching
    pub(crate) is_request: bool,
    pub(crate) remote: SocketAddr,
    pub(crate) id: MessageId,
    pub(crate) token: Token,
    /// Encoded datagram, retained for retransmission of outbound messages
    pub(crate) datagram: Bytes,
    /// Retransmissions performed so far
    pub(crate) retransmits: u32,
    /// Wait before the next retransmission, doubled each time one fires
    pub(crate) interval: Duration,
    /// When the reliability timer for this exchange next fires
    pub(crate) next_timeout: Option<Instant>,
    /// The binding this exchange serves, if it is part of a forwarded request
    pub(crate) binding: Option<BindingHandle>,
    /// An inbound confirmable request was acknowledged with a bare ack before
    /// its outcome was known
    pub(crate) empty_ack_sent: bool,
}

impl Exchange {
    pub(crate) fn outbound(
        kind: MessageKind,
        is_request: bool,
        remote: SocketAddr,
        id: MessageId,
        token: Token,
        datagram: Bytes,
    ) -> Self {
        Self {
            role: Role::OutboundPendingAck,
            kind,
            is_request,
            remote,
            id,
            token,
            datagram,
            retransmits: 0,
            interval: Duration::ZERO,
            next_timeout: None,
            binding: None,
            empty_ack_sent: false,
        }
    }

    pub(crate) fn inbound(
        kind: MessageKind,
        remote: SocketAddr,
        id: MessageId,
        token: Token,
    ) -> Self {
        Self {
            role: Role::InboundAwaitingResponse,
            kind,
            is_request: true,
            remote,
            id,
            token,
            datagram: Bytes::new(),
            retransmits: 0,
            interval: Duration::ZERO,
            next_timeout: None,
            binding: None,
            empty_ack_sent: false,
        }
    }
}

/// Attempt to track two live exchanges under one message ID towards one peer
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("message ID {id} already in use towards {remote}")]
pub(crate) struct DuplicateExchange {
    pub(crate) remote: SocketAddr,
    pub(crate) id: MessageId,
}

/// Arena of live exchanges with lookup by message ID and by request token
///
/// Message IDs and tokens are only meaningful together with the peer address,
/// so both indexes are keyed by `(SocketAddr, _)` pairs. Entries stay until
/// explicitly retired; handles returned by [`due_timers`](Self::due_timers)
/// may have been retired by the time they are inspected, so liveness must be
/// rechecked through [`get_mut`](Self::get_mut).
pub(crate) struct ExchangeTable {
    exchanges: Slab<Exchange>,
    by_id: FxHashMap<(SocketAddr, MessageId), ExchangeHandle>,
    by_token: FxHashMap<(SocketAddr, Token), ExchangeHandle>,
}

impl ExchangeTable {
    pub(crate) fn new() -> Self {
        Self {
            exchanges: Slab::new(),
            by_id: FxHashMap::default(),
            by_token: FxHashMap::default(),
        }
    }

    /// Admit a new exchange, refusing message ID collisions
    ///
    /// Request tokens are indexed additionally; a token collision towards the
    /// same peer is refused the same way since response matching would become
    /// ambiguous.
    pub(crate) fn register(
        &mut self,
        exchange: Exchange,
    ) -> Result<ExchangeHandle, DuplicateExchange> {
        let id_key = (exchange.remote, exchange.id);
        let token_key = (exchange.remote, exchange.token);
        if self.by_id.contains_key(&id_key) {
            return Err(DuplicateExchange {
                remote: exchange.remote,
                id: exchange.id,
            });
        }
        if exchange.is_request && self.by_token.contains_key(&token_key) {
            return Err(DuplicateExchange {
                remote: exchange.remote,
                id: exchange.id,
            });
        }
        let index_token = exchange.is_request;
        let handle = ExchangeHandle(self.exchanges.insert(exchange));
        self.by_id.insert(id_key, handle);
        if index_token {
            self.by_token.insert(token_key, handle);
        }
        Ok(handle)
    }

    /// Find the live exchange for an ack or reset
    pub(crate) fn lookup_by_id(
        &self,
        remote: SocketAddr,
        id: MessageId,
    ) -> Option<ExchangeHandle> {
        self.by_id.get(&(remote, id)).copied()
    }

    /// Find the live request exchange a response token refers to
    pub(crate) fn lookup_by_token(
        &self,
        remote: SocketAddr,
        token: Token,
    ) -> Option<ExchangeHandle> {
        self.by_token.get(&(remote, token)).copied()
    }

    /// Whether a message ID is currently live towards `remote`
    pub(crate) fn contains_id(&self, remote: SocketAddr, id: MessageId) -> bool {
        self.by_id.contains_key(&(remote, id))
    }

    pub(crate) fn get(&self, handle: ExchangeHandle) -> Option<&Exchange> {
        self.exchanges.get(handle.0)
    }

    pub(crate) fn get_mut(&mut self, handle: ExchangeHandle) -> Option<&mut Exchange> {
        self.exchanges.get_mut(handle.0)
    }

    /// Remove an exchange and both of its index entries
    ///
    /// Idempotent: retiring a handle that was already retired returns `None`
    /// and changes nothing.
    pub(crate) fn retire(&mut self, handle: ExchangeHandle) -> Option<Exchange> {
        let exchange = self.exchanges.try_remove(handle.0)?;
        self.by_id.remove(&(exchange.remote, exchange.id));
        if exchange.is_request {
            self.by_token.remove(&(exchange.remote, exchange.token));
        }
        Some(exchange)
    }

    /// Snapshot the exchanges whose reliability timers have fired
    ///
    /// A snapshot rather than an iterator, so callers may retire arbitrary
    /// entries while walking it.
    pub(crate) fn due_timers(&self, now: Instant) -> Vec<ExchangeHandle> {
        self.exchanges
            .iter()
            .filter(|(_, x)| x.next_timeout.is_some_and(|t| t <= now))
            .map(|(index, _)| ExchangeHandle(index))
            .collect()
    }

    /// The earliest pending reliability timer, if any
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.exchanges
            .iter()
            .filter_map(|(_, x)| x.next_timeout)
            .min()
    }

    /// Snapshot of every live exchange, for shutdown
    pub(crate) fn handles(&self) -> Vec<ExchangeHandle> {
        self.exchanges
            .iter()
            .map(|(index, _)| ExchangeHandle(index))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.exchanges.len()
    }
}
