use std::{fmt, net::SocketAddr, time::Instant};

use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;

use crate::{
    exchange::ExchangeHandle,
    message::{
        option, Code, InvalidDestination, Message, MessageId, MessageKind, ProxyDestination, Token,
    },
};

/// Identifies one forwarded request from acceptance to outcome dispatch
///
/// Carries a generation alongside the slot index, so a handle that outlives
/// its binding never designates whatever later reuses the slot. Resolver
/// answers in particular can arrive long after the request they were for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BindingHandle {
    index: usize,
    generation: u64,
}

/// Identifies a request submitted by the embedding application
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The client side of a forwarded request
#[derive(Debug)]
pub(crate) enum ClientLeg {
    /// A network peer that sent the request over UDP
    Network {
        remote: SocketAddr,
        id: MessageId,
        token: Token,
        kind: MessageKind,
        exchange: ExchangeHandle,
    },
    /// The embedding application, reached through completion events
    Local { request: RequestId, token: Token },
}

/// Progress of the server leg of a binding
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum BindingState {
    /// Waiting for the origin host name to resolve
    Resolving,
    /// Request sent to the origin, no reply yet
    AwaitingResponse,
    /// Origin acknowledged with a bare ack; a separate response will follow
    AckedAwaitingSeparate,
}

/// Association between a client request and its server-leg counterpart
///
/// The legs are joined by peer address and token values rather than by
/// references into the exchange arena, so either leg's exchange can end
/// without invalidating the other.
#[derive(Debug)]
pub(crate) struct ProxyBinding {
    pub(crate) client: ClientLeg,
    pub(crate) state: BindingState,
    /// Assigned at insertion; distinguishes this binding from later tenants
    /// of the same slot
    generation: u64,
    /// Host name the request asked for, kept for failure reporting
    pub(crate) host: String,
    /// Server-leg peer and token, present once resolution succeeds
    pub(crate) origin: Option<(SocketAddr, Token)>,
    pub(crate) server_exchange: Option<ExchangeHandle>,
    /// Rewritten request retained while the destination resolves
    pub(crate) pending_request: Option<Message>,
    /// Hard deadline for the whole forwarded request
    pub(crate) deadline: Instant,
}

impl ProxyBinding {
    pub(crate) fn new(
        client: ClientLeg,
        host: String,
        pending_request: Message,
        deadline: Instant,
    ) -> Self {
        Self {
            client,
            state: BindingState::Resolving,
            generation: 0,
            host,
            origin: None,
            server_exchange: None,
            pending_request: Some(pending_request),
            deadline,
        }
    }
}

/// Table of in-flight forwarded requests
///
/// Separate responses from origins are routed by `(origin address, token)`,
/// which stays valid after the server-leg request exchange itself has been
/// acknowledged and retired.
pub(crate) struct BindingTable {
    bindings: Slab<ProxyBinding>,
    by_server_token: FxHashMap<(SocketAddr, Token), BindingHandle>,
    generation: u64,
}

impl BindingTable {
    pub(crate) fn new() -> Self {
        Self {
            bindings: Slab::new(),
            by_server_token: FxHashMap::default(),
            generation: 0,
        }
    }

    pub(crate) fn insert(&mut self, mut binding: ProxyBinding) -> BindingHandle {
        self.generation += 1;
        binding.generation = self.generation;
        BindingHandle {
            index: self.bindings.insert(binding),
            generation: self.generation,
        }
    }

    pub(crate) fn get(&self, handle: BindingHandle) -> Option<&ProxyBinding> {
        self.bindings
            .get(handle.index)
            .filter(|b| b.generation == handle.generation)
    }

    pub(crate) fn get_mut(&mut self, handle: BindingHandle) -> Option<&mut ProxyBinding> {
        self.bindings
            .get_mut(handle.index)
            .filter(|b| b.generation == handle.generation)
    }

    /// Record the server-leg identity once the destination has resolved
    pub(crate) fn bind_origin(&mut self, handle: BindingHandle, remote: SocketAddr, token: Token) {
        if let Some(binding) = self
            .bindings
            .get_mut(handle.index)
            .filter(|b| b.generation == handle.generation)
        {
            binding.origin = Some((remote, token));
            self.by_server_token.insert((remote, token), handle);
        }
    }

    /// Route an origin response to the binding expecting it
    pub(crate) fn lookup_response(
        &self,
        remote: SocketAddr,
        token: Token,
    ) -> Option<BindingHandle> {
        self.by_server_token.get(&(remote, token)).copied()
    }

    /// Remove a binding and its response index entry; idempotent
    pub(crate) fn retire(&mut self, handle: BindingHandle) -> Option<ProxyBinding> {
        self.get(handle)?;
        let binding = self.bindings.try_remove(handle.index)?;
        if let Some(origin) = binding.origin {
            self.by_server_token.remove(&origin);
        }
        Some(binding)
    }

    /// Snapshot the bindings whose overall deadline has passed
    pub(crate) fn due_deadlines(&self, now: Instant) -> Vec<BindingHandle> {
        self.bindings
            .iter()
            .filter(|(_, b)| b.deadline <= now)
            .map(|(index, b)| BindingHandle {
                index,
                generation: b.generation,
            })
            .collect()
    }

    /// The earliest pending deadline, if any
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.bindings.iter().map(|(_, b)| b.deadline).min()
    }

    /// Snapshot of every live binding, for shutdown
    pub(crate) fn handles(&self) -> Vec<BindingHandle> {
        self.bindings
            .iter()
            .map(|(index, b)| BindingHandle {
                index,
                generation: b.generation,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.bindings.len()
    }
}

/// Build the server-leg request from a client request and its destination
///
/// Strips the options that addressed the proxy itself and, for URI-form
/// destinations, replaces the path and query with the decomposed ones. The
/// message ID and token are placeholders until the send assigns fresh ones.
pub(crate) fn rewrite_request(request: &Message, destination: &ProxyDestination) -> Message {
    let mut rewritten = Message::new(request.kind, request.code, MessageId(0), Token::empty());
    rewritten.payload = request.payload.clone();
    match destination {
        ProxyDestination::Uri { path, query, .. } => {
            for opt in request.all_options() {
                if matches!(
                    opt.number,
                    option::URI_HOST
                        | option::URI_PORT
                        | option::URI_PATH
                        | option::URI_QUERY
                        | option::PROXY_URI
                        | option::PROXY_SCHEME
                ) {
                    continue;
                }
                rewritten.add_option(opt.number, opt.value.clone());
            }
            for segment in path {
                rewritten.add_option(option::URI_PATH, segment.as_bytes());
            }
            for arg in query {
                rewritten.add_option(option::URI_QUERY, arg.as_bytes());
            }
        }
        ProxyDestination::Scheme { .. } => {
            for opt in request.all_options() {
                if matches!(
                    opt.number,
                    option::URI_HOST | option::URI_PORT | option::PROXY_URI | option::PROXY_SCHEME
                ) {
                    continue;
                }
                rewritten.add_option(opt.number, opt.value.clone());
            }
        }
    }
    rewritten
}

/// Why a forwarded request produced no origin response
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ForwardError {
    /// The request does not address the proxying role at all
    #[error("request does not address the proxy")]
    NotProxied,
    /// The request names a destination the proxy cannot serve
    #[error(transparent)]
    Destination(#[from] InvalidDestination),
    /// The destination host did not resolve to an address
    #[error("origin {0:?} did not resolve")]
    Unresolved(String),
    /// The transport reported the origin categorically unreachable
    #[error("origin unreachable")]
    Unreachable,
    /// The origin rejected the server-leg request with a reset
    #[error("origin rejected the request")]
    Rejected,
    /// Retransmissions or the overall deadline ran out without an outcome
    #[error("origin did not respond in time")]
    TimedOut,
    /// No usable message ID towards the peer, so nothing could be sent
    #[error("message ID space towards the peer is exhausted")]
    IdsExhausted,
    /// The proxy was closed before an outcome arrived
    #[error("proxy closed")]
    Closed,
}

/// The response status a failure is reported to the client as
pub(crate) fn failure_code(error: &ForwardError) -> Code {
    use ForwardError::*;
    match error {
        NotProxied | Destination(InvalidDestination::UnsupportedScheme(_)) => {
            Code::PROXYING_NOT_SUPPORTED
        }
        Destination(_) => Code::BAD_OPTION,
        Unresolved(_) | Unreachable | Rejected => Code::BAD_GATEWAY,
        TimedOut => Code::GATEWAY_TIMEOUT,
        IdsExhausted | Closed => Code::SERVICE_UNAVAILABLE,
    }
}
