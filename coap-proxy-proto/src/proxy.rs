use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::{
    config::TransmissionConfig,
    exchange::{Exchange, ExchangeHandle, ExchangeTable, Role},
    forward::{
        failure_code, rewrite_request, BindingHandle, BindingState, BindingTable, ClientLeg,
        ForwardError, ProxyBinding, RequestId,
    },
    message::{CoapOption, Code, Message, MessageId, MessageKind, ProxyDestination, Token},
    reliability::{self, DedupCache, RecentIds, TimerVerdict},
    Transmit,
};

/// Protocol state machine for a forwarding proxy
///
/// Performs no I/O of its own. The driver feeds it datagrams through
/// [`handle_datagram`](Self::handle_datagram), wakes it at
/// [`next_timeout`](Self::next_timeout) through
/// [`handle_timeout`](Self::handle_timeout), and drains the datagrams and
/// events this produces through [`poll_transmit`](Self::poll_transmit) and
/// [`poll_event`](Self::poll_event). All methods take `&mut self`; `now` is
/// whatever clock the driver uses, as long as it is monotonic.
pub struct Proxy {
    rng: StdRng,
    config: Arc<TransmissionConfig>,
    exchanges: ExchangeTable,
    bindings: BindingTable,
    dedup: DedupCache,
    recent_ids: RecentIds,
    transmits: VecDeque<Transmit>,
    events: VecDeque<ProxyEvent>,
    next_id: u16,
    next_request: u64,
    stats: ProxyStats,
    closed: bool,
}

impl Proxy {
    /// Create a proxy with no exchanges in flight
    pub fn new(config: Arc<TransmissionConfig>) -> Self {
        let mut rng = StdRng::from_entropy();
        Self {
            next_id: rng.gen(),
            rng,
            exchanges: ExchangeTable::new(),
            bindings: BindingTable::new(),
            dedup: DedupCache::new(config.exchange_lifetime),
            recent_ids: RecentIds::new(config.message_id_lifetime),
            config,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            next_request: 0,
            stats: ProxyStats::default(),
            closed: false,
        }
    }

    /// Process an incoming UDP datagram
    pub fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, data: &[u8]) {
        if self.closed {
            return;
        }
        self.dedup.prune(now);
        self.recent_ids.prune(now);
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.malformed += 1;
                trace!(%remote, "malformed datagram: {e}");
                return;
            }
        };
        match msg.kind {
            MessageKind::Acknowledgement => self.on_ack(now, remote, msg),
            MessageKind::Reset => self.on_reset(now, remote, msg),
            MessageKind::Confirmable | MessageKind::NonConfirmable => {
                self.on_transmission(now, remote, msg)
            }
        }
    }

    /// Process timer expirations up to `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.dedup.prune(now);
        self.recent_ids.prune(now);
        for handle in self.exchanges.due_timers(now) {
            // an earlier verdict in this pass may have retired the entry
            let Some(exchange) = self.exchanges.get_mut(handle) else {
                continue;
            };
            match reliability::on_timeout(exchange, now, &self.config) {
                TimerVerdict::Retransmit => {
                    trace!(
                        remote = %exchange.remote,
                        id = %exchange.id,
                        count = exchange.retransmits,
                        "retransmitting",
                    );
                    let transmit = Transmit {
                        destination: exchange.remote,
                        contents: exchange.datagram.clone(),
                    };
                    self.stats.retransmits += 1;
                    self.transmits.push_back(transmit);
                }
                TimerVerdict::EmptyAck => {
                    let (remote, id) = (exchange.remote, exchange.id);
                    exchange.empty_ack_sent = true;
                    trace!(%remote, %id, "acknowledging before the outcome is known");
                    self.reply_empty(MessageKind::Acknowledgement, remote, id);
                }
                TimerVerdict::Exhausted => {
                    let Some(exchange) = self.retire_exchange(now, handle) else {
                        continue;
                    };
                    match exchange.binding {
                        Some(binding) if exchange.is_request => {
                            debug!(
                                remote = %exchange.remote,
                                id = %exchange.id,
                                "retransmissions exhausted",
                            );
                            self.fail_binding(now, binding, ForwardError::TimedOut);
                        }
                        _ => {
                            debug!(
                                remote = %exchange.remote,
                                id = %exchange.id,
                                "response was never acknowledged",
                            );
                        }
                    }
                }
            }
        }
        for handle in self.bindings.due_deadlines(now) {
            if self.bindings.get(handle).is_none() {
                continue;
            }
            debug!("forwarded request passed its deadline");
            self.fail_binding(now, handle, ForwardError::TimedOut);
        }
    }

    /// When [`handle_timeout`](Self::handle_timeout) should next be called
    pub fn next_timeout(&self) -> Option<Instant> {
        [self.exchanges.next_timeout(), self.bindings.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Get the next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Get the next event for the driver
    pub fn poll_event(&mut self) -> Option<ProxyEvent> {
        self.events.pop_front()
    }

    /// Forward a request on behalf of the embedding application
    ///
    /// The request names its destination the way a network client's would,
    /// through a Proxy-Uri option or Proxy-Scheme with Uri-Host. The outcome
    /// arrives as a [`ProxyEvent::Completed`] carrying the returned id, with
    /// the response re-bearing the submitted request's token.
    pub fn submit(&mut self, now: Instant, request: Message) -> Result<RequestId, ForwardError> {
        if self.closed {
            return Err(ForwardError::Closed);
        }
        if !request.is_request() {
            return Err(ForwardError::NotProxied);
        }
        let destination = match request.proxy_destination() {
            Ok(Some(destination)) => destination,
            Ok(None) => return Err(ForwardError::NotProxied),
            Err(e) => return Err(e.into()),
        };
        let id = RequestId(self.next_request);
        self.next_request += 1;
        let rewritten = rewrite_request(&request, &destination);
        let binding = self.bindings.insert(ProxyBinding::new(
            ClientLeg::Local {
                request: id,
                token: request.token,
            },
            destination.host().to_owned(),
            rewritten,
            now + self.config.max_transmit_wait(),
        ));
        self.stats.forwards += 1;
        trace!(request = %id, host = destination.host(), "forwarding local request");
        self.resolve(now, binding, destination);
        Ok(id)
    }

    /// Supply the outcome of a [`ProxyEvent::ResolveOrigin`] lookup
    ///
    /// `None` reports that the host has no usable address; the affected
    /// request fails as unresolvable. Late answers for requests that have
    /// already failed are ignored.
    pub fn origin_resolved(
        &mut self,
        now: Instant,
        binding: BindingHandle,
        address: Option<SocketAddr>,
    ) {
        if self.closed {
            return;
        }
        match address {
            Some(address) => self.origin_ready(now, binding, address),
            None => {
                let Some(host) = self.bindings.get(binding).map(|b| b.host.clone()) else {
                    return;
                };
                debug!(host, "origin did not resolve");
                self.fail_binding(now, binding, ForwardError::Unresolved(host));
            }
        }
    }

    /// Fail everything directed at `remote` after the transport declared it
    /// categorically unreachable
    ///
    /// Transient send errors should not come here; retransmission already
    /// covers those.
    pub fn transport_error(&mut self, now: Instant, remote: SocketAddr) {
        if self.closed {
            return;
        }
        for handle in self.exchanges.handles() {
            match self.exchanges.get(handle) {
                Some(x) if x.remote == remote && x.role == Role::OutboundPendingAck => {}
                _ => continue,
            }
            let Some(exchange) = self.retire_exchange(now, handle) else {
                continue;
            };
            match exchange.binding {
                Some(binding) if exchange.is_request => {
                    self.fail_binding(now, binding, ForwardError::Unreachable);
                }
                _ => debug!(%remote, id = %exchange.id, "dropping undeliverable response"),
            }
        }
        // catches bindings with no exchange in flight, like ones awaiting a
        // separate response
        for handle in self.bindings.handles() {
            let origin = self.bindings.get(handle).and_then(|b| b.origin);
            if origin.is_some_and(|(address, _)| address == remote) {
                self.fail_binding(now, handle, ForwardError::Unreachable);
            }
        }
    }

    /// Cancel every live exchange and binding
    ///
    /// Local submissions complete with [`ForwardError::Closed`]; network
    /// clients are not notified. Datagrams already queued for sending remain
    /// pollable, and everything arriving afterwards is ignored.
    pub fn close(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.closed = true;
        for handle in self.bindings.handles() {
            let Some(binding) = self.teardown_binding(now, handle) else {
                continue;
            };
            if let ClientLeg::Local { request, .. } = binding.client {
                self.stats.failures_reported += 1;
                self.events.push_back(ProxyEvent::Completed {
                    request,
                    result: Err(ForwardError::Closed),
                });
            }
        }
        for handle in self.exchanges.handles() {
            self.retire_exchange(now, handle);
        }
    }

    /// Number of live exchanges over both legs
    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    /// Number of requests currently being forwarded
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Running totals of proxy activity
    pub fn stats(&self) -> ProxyStats {
        self.stats
    }

    //
    // Inbound dispatch
    //

    /// Handle a confirmable or non-confirmable message, the kinds subject to
    /// deduplication
    fn on_transmission(&mut self, now: Instant, remote: SocketAddr, msg: Message) {
        if let Some(reply) = self
            .dedup
            .check(now, remote, msg.id)
            .map(|seen| seen.reply.clone())
        {
            self.stats.duplicates += 1;
            if msg.kind != MessageKind::Confirmable {
                trace!(%remote, id = %msg.id, "dropping duplicate");
            } else if let Some(datagram) = reply {
                trace!(%remote, id = %msg.id, "replaying reply for duplicate");
                self.transmits.push_back(Transmit {
                    destination: remote,
                    contents: datagram,
                });
            } else {
                trace!(%remote, id = %msg.id, "duplicate while the outcome is pending");
            }
            return;
        }
        self.dedup.insert(now, remote, msg.id, msg.kind);

        if msg.code.is_empty() {
            match msg.kind {
                MessageKind::Confirmable => {
                    // ping
                    trace!(%remote, id = %msg.id, "answering ping");
                    self.reply_empty(MessageKind::Reset, remote, msg.id);
                }
                _ => {
                    self.stats.malformed += 1;
                    trace!(%remote, id = %msg.id, "ignoring empty non-confirmable message");
                }
            }
        } else if msg.code.is_request() {
            self.on_request(now, remote, msg);
        } else if msg.code.is_response() {
            self.on_separate_response(now, remote, msg);
        } else {
            trace!(%remote, code = %msg.code, "rejecting reserved code class");
            if msg.kind == MessageKind::Confirmable {
                self.reply_empty(MessageKind::Reset, remote, msg.id);
            }
        }
    }

    fn on_request(&mut self, now: Instant, remote: SocketAddr, msg: Message) {
        let destination = match msg.proxy_destination() {
            Ok(Some(destination)) => destination,
            Ok(None) => {
                self.reject_request(now, remote, &msg, &ForwardError::NotProxied);
                return;
            }
            Err(e) => {
                debug!(%remote, id = %msg.id, "refusing proxy request: {e}");
                self.reject_request(now, remote, &msg, &e.into());
                return;
            }
        };

        let exchange = Exchange::inbound(msg.kind, remote, msg.id, msg.token);
        let exchange = match self.exchanges.register(exchange) {
            Ok(handle) => handle,
            Err(e) => {
                // dedup normally catches this; a shrunken window can let an
                // ID recur while its first exchange is still being served
                warn!("{e}");
                return;
            }
        };
        if msg.kind == MessageKind::Confirmable {
            if let Some(x) = self.exchanges.get_mut(exchange) {
                x.next_timeout = Some(now + self.config.empty_ack_delay);
            }
        }

        let rewritten = rewrite_request(&msg, &destination);
        let binding = self.bindings.insert(ProxyBinding::new(
            ClientLeg::Network {
                remote,
                id: msg.id,
                token: msg.token,
                kind: msg.kind,
                exchange,
            },
            destination.host().to_owned(),
            rewritten,
            now + self.config.max_transmit_wait(),
        ));
        if let Some(x) = self.exchanges.get_mut(exchange) {
            x.binding = Some(binding);
        }
        self.stats.forwards += 1;
        trace!(
            %remote,
            id = %msg.id,
            token = %msg.token,
            host = destination.host(),
            "forwarding request",
        );
        self.resolve(now, binding, destination);
    }

    /// Handle a response delivered outside an ack, matching it by token
    fn on_separate_response(&mut self, now: Instant, remote: SocketAddr, msg: Message) {
        let Some(binding) = self.bindings.lookup_response(remote, msg.token) else {
            self.stats.strays += 1;
            trace!(%remote, token = %msg.token, "response matches no forwarded request");
            if msg.kind == MessageKind::Confirmable {
                self.reply_empty(MessageKind::Reset, remote, msg.id);
            }
            return;
        };
        if msg.kind == MessageKind::Confirmable {
            self.reply_empty(MessageKind::Acknowledgement, remote, msg.id);
        }
        trace!(%remote, token = %msg.token, "separate response arrived");
        // completion also retires the request exchange if no bare ack ever did
        self.complete_binding(now, binding, Ok(msg));
    }

    fn on_ack(&mut self, now: Instant, remote: SocketAddr, msg: Message) {
        let Some(handle) = self.exchanges.lookup_by_id(remote, msg.id) else {
            self.stats.strays += 1;
            trace!(%remote, id = %msg.id, "stray ack");
            return;
        };
        match self.exchanges.get(handle) {
            Some(x) if x.role == Role::OutboundPendingAck => {}
            _ => {
                trace!(%remote, id = %msg.id, "ack for a message the peer did not receive from us");
                return;
            }
        }
        let Some(exchange) = self.retire_exchange(now, handle) else {
            return;
        };
        let Some(binding) = exchange.binding else {
            trace!(%remote, id = %msg.id, "response delivery confirmed");
            return;
        };
        if msg.code.is_empty() {
            if exchange.is_request {
                // the origin took the request; the outcome will come separately
                trace!(%remote, id = %msg.id, "origin acknowledged, awaiting separate response");
                if let Some(b) = self.bindings.get_mut(binding) {
                    b.state = BindingState::AckedAwaitingSeparate;
                    b.server_exchange = None;
                }
            }
        } else if msg.code.is_response() && exchange.is_request {
            trace!(%remote, id = %msg.id, code = %msg.code, "piggybacked response");
            self.complete_binding(now, binding, Ok(msg));
        } else {
            // a request code inside an ack; the deadline will clean up
            debug!(%remote, id = %msg.id, code = %msg.code, "ignoring ack with a nonsense code");
        }
    }

    fn on_reset(&mut self, now: Instant, remote: SocketAddr, msg: Message) {
        if !msg.code.is_empty() {
            self.stats.malformed += 1;
            trace!(%remote, id = %msg.id, "ignoring reset that is not empty");
            return;
        }
        let Some(handle) = self.exchanges.lookup_by_id(remote, msg.id) else {
            self.stats.strays += 1;
            trace!(%remote, id = %msg.id, "stray reset");
            return;
        };
        let role = match self.exchanges.get(handle) {
            Some(x) => x.role,
            None => return,
        };
        match role {
            Role::OutboundPendingAck => {
                let Some(exchange) = self.retire_exchange(now, handle) else {
                    return;
                };
                match exchange.binding {
                    Some(binding) if exchange.is_request => {
                        debug!(%remote, id = %msg.id, "origin reset the request");
                        self.fail_binding(now, binding, ForwardError::Rejected);
                    }
                    _ => debug!(%remote, id = %msg.id, "peer reset our response"),
                }
            }
            Role::InboundAwaitingResponse => {
                // the client withdrawing its own request
                debug!(%remote, id = %msg.id, "client canceled the request");
                let Some(exchange) = self.retire_exchange(now, handle) else {
                    return;
                };
                if let Some(binding) = exchange.binding {
                    self.teardown_binding(now, binding);
                }
            }
        }
    }

    //
    // Forwarding
    //

    /// Turn a destination into an origin address, asking the driver when the
    /// host is not an address literal
    fn resolve(&mut self, now: Instant, binding: BindingHandle, destination: ProxyDestination) {
        if let Ok(ip) = destination.host().parse::<IpAddr>() {
            self.origin_ready(now, binding, SocketAddr::new(ip, destination.port()));
            return;
        }
        self.events.push_back(ProxyEvent::ResolveOrigin {
            binding,
            host: destination.host().to_owned(),
            port: destination.port(),
        });
    }

    /// Send the pending server-leg request now that the origin is known
    fn origin_ready(&mut self, now: Instant, handle: BindingHandle, origin: SocketAddr) {
        let mut request = match self.bindings.get_mut(handle) {
            Some(binding) if binding.state == BindingState::Resolving => {
                match binding.pending_request.take() {
                    Some(request) => request,
                    None => return,
                }
            }
            _ => return,
        };

        // fresh identifiers towards the origin; the client's never cross over
        let Some(id) = self.allocate_id(now, origin) else {
            self.fail_binding(now, handle, ForwardError::IdsExhausted);
            return;
        };
        let token = loop {
            let token = Token::random(&mut self.rng);
            if self.exchanges.lookup_by_token(origin, token).is_none()
                && self.bindings.lookup_response(origin, token).is_none()
            {
                break token;
            }
        };
        request.id = id;
        request.token = token;
        let datagram = request.encode();

        let mut exchange = Exchange::outbound(request.kind, true, origin, id, token, datagram.clone());
        if request.kind == MessageKind::Confirmable {
            exchange.interval = reliability::initial_interval(&self.config, &mut self.rng);
            exchange.next_timeout = Some(now + exchange.interval);
        }
        exchange.binding = Some(handle);
        let exchange = match self.exchanges.register(exchange) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%origin, "{e}");
                self.fail_binding(now, handle, ForwardError::IdsExhausted);
                return;
            }
        };
        self.bindings.bind_origin(handle, origin, token);
        if let Some(binding) = self.bindings.get_mut(handle) {
            binding.state = BindingState::AwaitingResponse;
            binding.server_exchange = Some(exchange);
        }
        trace!(%origin, %id, %token, "request sent to origin");
        self.transmits.push_back(Transmit {
            destination: origin,
            contents: datagram,
        });
    }

    /// Answer a request that will not be forwarded
    fn reject_request(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        msg: &Message,
        error: &ForwardError,
    ) {
        self.stats.rejected += 1;
        let code = failure_code(error);
        let response = match msg.kind {
            MessageKind::Confirmable => {
                Message::new(MessageKind::Acknowledgement, code, msg.id, msg.token)
            }
            _ => {
                let Some(id) = self.allocate_id(now, remote) else {
                    return;
                };
                self.recent_ids.insert(now, remote, id);
                Message::new(MessageKind::NonConfirmable, code, id, msg.token)
            }
        };
        let datagram = response.encode();
        self.dedup.remember_reply(remote, msg.id, datagram.clone());
        self.transmits.push_back(Transmit {
            destination: remote,
            contents: datagram,
        });
    }

    /// Retire a binding and both leg exchanges, dispatching the outcome to
    /// the client leg
    fn complete_binding(
        &mut self,
        now: Instant,
        handle: BindingHandle,
        outcome: Result<Message, ForwardError>,
    ) {
        // the ack state of the client leg decides the response form, so read
        // it before the teardown
        let empty_ack_sent = match self.bindings.get(handle) {
            Some(binding) => match &binding.client {
                ClientLeg::Network { exchange, .. } => self
                    .exchanges
                    .get(*exchange)
                    .map_or(true, |x| x.empty_ack_sent),
                ClientLeg::Local { .. } => false,
            },
            None => return,
        };
        let Some(binding) = self.teardown_binding(now, handle) else {
            return;
        };
        match binding.client {
            ClientLeg::Local { request, token } => {
                let result = outcome.map(|mut response| {
                    response.token = token;
                    response
                });
                match &result {
                    Ok(_) => self.stats.responses_relayed += 1,
                    Err(e) => {
                        debug!(%request, "completing with failure: {e}");
                        self.stats.failures_reported += 1;
                    }
                }
                self.events.push_back(ProxyEvent::Completed { request, result });
            }
            ClientLeg::Network {
                remote,
                id,
                token,
                kind,
                ..
            } => {
                let (code, options, payload) = match outcome {
                    Ok(response) => {
                        self.stats.responses_relayed += 1;
                        (
                            response.code,
                            response.all_options().to_vec(),
                            response.payload,
                        )
                    }
                    Err(e) => {
                        debug!(%remote, %id, "reporting failure to client: {e}");
                        self.stats.failures_reported += 1;
                        (failure_code(&e), Vec::new(), Bytes::new())
                    }
                };
                self.dispatch_response(
                    now,
                    remote,
                    id,
                    token,
                    kind,
                    empty_ack_sent,
                    code,
                    options,
                    payload,
                );
            }
        }
    }

    fn fail_binding(&mut self, now: Instant, handle: BindingHandle, error: ForwardError) {
        self.complete_binding(now, handle, Err(error));
    }

    /// Retire a binding and both leg exchanges without dispatching anything
    fn teardown_binding(&mut self, now: Instant, handle: BindingHandle) -> Option<ProxyBinding> {
        let binding = self.bindings.retire(handle)?;
        if let Some(exchange) = binding.server_exchange {
            self.retire_exchange(now, exchange);
        }
        if let ClientLeg::Network { exchange, .. } = &binding.client {
            self.retire_exchange(now, *exchange);
        }
        Some(binding)
    }

    /// Send the outcome of a forwarded request back to a network client
    #[allow(clippy::too_many_arguments)]
    fn dispatch_response(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        id: MessageId,
        token: Token,
        kind: MessageKind,
        empty_ack_sent: bool,
        code: Code,
        options: Vec<CoapOption>,
        payload: Bytes,
    ) {
        let build = |kind, id| {
            let mut response = Message::new(kind, code, id, token);
            for opt in &options {
                response.add_option(opt.number, opt.value.clone());
            }
            response.payload = payload.clone();
            response
        };
        match (kind, empty_ack_sent) {
            (MessageKind::Confirmable, false) => {
                // the outcome rides piggybacked on the ack
                let datagram = build(MessageKind::Acknowledgement, id).encode();
                trace!(%remote, %id, %code, "responding in the ack");
                self.dedup.remember_reply(remote, id, datagram.clone());
                self.transmits.push_back(Transmit {
                    destination: remote,
                    contents: datagram,
                });
            }
            (MessageKind::Confirmable, true) => {
                // already acked; the outcome needs a confirmable of its own
                let Some(response_id) = self.allocate_id(now, remote) else {
                    return;
                };
                let datagram = build(MessageKind::Confirmable, response_id).encode();
                let mut exchange = Exchange::outbound(
                    MessageKind::Confirmable,
                    false,
                    remote,
                    response_id,
                    token,
                    datagram.clone(),
                );
                exchange.interval = reliability::initial_interval(&self.config, &mut self.rng);
                exchange.next_timeout = Some(now + exchange.interval);
                if let Err(e) = self.exchanges.register(exchange) {
                    warn!(%remote, "{e}");
                    return;
                }
                trace!(%remote, id = %response_id, %code, "responding separately");
                self.transmits.push_back(Transmit {
                    destination: remote,
                    contents: datagram,
                });
            }
            (MessageKind::NonConfirmable, _) => {
                let Some(response_id) = self.allocate_id(now, remote) else {
                    return;
                };
                self.recent_ids.insert(now, remote, response_id);
                let datagram = build(MessageKind::NonConfirmable, response_id).encode();
                trace!(%remote, id = %response_id, %code, "responding non-confirmably");
                self.transmits.push_back(Transmit {
                    destination: remote,
                    contents: datagram,
                });
            }
            _ => unreachable!("client legs only carry requests"),
        }
    }

    //
    // Plumbing
    //

    /// Send a bare ack or reset for a peer's message and remember it for
    /// duplicates of that message
    fn reply_empty(&mut self, kind: MessageKind, remote: SocketAddr, id: MessageId) {
        let datagram = Message::empty(kind, id).encode();
        self.dedup.remember_reply(remote, id, datagram.clone());
        self.transmits.push_back(Transmit {
            destination: remote,
            contents: datagram,
        });
    }

    /// Retire an exchange, quarantining our own message IDs against reuse
    fn retire_exchange(&mut self, now: Instant, handle: ExchangeHandle) -> Option<Exchange> {
        let exchange = self.exchanges.retire(handle)?;
        if exchange.role == Role::OutboundPendingAck {
            self.recent_ids.insert(now, exchange.remote, exchange.id);
        }
        self.stats.exchanges_retired += 1;
        Some(exchange)
    }

    /// Pick a message ID neither live nor quarantined towards `remote`
    fn allocate_id(&mut self, now: Instant, remote: SocketAddr) -> Option<MessageId> {
        for _ in 0..=u16::MAX as u32 {
            let id = MessageId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if self.exchanges.contains_id(remote, id) || self.recent_ids.contains(now, remote, id) {
                continue;
            }
            return Some(id);
        }
        warn!(%remote, "message ID space towards peer is exhausted");
        None
    }
}

/// Things the driver must act on, drained through [`Proxy::poll_event`]
#[derive(Debug)]
pub enum ProxyEvent {
    /// `host` needs resolving; answer through [`Proxy::origin_resolved`]
    ResolveOrigin {
        /// The forwarded request waiting on this lookup
        binding: BindingHandle,
        /// Host name to resolve
        host: String,
        /// Port the origin is expected on
        port: u16,
    },
    /// A request submitted through [`Proxy::submit`] has finished
    Completed {
        /// The id [`Proxy::submit`] returned
        request: RequestId,
        /// The origin's response, or why there is none
        result: Result<Message, ForwardError>,
    },
}

/// Running totals of proxy activity
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct ProxyStats {
    /// Requests accepted for forwarding, over both client kinds
    pub forwards: u64,
    /// Messages discarded because their ID was seen within the window
    pub duplicates: u64,
    /// Datagrams or messages that did not parse
    pub malformed: u64,
    /// Acks, resets and responses that matched nothing
    pub strays: u64,
    /// Confirmable messages sent again after a timeout
    pub retransmits: u64,
    /// Exchanges removed from the tracker, over both legs
    pub exchanges_retired: u64,
    /// Origin responses dispatched back to clients
    pub responses_relayed: u64,
    /// Failure outcomes dispatched to clients
    pub failures_reported: u64,
    /// Requests refused without creating a forwarding binding
    pub rejected: u64,
}
