use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;

use crate::{
    config::TransmissionConfig,
    exchange::{Exchange, Role},
    message::{MessageId, MessageKind},
};

/// Draw the initial retransmission interval for a confirmable message
///
/// Uniform over `ack_timeout * [1, ack_random_factor]`, sampled once per
/// exchange. Doubling from a randomized base keeps independent exchanges from
/// synchronizing their retransmissions.
pub(crate) fn initial_interval<R: Rng>(config: &TransmissionConfig, rng: &mut R) -> Duration {
    config
        .ack_timeout
        .mul_f32(rng.gen_range(1.0..=config.ack_random_factor))
}

/// Outcome of a reliability timer firing
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TimerVerdict {
    /// Send the retained datagram again and wait twice as long
    Retransmit,
    /// Give up on the exchange
    Exhausted,
    /// Acknowledge an inbound request whose outcome is still pending
    EmptyAck,
}

/// Advance an exchange whose reliability timer has fired
///
/// Pure state transition; the caller performs the sends and retirements the
/// verdict asks for.
pub(crate) fn on_timeout(
    exchange: &mut Exchange,
    now: Instant,
    config: &TransmissionConfig,
) -> TimerVerdict {
    match exchange.role {
        Role::InboundAwaitingResponse => {
            exchange.next_timeout = None;
            TimerVerdict::EmptyAck
        }
        Role::OutboundPendingAck => {
            if exchange.kind != MessageKind::Confirmable
                || exchange.retransmits >= config.max_retransmit
            {
                exchange.next_timeout = None;
                return TimerVerdict::Exhausted;
            }
            exchange.retransmits += 1;
            exchange.interval *= 2;
            exchange.next_timeout = Some(now + exchange.interval);
            TimerVerdict::Retransmit
        }
    }
}

/// Remembered handling of a recently received message
#[derive(Debug)]
pub(crate) struct SeenMessage {
    pub(crate) kind: MessageKind,
    /// The exact reply datagram already sent for it, if any
    pub(crate) reply: Option<Bytes>,
    expires: Instant,
}

/// Sliding window of message IDs recently received from each peer
///
/// A confirmable retransmission must be answered with the same reply it got
/// the first time, without reprocessing; non-confirmable duplicates are
/// dropped. Entries expire `window` after insertion, after which the ID may
/// legitimately be reused by the peer.
pub(crate) struct DedupCache {
    window: Duration,
    seen: FxHashMap<(SocketAddr, MessageId), SeenMessage>,
    expiries: VecDeque<(Instant, (SocketAddr, MessageId))>,
}

impl DedupCache {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            seen: FxHashMap::default(),
            expiries: VecDeque::new(),
        }
    }

    /// Look up a previously seen message, ignoring expired entries
    pub(crate) fn check(
        &self,
        now: Instant,
        remote: SocketAddr,
        id: MessageId,
    ) -> Option<&SeenMessage> {
        self.seen
            .get(&(remote, id))
            .filter(|entry| entry.expires > now)
    }

    pub(crate) fn insert(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        id: MessageId,
        kind: MessageKind,
    ) {
        let expires = now + self.window;
        self.seen.insert(
            (remote, id),
            SeenMessage {
                kind,
                reply: None,
                expires,
            },
        );
        self.expiries.push_back((expires, (remote, id)));
    }

    /// Attach the reply sent for a message, for replay towards retransmissions
    pub(crate) fn remember_reply(&mut self, remote: SocketAddr, id: MessageId, reply: Bytes) {
        if let Some(entry) = self.seen.get_mut(&(remote, id)) {
            entry.reply = Some(reply);
        }
    }

    /// Drop entries whose window has passed
    ///
    /// Called opportunistically; correctness does not depend on it since
    /// lookups filter expired entries themselves.
    pub(crate) fn prune(&mut self, now: Instant) {
        while let Some(&(expires, key)) = self.expiries.front() {
            if expires > now {
                break;
            }
            self.expiries.pop_front();
            // the key may have been reinserted with a fresher deadline
            if self.seen.get(&key).is_some_and(|entry| entry.expires <= now) {
                self.seen.remove(&key);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Message IDs the proxy itself used recently towards each peer
///
/// An ID stays quarantined for a while after its exchange ends, or a
/// straggling ack for the old message could be taken as answering a new one.
pub(crate) struct RecentIds {
    lifetime: Duration,
    ids: FxHashMap<(SocketAddr, MessageId), Instant>,
    expiries: VecDeque<(Instant, (SocketAddr, MessageId))>,
}

impl RecentIds {
    pub(crate) fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            ids: FxHashMap::default(),
            expiries: VecDeque::new(),
        }
    }

    pub(crate) fn insert(&mut self, now: Instant, remote: SocketAddr, id: MessageId) {
        let expires = now + self.lifetime;
        self.ids.insert((remote, id), expires);
        self.expiries.push_back((expires, (remote, id)));
    }

    pub(crate) fn contains(&self, now: Instant, remote: SocketAddr, id: MessageId) -> bool {
        self.ids
            .get(&(remote, id))
            .is_some_and(|&expires| expires > now)
    }

    pub(crate) fn prune(&mut self, now: Instant) {
        while let Some(&(expires, key)) = self.expiries.front() {
            if expires > now {
                break;
            }
            self.expiries.pop_front();
            if self.ids.get(&key).is_some_and(|&e| e <= now) {
                self.ids.remove(&key);
            }
        }
    }
}
