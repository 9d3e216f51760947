use std::time::Duration;

use thiserror::Error;

/// Parameters governing message-layer reliability and exchange lifetimes
///
/// Defaults follow the transmission parameters recommended for constrained
/// networks. Lowering the timers speeds up failure detection at the cost of
/// spurious retransmissions on slow links; both legs of every proxied request
/// use the same parameters.
#[derive(Debug, Clone)]
pub struct TransmissionConfig {
    pub(crate) ack_timeout: Duration,
    pub(crate) ack_random_factor: f32,
    pub(crate) max_retransmit: u32,
    pub(crate) empty_ack_delay: Duration,
    pub(crate) exchange_lifetime: Duration,
    pub(crate) message_id_lifetime: Duration,
}

impl TransmissionConfig {
    /// Base timeout before the first retransmission of a confirmable message
    ///
    /// The effective initial timeout is drawn uniformly from `ack_timeout *
    /// [1, ack_random_factor]` and doubles after every retransmission.
    pub fn ack_timeout(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.is_zero() {
            return Err(ConfigError::OutOfBounds);
        }
        self.ack_timeout = value;
        Ok(self)
    }

    /// Randomization factor applied to the initial retransmission timeout
    ///
    /// Must be at least 1.0. Spreads out retransmissions from populations of
    /// clients that start exchanges in lockstep.
    pub fn ack_random_factor(&mut self, value: f32) -> Result<&mut Self, ConfigError> {
        if !(1.0..=16.0).contains(&value) {
            return Err(ConfigError::OutOfBounds);
        }
        self.ack_random_factor = value;
        Ok(self)
    }

    /// Number of retransmissions after the initial transmission of a confirmable message
    pub fn max_retransmit(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value > 16 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_retransmit = value;
        Ok(self)
    }

    /// How long to wait for a forwarded outcome before acknowledging an
    /// inbound confirmable request with a bare ack
    ///
    /// Once the bare ack has gone out, the eventual outcome must travel in a
    /// confirmable response of its own rather than piggybacking on the ack.
    pub fn empty_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.empty_ack_delay = value;
        self
    }

    /// How long a received message ID stays in the deduplication window
    ///
    /// This is the EXCHANGE_LIFETIME of RFC 7252, elsewhere called the
    /// deduplication window: the longest a duplicate of a received message
    /// can lag behind its first copy and still be recognized.
    pub fn exchange_lifetime(&mut self, value: Duration) -> &mut Self {
        self.exchange_lifetime = value;
        self
    }

    /// How long a message ID the proxy itself sent is quarantined from reuse
    /// towards the same peer after its exchange ends
    ///
    /// The maximum message ID lifetime; reusing an ID sooner would let a
    /// delayed ack or reset land on an unrelated exchange.
    pub fn message_id_lifetime(&mut self, value: Duration) -> &mut Self {
        self.message_id_lifetime = value;
        self
    }

    /// Upper bound on the time spent transmitting one confirmable message,
    /// from the first transmission to giving up on the last
    pub(crate) fn max_transmit_wait(&self) -> Duration {
        let spans = 2u32.saturating_pow(self.max_retransmit + 1) - 1;
        (self.ack_timeout * spans).mul_f32(self.ack_random_factor)
    }
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            empty_ack_delay: Duration::from_millis(100),
            exchange_lifetime: Duration::from_secs(247),
            message_id_lifetime: Duration::from_secs(247),
        }
    }
}

/// Errors in the configuration of a proxy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}
