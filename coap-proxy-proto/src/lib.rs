//! Protocol logic for a CoAP forwarding proxy
//!
//! coap-proxy-proto contains a fully deterministic implementation of the
//! message-layer reliability and forwarding logic of a CoAP (RFC 7252) forward
//! proxy. It contains no networking code and does not get any timestamps from
//! the operating system. Most users may want to use the tokio-based coap-proxy
//! API instead.
//!
//! The entry point is [`Proxy`]: the driver feeds it inbound datagrams and
//! clock readings, and drains outbound datagrams and events from it. See the
//! method documentation on [`Proxy`] for the contract.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]

use std::net::SocketAddr;

use bytes::Bytes;

#[doc(hidden)]
pub mod coding;

mod config;
pub use crate::config::{ConfigError, TransmissionConfig};

mod exchange;

mod forward;
pub use crate::forward::{BindingHandle, ForwardError, RequestId};

mod message;
pub use crate::message::{
    option, CoapOption, Code, InvalidDestination, Message, MessageError, MessageId, MessageKind,
    ProxyDestination, Token,
};

mod proxy;
pub use crate::proxy::{Proxy, ProxyEvent, ProxyStats};

mod reliability;

#[cfg(test)]
mod tests;

/// An outbound datagram the driver must put on the wire
#[derive(Debug, Clone)]
pub struct Transmit {
    /// The address the datagram must be sent to
    pub destination: SocketAddr,
    /// Encoded message
    pub contents: Bytes,
}

/// The default UDP port for the `coap` scheme
pub const DEFAULT_PORT: u16 = 5683;

/// Longest permitted token, in bytes
pub const MAX_TOKEN_LEN: usize = 8;
