//! Tokio-based CoAP forwarding proxy
//!
//! This crate drives the deterministic coap-proxy-proto state machine over a
//! real UDP socket: it owns the socket, resolves origin host names, and runs
//! the single event loop that feeds datagrams and timer expirations to the
//! protocol logic. The entry point is [`ProxyEndpoint`].
//!
//! ```no_run
//! use coap_proxy::{Code, Message, MessageId, MessageKind, ProxyEndpoint, Token, option};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = ProxyEndpoint::bind("0.0.0.0:5683".parse()?).await?;
//!     // clients on the network are served by the background task; the handle
//!     // can also originate requests of its own:
//!     let mut request = Message::new(
//!         MessageKind::Confirmable,
//!         Code::GET,
//!         MessageId(0),
//!         Token::new(&[0x42])?,
//!     );
//!     request.add_option(option::PROXY_URI, &b"coap://origin.example/sensors/temp"[..]);
//!     let response = proxy.forward(request).await?;
//!     println!("{:?}: {:?}", response.code, response.payload);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod endpoint;

pub use proto::{
    option, CoapOption, Code, ConfigError, ForwardError, InvalidDestination, Message, MessageError,
    MessageId, MessageKind, ProxyDestination, Token, TransmissionConfig, DEFAULT_PORT,
    MAX_TOKEN_LEN,
};

pub use crate::endpoint::ProxyEndpoint;
