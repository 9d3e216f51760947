use std::{fmt, io, str};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    DEFAULT_PORT, MAX_TOKEN_LEN,
};

/// The layer 2 message type, encoded in the two type bits of the header
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MessageKind {
    /// Retransmitted until the peer acknowledges or rejects it
    Confirmable = 0,
    /// Best-effort delivery, never acknowledged
    NonConfirmable = 1,
    /// Acknowledges the confirmable message carrying the same ID
    Acknowledgement = 2,
    /// Rejects the message carrying the same ID
    Reset = 3,
}

impl MessageKind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// A request method or response status, packed as 3 class bits and 5 detail bits
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Code(u8);

impl Code {
    /// Build a code from its dotted `class.detail` form
    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1f))
    }

    /// The class component, `0` for requests and `2`, `4` or `5` for responses
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The detail component
    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    /// Whether this is the empty code `0.00` used by acks, resets and pings
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether this code names a request method
    pub const fn is_request(self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    /// Whether this code names a response status
    pub const fn is_response(self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }
}

impl coding::Codec for Code {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get::<u8>()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write::<u8>(self.0);
    }
}

impl From<Code> for u8 {
    fn from(x: Code) -> Self {
        x.0
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

macro_rules! codes {
    {$($name:ident($class:expr, $detail:expr) $desc:expr;)*} => {
        impl Code {
            $(#[doc = $desc] pub const $name: Self = Self::new($class, $detail);)*
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$name => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Code({})", self),
                }
            }
        }
    }
}

codes! {
    EMPTY(0, 0) "Empty message";
    GET(0, 1) "GET method";
    POST(0, 2) "POST method";
    PUT(0, 3) "PUT method";
    DELETE(0, 4) "DELETE method";
    CREATED(2, 1) "Created";
    DELETED(2, 2) "Deleted";
    VALID(2, 3) "Valid";
    CHANGED(2, 4) "Changed";
    CONTENT(2, 5) "Content";
    BAD_REQUEST(4, 0) "Bad Request";
    UNAUTHORIZED(4, 1) "Unauthorized";
    BAD_OPTION(4, 2) "Bad Option";
    FORBIDDEN(4, 3) "Forbidden";
    NOT_FOUND(4, 4) "Not Found";
    METHOD_NOT_ALLOWED(4, 5) "Method Not Allowed";
    NOT_ACCEPTABLE(4, 6) "Not Acceptable";
    PRECONDITION_FAILED(4, 12) "Precondition Failed";
    REQUEST_ENTITY_TOO_LARGE(4, 13) "Request Entity Too Large";
    UNSUPPORTED_CONTENT_FORMAT(4, 15) "Unsupported Content-Format";
    INTERNAL_SERVER_ERROR(5, 0) "Internal Server Error";
    NOT_IMPLEMENTED(5, 1) "Not Implemented";
    BAD_GATEWAY(5, 2) "Bad Gateway";
    SERVICE_UNAVAILABLE(5, 3) "Service Unavailable";
    GATEWAY_TIMEOUT(5, 4) "Gateway Timeout";
    PROXYING_NOT_SUPPORTED(5, 5) "Proxying Not Supported";
}

/// Identifies a message for acknowledgement and duplicate detection, scoped to a peer address
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u16);

impl coding::Codec for MessageId {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get::<u16>()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write::<u16>(self.0);
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Request/response correlation value of up to [`MAX_TOKEN_LEN`] bytes
///
/// Tokens are opaque to the protocol and only compared for equality, scoped to
/// the peer address they were exchanged with.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_LEN],
}

impl Token {
    /// The zero-length token
    pub const fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0; MAX_TOKEN_LEN],
        }
    }

    /// Construct a token from `bytes`
    ///
    /// Fails with [`MessageError::TokenTooLong`] when `bytes` exceeds
    /// [`MAX_TOKEN_LEN`].
    pub fn new(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() > MAX_TOKEN_LEN {
            return Err(MessageError::TokenTooLong(bytes.len()));
        }
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_TOKEN_LEN],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(res)
    }

    /// Generate a full-length random token
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let mut res = Self {
            len: MAX_TOKEN_LEN as u8,
            bytes: [0; MAX_TOKEN_LEN],
        };
        rng.fill_bytes(&mut res.bytes);
        res
    }
}

impl ::std::ops::Deref for Token {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len == 0 {
            return f.write_str("empty");
        }
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A single option instance
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CoapOption {
    /// Option number from the IANA registry, see the [`option`] module
    pub number: u16,
    /// Raw option value
    pub value: Vec<u8>,
}

/// Option numbers from the IANA CoAP registry
pub mod option {
    /// If-Match
    pub const IF_MATCH: u16 = 1;
    /// Uri-Host
    pub const URI_HOST: u16 = 3;
    /// ETag
    pub const ETAG: u16 = 4;
    /// If-None-Match
    pub const IF_NONE_MATCH: u16 = 5;
    /// Uri-Port
    pub const URI_PORT: u16 = 7;
    /// Location-Path
    pub const LOCATION_PATH: u16 = 8;
    /// Uri-Path
    pub const URI_PATH: u16 = 11;
    /// Content-Format
    pub const CONTENT_FORMAT: u16 = 12;
    /// Max-Age
    pub const MAX_AGE: u16 = 14;
    /// Uri-Query
    pub const URI_QUERY: u16 = 15;
    /// Accept
    pub const ACCEPT: u16 = 17;
    /// Location-Query
    pub const LOCATION_QUERY: u16 = 20;
    /// Proxy-Uri
    pub const PROXY_URI: u16 = 35;
    /// Proxy-Scheme
    pub const PROXY_SCHEME: u16 = 39;
    /// Size1
    pub const SIZE1: u16 = 60;
}

/// A parsed message
///
/// The option list is kept sorted by option number, preserving insertion order
/// among instances of the same number, so that encoding can always emit
/// non-negative deltas.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    /// Reliability class of this message
    pub kind: MessageKind,
    /// Method or status
    pub code: Code,
    /// Peer-scoped identifier for acknowledgement and deduplication
    pub id: MessageId,
    /// Peer-scoped correlation value tying responses to requests
    pub token: Token,
    options: Vec<CoapOption>,
    /// Representation payload, possibly empty
    pub payload: Bytes,
}

impl Message {
    /// Construct a message with no options and an empty payload
    pub fn new(kind: MessageKind, code: Code, id: MessageId, token: Token) -> Self {
        Self {
            kind,
            code,
            id,
            token,
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Construct an empty message, as used by acks, resets and pings
    pub fn empty(kind: MessageKind, id: MessageId) -> Self {
        Self::new(kind, Code::EMPTY, id, Token::empty())
    }

    /// Insert an option instance, keeping the option list sorted
    pub fn add_option(&mut self, number: u16, value: impl Into<Vec<u8>>) {
        let index = self.options.partition_point(|opt| opt.number <= number);
        self.options.insert(
            index,
            CoapOption {
                number,
                value: value.into(),
            },
        );
    }

    /// The value of the first instance of option `number`, if any
    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options(number).next()
    }

    /// The values of every instance of option `number`, in insertion order
    pub fn options(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |opt| opt.number == number)
            .map(|opt| opt.value.as_slice())
    }

    /// All options carried by this message, sorted by number
    pub fn all_options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Whether the code names a request method
    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    /// Whether the code names a response status
    pub fn is_response(&self) -> bool {
        self.code.is_response()
    }

    /// Serialize into a datagram
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            4 + self.token.len() + self.payload.len() + 8 * self.options.len() + 1,
        );
        buf.put_u8(VERSION << 6 | (self.kind as u8) << 4 | self.token.len() as u8);
        buf.write(self.code);
        buf.write(self.id);
        buf.put_slice(&self.token);
        let mut previous = 0;
        for opt in &self.options {
            encode_option_header(&mut buf, (opt.number - previous) as u32, opt.value.len());
            buf.put_slice(&opt.value);
            previous = opt.number;
        }
        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }
        buf.freeze()
    }

    /// Parse a datagram
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        // a plain slice has an inherent `get` that would shadow `BufExt::get`
        let mut buf = io::Cursor::new(data);
        let first = buf.get::<u8>()?;
        let version = first >> 6;
        if version != VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let kind = MessageKind::from_bits(first >> 4);
        let token_len = first & 0x0f;
        if token_len as usize > MAX_TOKEN_LEN {
            return Err(MessageError::InvalidTokenLength(token_len));
        }
        let code = buf.get::<Code>()?;
        let id = buf.get::<MessageId>()?;
        if code.is_empty() && (token_len != 0 || buf.has_remaining()) {
            return Err(MessageError::EmptyWithData);
        }
        let token = Token::new(&buf.get_bytes(token_len as usize)?)?;

        let mut options = Vec::new();
        let mut number = 0u32;
        let mut payload = Bytes::new();
        while buf.has_remaining() {
            let header = buf.get::<u8>()?;
            if header == PAYLOAD_MARKER {
                if !buf.has_remaining() {
                    return Err(MessageError::MissingPayload);
                }
                let len = buf.remaining();
                payload = buf.copy_to_bytes(len);
                break;
            }
            number += decode_extended(&mut buf, header >> 4)?;
            if number > u16::MAX as u32 {
                return Err(MessageError::OptionOutOfRange);
            }
            let length = decode_extended(&mut buf, header & 0x0f)?;
            options.push(CoapOption {
                number: number as u16,
                value: buf.get_bytes(length as usize)?,
            });
        }

        Ok(Self {
            kind,
            code,
            id,
            token,
            options,
            payload,
        })
    }

    /// Extract the proxy destination this request names, if any
    ///
    /// Returns `Ok(None)` for requests that do not address the proxying role at
    /// all, and an error for ones that do but cannot be satisfied.
    pub fn proxy_destination(&self) -> Result<Option<ProxyDestination>, InvalidDestination> {
        if let Some(value) = self.option(option::PROXY_URI) {
            let uri = str::from_utf8(value).map_err(|_| InvalidDestination::Malformed)?;
            return parse_proxy_uri(uri).map(Some);
        }
        let Some(value) = self.option(option::PROXY_SCHEME) else {
            return Ok(None);
        };
        let scheme = str::from_utf8(value).map_err(|_| InvalidDestination::Malformed)?;
        if !scheme.eq_ignore_ascii_case("coap") {
            return Err(InvalidDestination::UnsupportedScheme(scheme.to_owned()));
        }
        let host = self
            .option(option::URI_HOST)
            .filter(|v| !v.is_empty())
            .ok_or(InvalidDestination::MissingHost)?;
        let host = str::from_utf8(host)
            .map_err(|_| InvalidDestination::Malformed)?
            .to_owned();
        let port = match self.option(option::URI_PORT) {
            None => DEFAULT_PORT,
            Some(value) => uint_option(value)
                .and_then(|v| u16::try_from(v).ok())
                .ok_or(InvalidDestination::Malformed)?,
        };
        Ok(Some(ProxyDestination::Scheme { host, port }))
    }
}

/// Where a proxy request asks to be forwarded, in either of the two wire forms
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProxyDestination {
    /// Decomposed from a Proxy-Uri option
    Uri {
        /// Origin host name or address literal
        host: String,
        /// Origin UDP port
        port: u16,
        /// Decoded path segments
        path: Vec<String>,
        /// Decoded query arguments
        query: Vec<String>,
    },
    /// Assembled from Proxy-Scheme plus the Uri-Host and Uri-Port options
    Scheme {
        /// Origin host name or address literal
        host: String,
        /// Origin UDP port
        port: u16,
    },
}

impl ProxyDestination {
    /// Origin host name or address literal
    pub fn host(&self) -> &str {
        match self {
            Self::Uri { host, .. } | Self::Scheme { host, .. } => host,
        }
    }

    /// Origin UDP port
    pub fn port(&self) -> u16 {
        match self {
            Self::Uri { port, .. } | Self::Scheme { port, .. } => *port,
        }
    }
}

/// Reasons a request addressed to the proxying role cannot be forwarded
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum InvalidDestination {
    /// Only `coap` origins can be reached
    #[error("unsupported proxy scheme {0:?}")]
    UnsupportedScheme(String),
    /// Proxy-Scheme given without a usable Uri-Host
    #[error("destination host missing")]
    MissingHost,
    /// Destination options that do not parse
    #[error("malformed destination options")]
    Malformed,
}

/// Errors produced when parsing a datagram
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum MessageError {
    /// The datagram ended in the middle of a field
    #[error("datagram ended before a complete message was read")]
    UnexpectedEnd,
    /// The two version bits held something other than 1
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    /// The token length field exceeded [`MAX_TOKEN_LEN`]
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),
    /// A token longer than [`MAX_TOKEN_LEN`] bytes was supplied
    #[error("token of {0} bytes is too long")]
    TokenTooLong(usize),
    /// An option header used the reserved nibble value 15
    #[error("reserved option nibble")]
    ReservedOption,
    /// Accumulated option deltas left the representable range
    #[error("option number out of range")]
    OptionOutOfRange,
    /// A payload marker with nothing after it
    #[error("payload marker not followed by payload")]
    MissingPayload,
    /// A message with code 0.00 carried a token, options or payload
    #[error("empty message carries data beyond the header")]
    EmptyWithData,
}

impl From<coding::UnexpectedEnd> for MessageError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

fn decode_extended(buf: &mut impl Buf, nibble: u8) -> Result<u32, MessageError> {
    match nibble {
        0..=12 => Ok(nibble as u32),
        13 => Ok(13 + buf.get::<u8>()? as u32),
        14 => Ok(269 + buf.get::<u16>()? as u32),
        _ => Err(MessageError::ReservedOption),
    }
}

fn encode_option_header(buf: &mut BytesMut, delta: u32, length: usize) {
    let (delta_nibble, delta_ext) = extended_nibble(delta);
    let (length_nibble, length_ext) = extended_nibble(length as u32);
    buf.put_u8(delta_nibble << 4 | length_nibble);
    for ext in [delta_ext, length_ext] {
        match ext {
            Extension::None => {}
            Extension::One(x) => buf.put_u8(x),
            Extension::Two(x) => buf.put_u16(x),
        }
    }
}

enum Extension {
    None,
    One(u8),
    Two(u16),
}

fn extended_nibble(value: u32) -> (u8, Extension) {
    debug_assert!(value <= 269 + u16::MAX as u32);
    match value {
        0..=12 => (value as u8, Extension::None),
        13..=268 => (13, Extension::One((value - 13) as u8)),
        _ => (14, Extension::Two((value - 269) as u16)),
    }
}

/// Decode a variable-length unsigned integer option value
pub(crate) fn uint_option(value: &[u8]) -> Option<u64> {
    if value.len() > 8 {
        return None;
    }
    Some(value.iter().fold(0, |acc, &b| acc << 8 | b as u64))
}

fn parse_proxy_uri(uri: &str) -> Result<ProxyDestination, InvalidDestination> {
    let (scheme, rest) = uri.split_once("://").ok_or(InvalidDestination::Malformed)?;
    if !scheme.eq_ignore_ascii_case("coap") {
        return Err(InvalidDestination::UnsupportedScheme(scheme.to_owned()));
    }
    let (authority, tail) = match rest.find(['/', '?']) {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let (host, port) = parse_authority(authority)?;
    let (path_part, query_part) = match tail.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (tail, None),
    };
    let path = path_part
        .split('/')
        .filter(|s| !s.is_empty())
        .map(percent_decode)
        .collect::<Result<_, _>>()?;
    let query = query_part
        .map(|q| q.split('&').map(percent_decode).collect())
        .transpose()?
        .unwrap_or_default();
    Ok(ProxyDestination::Uri {
        host,
        port,
        path,
        query,
    })
}

fn parse_authority(authority: &str) -> Result<(String, u16), InvalidDestination> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        // IPv6 literal
        let (host, rest) = rest.split_once(']').ok_or(InvalidDestination::Malformed)?;
        let port = match rest.strip_prefix(':') {
            Some(p) => Some(p),
            None if rest.is_empty() => None,
            None => return Err(InvalidDestination::Malformed),
        };
        (host.to_owned(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (percent_decode(host)?, Some(port)),
            None => (percent_decode(authority)?, None),
        }
    };
    if host.is_empty() {
        return Err(InvalidDestination::MissingHost);
    }
    let port = match port {
        None => DEFAULT_PORT,
        Some(p) => p.parse().map_err(|_| InvalidDestination::Malformed)?,
    };
    Ok((host, port))
}

fn percent_decode(s: &str) -> Result<String, InvalidDestination> {
    if !s.contains('%') {
        return Ok(s.to_owned());
    }
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        let hi = bytes.next().and_then(hex_value);
        let lo = bytes.next().and_then(hex_value);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
            _ => return Err(InvalidDestination::Malformed),
        }
    }
    String::from_utf8(out).map_err(|_| InvalidDestination::Malformed)
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|v| v as u8)
}

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xff;
