use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest token the wire format can carry (4-bit length field, values 9-15 reserved).
pub const MAX_TOKEN_LEN: usize = 8;

/// Largest option value the extended length encoding can express.
pub const MAX_OPTION_VALUE_LEN: usize = 65535 + 269;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("token of {0} bytes exceeds the {MAX_TOKEN_LEN} byte maximum")]
    TokenTooLong(usize),
    #[error("option {number} value of {len} bytes is too long")]
    OptionTooLong { number: u16, len: usize },
}

/// The four CoAP message types, encoded in two bits of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// Method or response code, stored as the raw `c.dd` byte (3-bit class, 5-bit detail).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);

    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const PRECONDITION_FAILED: Code = Code::new(4, 12);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code::new(4, 15);

    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const PROXYING_NOT_SUPPORTED: Code = Code::new(5, 5);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code(((class & 0b111) << 5) | (detail & 0b1_1111))
    }

    pub const fn from_u8(raw: u8) -> Self {
        Code(raw)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0b1_1111
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    pub fn is_response(self) -> bool {
        (2..=5).contains(&self.class())
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({self})")
    }
}

/// Request methods the router dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Get, Method::Post, Method::Put, Method::Delete];

    pub fn code(self) -> Code {
        match self {
            Method::Get => Code::GET,
            Method::Post => Code::POST,
            Method::Put => Code::PUT,
            Method::Delete => Code::DELETE,
        }
    }

    pub fn from_code(code: Code) -> Option<Self> {
        match code {
            Code::GET => Some(Method::Get),
            Code::POST => Some(Method::Post),
            Code::PUT => Some(Method::Put),
            Code::DELETE => Some(Method::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!("unknown method '{other}'")),
        }
    }
}

/// Opaque request/response correlation identifier, 0 to 8 bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Token(Vec<u8>);

impl Token {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, MessageError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_TOKEN_LEN {
            return Err(MessageError::TokenTooLong(bytes.len()));
        }
        Ok(Token(bytes))
    }

    pub fn empty() -> Self {
        Token(Vec::new())
    }

    /// A random token of the maximum length.
    pub fn random() -> Self {
        Token(rand::random::<[u8; MAX_TOKEN_LEN]>().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

/// Content-Format identifier carried with a representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    pub const TEXT_PLAIN: ContentFormat = ContentFormat(0);
    pub const LINK_FORMAT: ContentFormat = ContentFormat(40);
    pub const JSON: ContentFormat = ContentFormat(50);
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single option: absolute number plus raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl MessageOption {
    pub const IF_MATCH: u16 = 1;
    pub const URI_HOST: u16 = 3;
    pub const ETAG: u16 = 4;
    pub const IF_NONE_MATCH: u16 = 5;
    pub const OBSERVE: u16 = 6;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const LOCATION_QUERY: u16 = 20;
    pub const PROXY_URI: u16 = 35;
    pub const PROXY_SCHEME: u16 = 39;
    pub const SIZE1: u16 = 60;

    const RECOGNIZED: [u16; 16] = [
        Self::IF_MATCH,
        Self::URI_HOST,
        Self::ETAG,
        Self::IF_NONE_MATCH,
        Self::OBSERVE,
        Self::URI_PORT,
        Self::LOCATION_PATH,
        Self::URI_PATH,
        Self::CONTENT_FORMAT,
        Self::MAX_AGE,
        Self::URI_QUERY,
        Self::ACCEPT,
        Self::LOCATION_QUERY,
        Self::PROXY_URI,
        Self::PROXY_SCHEME,
        Self::SIZE1,
    ];

    /// Odd option numbers are critical: a receiver that does not understand
    /// them must reject the message.
    pub fn is_critical(number: u16) -> bool {
        number & 1 == 1
    }

    pub fn is_recognized(number: u16) -> bool {
        Self::RECOGNIZED.contains(&number)
    }
}

/// Minimal big-endian encoding of an unsigned option value (zero is empty).
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// In-memory form of a CoAP message.
///
/// Options are kept ordered by number (repeated numbers keep insertion order)
/// so that the delta encoding produced by [`crate::transport::codec::encode`]
/// always decodes back to an equal value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    options: Vec<MessageOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(mtype: MessageType, code: Code) -> Self {
        Self {
            mtype,
            code,
            message_id: 0,
            token: Token::empty(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Confirmable request for `path`; message ID and token are assigned by the sender.
    pub fn request(method: Method, path: &str) -> Self {
        let mut message = Self::new(MessageType::Confirmable, method.code());
        message.set_uri_path(path);
        message
    }

    /// Response skeleton; type, message ID and token are filled in when it is sent.
    pub fn response(code: Code) -> Self {
        Self::new(MessageType::Acknowledgement, code)
    }

    pub fn empty_ack(message_id: u16) -> Self {
        let mut message = Self::new(MessageType::Acknowledgement, Code::EMPTY);
        message.message_id = message_id;
        message
    }

    pub fn reset(message_id: u16) -> Self {
        let mut message = Self::new(MessageType::Reset, Code::EMPTY);
        message.message_id = message_id;
        message
    }

    /// Used by the decoder, which already yields options in wire order.
    pub(crate) fn from_parts(
        mtype: MessageType,
        code: Code,
        message_id: u16,
        token: Token,
        options: Vec<MessageOption>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            mtype,
            code,
            message_id,
            token,
            options,
            payload,
        }
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.set_content_format(format);
        self
    }

    pub fn options(&self) -> &[MessageOption] {
        &self.options
    }

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    pub fn first_option(&self, number: u16) -> Option<&[u8]> {
        self.option_values(number).next()
    }

    pub fn add_option(&mut self, number: u16, value: impl Into<Vec<u8>>) -> Result<(), MessageError> {
        let value = value.into();
        if value.len() > MAX_OPTION_VALUE_LEN {
            return Err(MessageError::OptionTooLong {
                number,
                len: value.len(),
            });
        }
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(at, MessageOption { number, value });
        Ok(())
    }

    pub fn remove_options(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    pub fn uri_path(&self) -> String {
        join_segments(self.option_values(MessageOption::URI_PATH))
    }

    pub fn set_uri_path(&mut self, path: &str) {
        self.set_path_option(MessageOption::URI_PATH, path);
    }

    pub fn location_path(&self) -> String {
        join_segments(self.option_values(MessageOption::LOCATION_PATH))
    }

    pub fn set_location_path(&mut self, path: &str) {
        self.set_path_option(MessageOption::LOCATION_PATH, path);
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.first_option(MessageOption::CONTENT_FORMAT)
            .and_then(decode_uint)
            .and_then(|v| u16::try_from(v).ok())
            .map(ContentFormat)
    }

    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.replace_option(MessageOption::CONTENT_FORMAT, encode_uint(u32::from(format.0)));
    }

    /// Observe value: 0 registers, 1 deregisters in a request; a sequence
    /// number in a notification.
    pub fn observe(&self) -> Option<u32> {
        self.first_option(MessageOption::OBSERVE).and_then(decode_uint)
    }

    /// Sets the Observe option, keeping the low 24 bits.
    pub fn set_observe(&mut self, value: u32) {
        self.replace_option(MessageOption::OBSERVE, encode_uint(value & 0xFF_FFFF));
    }

    pub fn etag(&self) -> Option<&[u8]> {
        self.first_option(MessageOption::ETAG)
    }

    pub fn set_etag(&mut self, etag: &[u8]) {
        self.replace_option(MessageOption::ETAG, etag.to_vec());
    }

    /// Empty messages (code 0.00) carry nothing after the header. Every other
    /// shape the builders allow is well formed, and only well-formed messages
    /// survive an encode/decode round trip.
    pub fn is_well_formed(&self) -> bool {
        !self.code.is_empty()
            || (self.token.is_empty() && self.options.is_empty() && self.payload.is_empty())
    }

    /// First critical option the broker does not understand, if any.
    pub fn unrecognized_critical_option(&self) -> Option<u16> {
        self.options
            .iter()
            .map(|o| o.number)
            .find(|n| MessageOption::is_critical(*n) && !MessageOption::is_recognized(*n))
    }

    fn replace_option(&mut self, number: u16, value: Vec<u8>) {
        self.remove_options(number);
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(at, MessageOption { number, value });
    }

    fn set_path_option(&mut self, number: u16, path: &str) {
        self.remove_options(number);
        let at = self.options.partition_point(|o| o.number <= number);
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| MessageOption {
                number,
                value: s.as_bytes().to_vec(),
            });
        self.options.splice(at..at, segments);
    }
}

fn join_segments<'a>(segments: impl Iterator<Item = &'a [u8]>) -> String {
    let mut path = String::new();
    for segment in segments {
        path.push('/');
        path.push_str(&String::from_utf8_lossy(segment));
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}
