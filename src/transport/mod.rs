//! The `transport` module is the CoAP message codec.
//!
//! It defines the in-memory message model (`message`) and the binary wire
//! format (`codec`). Everything here is a pure transformation; sockets are
//! owned by the broker engine.

pub mod codec;
pub mod message;

pub use codec::{DecodeError, decode, encode};
pub use message::{
    Code, ContentFormat, Message, MessageError, MessageOption, MessageType, Method, Token,
};
