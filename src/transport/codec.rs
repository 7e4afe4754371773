//! Binary CoAP framing (RFC 7252 section 3).
//!
//! ```text
//!  0                   1                   2                   3
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! |   Token (0-8 bytes) ...
//! |   Options (delta-encoded) ...
//! |1 1 1 1 1 1 1 1|    Payload ...
//! ```
//!
//! Both directions are pure functions; nothing here touches the network.

use thiserror::Error;

use crate::transport::message::{
    Code, MAX_TOKEN_LEN, Message, MessageOption, MessageType, Token,
};

pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4;
pub const PAYLOAD_MARKER: u8 = 0xFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram truncated")]
    Truncated,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("token length {0} exceeds {MAX_TOKEN_LEN}")]
    MalformedToken(usize),
    #[error("empty message carries token, options or payload")]
    MalformedEmptyMessage,
    #[error("reserved option delta or length nibble")]
    ReservedOptionNibble,
    #[error("option number decreases or overflows")]
    OptionOrderViolation,
    #[error("payload marker not followed by payload")]
    EmptyPayload,
}

/// Serializes `message` as is.
///
/// `decode(&encode(m)) == Ok(m)` holds for every message where
/// [`Message::is_well_formed`] is true. An empty message carrying a token,
/// options or a payload is still written out, and `decode` rejects it with
/// [`DecodeError::MalformedEmptyMessage`].
pub fn encode(message: &Message) -> Vec<u8> {
    let token = message.token.as_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + token.len() + message.payload.len() + 16);

    out.push((VERSION << 6) | (message.mtype.bits() << 4) | token.len() as u8);
    out.push(message.code.as_u8());
    out.extend_from_slice(&message.message_id.to_be_bytes());
    out.extend_from_slice(token);

    let mut previous = 0u16;
    for option in message.options() {
        // options() is sorted, so the delta never underflows
        let delta = u32::from(option.number - previous);
        let len = option.value.len() as u32;
        previous = option.number;

        out.push((nibble(delta) << 4) | nibble(len));
        push_extension(&mut out, delta);
        push_extension(&mut out, len);
        out.extend_from_slice(&option.value);
    }

    if !message.payload.is_empty() {
        out.push(PAYLOAD_MARKER);
        out.extend_from_slice(&message.payload);
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }

    let version = bytes[0] >> 6;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let mtype = MessageType::from_bits(bytes[0] >> 4);
    let token_len = usize::from(bytes[0] & 0x0F);
    if token_len > MAX_TOKEN_LEN {
        return Err(DecodeError::MalformedToken(token_len));
    }
    let code = Code::from_u8(bytes[1]);
    let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

    if code.is_empty() && (token_len != 0 || bytes.len() != HEADER_LEN) {
        return Err(DecodeError::MalformedEmptyMessage);
    }

    let rest = &bytes[HEADER_LEN..];
    if rest.len() < token_len {
        return Err(DecodeError::Truncated);
    }
    let (token, mut cursor) = rest.split_at(token_len);
    let token = Token::new(token).map_err(|_| DecodeError::MalformedToken(token_len))?;

    let mut options = Vec::new();
    let mut payload = Vec::new();
    let mut number = 0u32;

    while let Some((&header, tail)) = cursor.split_first() {
        if header == PAYLOAD_MARKER {
            if tail.is_empty() {
                return Err(DecodeError::EmptyPayload);
            }
            payload = tail.to_vec();
            break;
        }
        cursor = tail;

        let delta = read_extension(header >> 4, &mut cursor)?;
        let len = read_extension(header & 0x0F, &mut cursor)? as usize;

        number += delta;
        if number > u32::from(u16::MAX) {
            return Err(DecodeError::OptionOrderViolation);
        }
        if cursor.len() < len {
            return Err(DecodeError::Truncated);
        }
        let (value, tail) = cursor.split_at(len);
        cursor = tail;

        options.push(MessageOption {
            number: number as u16,
            value: value.to_vec(),
        });
    }

    Ok(Message::from_parts(
        mtype, code, message_id, token, options, payload,
    ))
}

fn nibble(value: u32) -> u8 {
    match value {
        0..=12 => value as u8,
        13..=268 => 13,
        _ => 14,
    }
}

fn push_extension(out: &mut Vec<u8>, value: u32) {
    match value {
        0..=12 => {}
        13..=268 => out.push((value - 13) as u8),
        _ => out.extend_from_slice(&((value - 269) as u16).to_be_bytes()),
    }
}

fn read_extension(nibble: u8, cursor: &mut &[u8]) -> Result<u32, DecodeError> {
    let bytes = *cursor;
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let (&byte, tail) = bytes.split_first().ok_or(DecodeError::Truncated)?;
            *cursor = tail;
            Ok(u32::from(byte) + 13)
        }
        14 => {
            if bytes.len() < 2 {
                return Err(DecodeError::Truncated);
            }
            let value = u16::from_be_bytes([bytes[0], bytes[1]]);
            *cursor = &bytes[2..];
            Ok(u32::from(value) + 269)
        }
        _ => Err(DecodeError::ReservedOptionNibble),
    }
}
