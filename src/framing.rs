//! Tunnel message framing
//!
//! Every binary WebSocket message carries exactly one DNS payload tagged with
//! the correlation key of the UDP client it belongs to:
//!
//! ```text
//! +-----------------+-----------+-----------------+
//! | correlation key | 0x00 0x00 |     payload     |
//! +-----------------+-----------+-----------------+
//! |    variable     |     2     |    variable     |
//! +-----------------+-----------+-----------------+
//! ```
//!
//! The key is the text form of a socket address (`127.0.0.1:40000`,
//! `[::1]:40000`). Address text is ASCII and never contains NUL, so the first
//! delimiter always marks the end of the key and no length prefix is needed.

use std::net::SocketAddr;

/// Separator between correlation key and payload
pub const DELIMITER: [u8; 2] = [0x00, 0x00];

/// Framing errors. All of them are per-message and never fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The message contains no delimiter (corrupted or foreign message)
    #[error("no key delimiter in {len}-byte message")]
    NoDelimiter { len: usize },

    /// The key is not the text form of a socket address
    #[error("invalid correlation key {0:?}")]
    InvalidKey(String),
}

/// Build one tunnel message from a key and a payload.
pub fn encode(key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(key.len() + DELIMITER.len() + payload.len());
    message.extend_from_slice(key);
    message.extend_from_slice(&DELIMITER);
    message.extend_from_slice(payload);
    message
}

/// Split a tunnel message at the first delimiter into `(key, payload)`.
///
/// Delimiter bytes inside the payload are left untouched; only the first
/// occurrence is significant.
pub fn decode(message: &[u8]) -> Result<(&[u8], &[u8]), FrameError> {
    let index = message
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
        .ok_or(FrameError::NoDelimiter { len: message.len() })?;

    Ok((&message[..index], &message[index + DELIMITER.len()..]))
}

/// Correlation key for a UDP client address
pub fn correlation_key(addr: &SocketAddr) -> Vec<u8> {
    addr.to_string().into_bytes()
}

/// Recover the UDP client address from a correlation key
pub fn parse_correlation_key(key: &[u8]) -> Result<SocketAddr, FrameError> {
    let text = std::str::from_utf8(key)
        .map_err(|_| FrameError::InvalidKey(String::from_utf8_lossy(key).into_owned()))?;

    text.parse()
        .map_err(|_| FrameError::InvalidKey(text.to_string()))
}

/// Convenience for the client side: tag a datagram with its source address.
pub fn encode_for(addr: &SocketAddr, payload: &[u8]) -> Vec<u8> {
    encode(&correlation_key(addr), payload)
}
