use crate::error::HandshakeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";

/// Length of a base64 encoded 16 byte client nonce.
pub const KEY_LEN: usize = 24;

/// Upgrade requests larger than this are refused.
pub const MAX_REQUEST_LEN: usize = 4096;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives the `Sec-WebSocket-Accept` token for a client key.
pub fn accept(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);

    STANDARD.encode(sha1.finalize())
}

/// A fresh random client key.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Returns the length of the request head, blank line included, once the
/// whole head is in `buf`.
pub fn request_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2))
}

/// Finds the client key among the header lines of `request`.
///
/// Header names are matched without regard to case and values are trimmed.
/// The request line, method and protocol version are not checked.
pub fn find_key(request: &[u8]) -> Result<&str, HandshakeError> {
    for line in request.split(|b| *b == b'\n').skip(1) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }

        let colon = match line.iter().position(|b| *b == b':') {
            Some(colon) => colon,
            None => continue,
        };
        let (name, value) = (&line[..colon], &line[colon + 1..]);
        if !name.trim_ascii().eq_ignore_ascii_case(SEC_WEBSOCKET_KEY.as_bytes()) {
            continue;
        }

        let value = value.trim_ascii();
        if value.len() != KEY_LEN {
            return Err(HandshakeError::InvalidKey(value.len()));
        }
        return std::str::from_utf8(value).map_err(|_| HandshakeError::InvalidKey(value.len()));
    }

    Err(HandshakeError::MissingKey)
}

/// The `101 Switching Protocols` reply carrying `accept`.
pub fn response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         {}: {}\r\n\
         \r\n",
        SEC_WEBSOCKET_ACCEPT, accept
    )
}
