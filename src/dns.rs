//! Minimal DNS message inspection for log output
//!
//! Tunneled payloads are opaque. The only thing ever read from them is the
//! question name, and only to make debug logs readable.

/// DNS header length
const HEADER_LEN: usize = 12;

/// Longest presentation-format name (RFC 1035 section 2.3.4)
const MAX_NAME_LEN: usize = 255;

/// Extract the first question name, e.g. `example.com`.
///
/// Returns `None` for anything that is not a well-formed uncompressed QNAME.
/// The root name is returned as `.`.
pub fn question_name(message: &[u8]) -> Option<String> {
    let mut pos = HEADER_LEN;
    let mut name = String::new();

    loop {
        let len = *message.get(pos)? as usize;
        pos += 1;

        if len == 0 {
            break;
        }
        // compression pointers and extended label types never start a question
        if len & 0xC0 != 0 {
            return None;
        }

        let label = message.get(pos..pos + len)?;
        pos += len;

        if !name.is_empty() {
            name.push('.');
        }
        name.extend(label.iter().map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '?'
            }
        }));

        if name.len() > MAX_NAME_LEN {
            return None;
        }
    }

    if name.is_empty() {
        name.push('.');
    }
    Some(name)
}

/// Question name for log lines, `unknown` when it cannot be read
pub fn describe(message: &[u8]) -> String {
    question_name(message).unwrap_or_else(|| "unknown".to_string())
}
