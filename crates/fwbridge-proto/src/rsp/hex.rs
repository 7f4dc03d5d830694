use crate::error::{ProtoError, Result};

/// Lowercase hex, two digits per byte.
pub fn encode_hex(bytes: &[u8]) -> String {
    crate::message::hex_string(bytes)
}

/// Decode an even-length hex string.
pub fn decode_hex(text: &[u8]) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(ProtoError::InvalidField {
            field: "hex",
            reason: format!("odd length {}", text.len()),
        });
    }
    text.chunks_exact(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(high), Some(low)) => Ok(high << 4 | low),
            _ => Err(ProtoError::InvalidField {
                field: "hex",
                reason: format!("bad digits {:?}", String::from_utf8_lossy(pair)),
            }),
        })
        .collect()
}

/// Parse a hex number such as a signal or thread id.
pub fn parse_hex_u64(text: &[u8]) -> Result<u64> {
    std::str::from_utf8(text)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| ProtoError::InvalidField {
            field: "hex",
            reason: format!("not a hex number: {:?}", String::from_utf8_lossy(text)),
        })
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mixed_case() {
        assert_eq!(decode_hex(b"DEadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(encode_hex(&[0x0a, 0xff]), "0aff");
    }

    #[test]
    fn rejects_odd_and_non_hex() {
        assert!(decode_hex(b"abc").is_err());
        assert!(decode_hex(b"zz").is_err());
        assert!(parse_hex_u64(b"").is_err());
        assert_eq!(parse_hex_u64(b"1f").unwrap(), 0x1f);
    }
}
