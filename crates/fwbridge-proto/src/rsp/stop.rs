use bytes::Bytes;

use crate::error::{ProtoError, Result};

use super::hex::parse_hex_u64;

/// Why the target stopped, from an `S`, `T`, `W` or `X` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    /// `Sxx`
    Signal(u8),
    /// `Txx` followed by `name:value;` pairs.
    Trap { signal: u8, info: Vec<(String, String)> },
    /// `Wxx`: the process exited with this status.
    Exited(u8),
    /// `Xxx`: the process was killed by this signal.
    Terminated(u8),
}

impl StopReply {
    /// Whether `payload` looks like a stop reply.
    pub fn is_stop_packet(payload: &[u8]) -> bool {
        matches!(payload.first(), Some(b'S' | b'T' | b'W' | b'X'))
            && payload.len() >= 3
            && payload[1..3].iter().all(u8::is_ascii_hexdigit)
    }

    pub fn parse(payload: &Bytes) -> Result<Self> {
        if !Self::is_stop_packet(payload) {
            return Err(ProtoError::unexpected(
                "stop reply",
                String::from_utf8_lossy(payload),
            ));
        }
        let code = parse_hex_u64(&payload[1..3])? as u8;
        let rest = &payload[3..];
        match payload[0] {
            b'S' => Ok(Self::Signal(code)),
            b'W' => Ok(Self::Exited(code)),
            b'X' => Ok(Self::Terminated(code)),
            _ => {
                let info = String::from_utf8_lossy(rest)
                    .split(';')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once(':') {
                        Some((name, value)) => (name.to_string(), value.to_string()),
                        None => (pair.to_string(), String::new()),
                    })
                    .collect();
                Ok(Self::Trap { signal: code, info })
            }
        }
    }

    /// Signal number for `S`/`T`/`X`; `None` for a normal exit.
    pub fn signal(&self) -> Option<u8> {
        match self {
            Self::Signal(signal) | Self::Trap { signal, .. } | Self::Terminated(signal) => {
                Some(*signal)
            }
            Self::Exited(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_and_trap() {
        assert_eq!(
            StopReply::parse(&Bytes::from_static(b"S05")).unwrap(),
            StopReply::Signal(5)
        );
        let trap = StopReply::parse(&Bytes::from_static(b"T0b0f:00800000;thread:1;")).unwrap();
        assert_eq!(
            trap,
            StopReply::Trap {
                signal: 0x0b,
                info: vec![
                    ("0f".to_string(), "00800000".to_string()),
                    ("thread".to_string(), "1".to_string()),
                ],
            }
        );
        assert_eq!(trap.signal(), Some(0x0b));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(
            StopReply::parse(&Bytes::from_static(b"W00")).unwrap(),
            StopReply::Exited(0)
        );
        assert_eq!(StopReply::Exited(0).signal(), None);
        assert!(StopReply::parse(&Bytes::from_static(b"OK")).is_err());
        assert!(!StopReply::is_stop_packet(b"S"));
    }
}
