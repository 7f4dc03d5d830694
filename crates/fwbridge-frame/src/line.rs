use bytes::{BufMut, BytesMut};

use crate::codec::{Decoder, Encoder, DEFAULT_MAX_FRAME};
use crate::error::{FrameError, Result};

/// Newline-delimited UTF-8 text, as spoken by GDB/MI.
///
/// Yields each line without its terminator; a trailing `\r` is stripped too.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_len: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Decoder for LineCodec {
    type Item = String;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let Some(newline) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > self.max_len {
                let len = src.len();
                src.clear();
                return Err(FrameError::LineTooLong {
                    len,
                    max: self.max_len,
                });
            }
            return Ok(None);
        };

        let mut line = src.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(newline - 1);
        }

        if line.len() > self.max_len {
            return Err(FrameError::LineTooLong {
                len: line.len(),
                max: self.max_len,
            });
        }

        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| FrameError::InvalidUtf8)
    }
}

impl Encoder<str> for LineCodec {
    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_len {
            return Err(FrameError::LineTooLong {
                len: item.len(),
                max: self.max_len,
            });
        }
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl Encoder<String> for LineCodec {
    fn encode(&mut self, item: &String, dst: &mut BytesMut) -> Result<()> {
        Encoder::<str>::encode(self, item.as_str(), dst)
    }
}
