//! Recursive-descent parser for one line of GDB/MI output.
//!
//! ```text
//! record  := result | async | stream
//! result  := [digits] '^' class (',' result-item)*
//! async   := ('*' | '+' | '=') class (',' result-item)*
//! stream  := ('~' | '@' | '&') c-string
//! item    := name '=' value
//! value   := c-string | '{' items? '}' | '[' (values | items)? ']'
//! ```

use crate::error::ParseError;

use super::record::{AsyncKind, Record, ResultClass, StreamKind};
use super::value::{Results, Value};

/// Parse a single MI line (without its newline).
pub fn parse_record(line: &str) -> Result<Record, ParseError> {
    let mut parser = Parser::new(line);
    let record = parser.record()?;
    parser.expect_end()?;
    Ok(record)
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            text: self.text.to_string(),
            cursor: self.pos,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, want: u8) -> Result<(), ParseError> {
        match self.peek() {
            Some(b) if b == want => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(self.error(format!(
                "expected '{}', found '{}'",
                char::from(want),
                char::from(b)
            ))),
            None => Err(self.error(format!("expected '{}', found end of line", char::from(want)))),
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(b) => Err(self.error(format!("trailing input starting with '{}'", char::from(b)))),
        }
    }

    /// Slice while `keep` holds; advances past it.
    fn take_while(&mut self, keep: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&keep) {
            self.pos += 1;
        }
        // Only ASCII delimiters stop the scan, so both ends are char boundaries.
        &self.text[start..self.pos]
    }

    fn record(&mut self) -> Result<Record, ParseError> {
        match self.peek() {
            Some(b) if b.is_ascii_digit() || b == b'^' => self.result_record(),
            Some(b) => {
                if let Some(kind) = AsyncKind::from_prefix(b) {
                    self.pos += 1;
                    self.async_record(kind)
                } else if let Some(kind) = StreamKind::from_prefix(b) {
                    self.pos += 1;
                    let text = self.cstring()?;
                    Ok(Record::Stream { kind, text })
                } else {
                    Err(self.error("unrecognized record prefix"))
                }
            }
            None => Err(self.error("empty record")),
        }
    }

    fn result_record(&mut self) -> Result<Record, ParseError> {
        let digits = self.take_while(|b| b.is_ascii_digit());
        let token = if digits.is_empty() {
            None
        } else {
            let token = digits
                .parse::<u64>()
                .map_err(|_| self.error("token out of range"))?;
            Some(token)
        };
        self.expect(b'^')?;
        let class_start = self.pos;
        let name = self.take_while(|b| b != b',');
        let class = ResultClass::from_name(name).ok_or_else(|| {
            let mut err = self.error(format!("unknown result class {name:?}"));
            err.cursor = class_start;
            err
        })?;
        let results = self.trailing_results()?;
        Ok(Record::Result {
            token,
            class,
            results,
        })
    }

    fn async_record(&mut self, kind: AsyncKind) -> Result<Record, ParseError> {
        let class = self.take_while(|b| b != b',');
        if class.is_empty() {
            return Err(self.error("missing async class"));
        }
        let class = class.to_string();
        let results = self.trailing_results()?;
        Ok(Record::Async {
            kind,
            class,
            results,
        })
    }

    /// `(',' item)*` up to end of line.
    fn trailing_results(&mut self) -> Result<Results, ParseError> {
        let mut results = Results::new();
        while self.peek() == Some(b',') {
            self.pos += 1;
            let (name, value) = self.item()?;
            results.push(name, value);
        }
        Ok(results)
    }

    fn item(&mut self) -> Result<(String, Value), ParseError> {
        let name = self.take_while(|b| !matches!(b, b'=' | b',' | b'{' | b'}' | b'[' | b']' | b'"'));
        if name.is_empty() {
            return Err(self.error("expected variable name"));
        }
        self.expect(b'=')?;
        let value = self.value()?;
        Ok((name.to_string(), value))
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some(b'"') => self.cstring().map(Value::String),
            Some(b'{') => {
                self.pos += 1;
                let results = self.items_until(b'}')?;
                Ok(Value::Tuple(results))
            }
            Some(b'[') => {
                self.pos += 1;
                self.list()
            }
            Some(_) => Err(self.error("expected value")),
            None => Err(self.error("expected value, found end of line")),
        }
    }

    /// After `[`: a list of values, or a list of `name=value` items.
    fn list(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some(b']') => {
                self.pos += 1;
                Ok(Value::List(Vec::new()))
            }
            Some(b'"' | b'{' | b'[') => {
                let mut items = vec![self.value()?];
                loop {
                    match self.peek() {
                        Some(b',') => {
                            self.pos += 1;
                            items.push(self.value()?);
                        }
                        Some(b']') => {
                            self.pos += 1;
                            return Ok(Value::List(items));
                        }
                        _ => return Err(self.error("expected ',' or ']'")),
                    }
                }
            }
            _ => self.items_until(b']').map(Value::Tuple),
        }
    }

    fn items_until(&mut self, close: u8) -> Result<Results, ParseError> {
        let mut results = Results::new();
        if self.peek() == Some(close) {
            self.pos += 1;
            return Ok(results);
        }
        loop {
            let (name, value) = self.item()?;
            results.push(name, value);
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b) if b == close => {
                    self.pos += 1;
                    return Ok(results);
                }
                _ => {
                    return Err(self.error(format!("expected ',' or '{}'", char::from(close))));
                }
            }
        }
    }

    fn cstring(&mut self) -> Result<String, ParseError> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => {
                    let escaped = match self.bump() {
                        Some(b'n') => b'\n',
                        Some(b't') => b'\t',
                        Some(b'r') => b'\r',
                        Some(b'\\') => b'\\',
                        Some(b'"') => b'"',
                        Some(d @ b'0'..=b'7') => self.octal(d)?,
                        Some(other) => {
                            self.pos -= 1;
                            return Err(self.error(format!("invalid escape '\\{}'", char::from(other))));
                        }
                        None => return Err(self.error("unterminated escape")),
                    };
                    out.push(escaped);
                }
                Some(b) => out.push(b),
            }
        }
        String::from_utf8(out).map_err(|_| self.error("string is not valid UTF-8"))
    }

    /// Up to three octal digits, the first already consumed.
    fn octal(&mut self, first: u8) -> Result<u8, ParseError> {
        let mut value = u32::from(first - b'0');
        for _ in 0..2 {
            match self.peek() {
                Some(d @ b'0'..=b'7') => {
                    self.pos += 1;
                    value = value * 8 + u32::from(d - b'0');
                }
                _ => break,
            }
        }
        u8::try_from(value).map_err(|_| self.error("octal escape out of range"))
    }
}
