use std::fmt;

use crate::message::FieldValue;

use super::value::{write_cstring, Results};

/// Completion class of a `^` result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    pub const ALL: [ResultClass; 5] = [
        Self::Done,
        Self::Running,
        Self::Connected,
        Self::Error,
        Self::Exit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Running => "running",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Exit => "exit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for ResultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix of an async record: `*` exec, `+` status, `=` notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncKind {
    Exec,
    Status,
    Notify,
}

impl AsyncKind {
    pub fn prefix(self) -> char {
        match self {
            Self::Exec => '*',
            Self::Status => '+',
            Self::Notify => '=',
        }
    }

    pub fn from_prefix(c: u8) -> Option<Self> {
        match c {
            b'*' => Some(Self::Exec),
            b'+' => Some(Self::Status),
            b'=' => Some(Self::Notify),
            _ => None,
        }
    }
}

/// Prefix of a stream record: `~` console, `@` target, `&` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

impl StreamKind {
    pub fn prefix(self) -> char {
        match self {
            Self::Console => '~',
            Self::Target => '@',
            Self::Log => '&',
        }
    }

    pub fn from_prefix(c: u8) -> Option<Self> {
        match c {
            b'~' => Some(Self::Console),
            b'@' => Some(Self::Target),
            b'&' => Some(Self::Log),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Target => "target",
            Self::Log => "log",
        }
    }
}

/// One parsed line of GDB/MI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Results,
    },
    Async {
        kind: AsyncKind,
        class: String,
        results: Results,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
}

impl Record {
    pub fn token(&self) -> Option<u64> {
        match self {
            Self::Result { token, .. } => *token,
            _ => None,
        }
    }

    /// Result or async class; the stream name for stream records.
    pub fn class(&self) -> &str {
        match self {
            Self::Result { class, .. } => class.as_str(),
            Self::Async { class, .. } => class,
            Self::Stream { kind, .. } => kind.as_str(),
        }
    }

    pub fn results(&self) -> Option<&Results> {
        match self {
            Self::Result { results, .. } | Self::Async { results, .. } => Some(results),
            Self::Stream { .. } => None,
        }
    }

    pub fn fields(&self) -> Vec<(String, FieldValue)> {
        match self {
            Self::Result { results, .. } | Self::Async { results, .. } => results
                .iter()
                .map(|(name, value)| (name.to_string(), FieldValue::from(value)))
                .collect(),
            Self::Stream { text, .. } => vec![("text".to_string(), FieldValue::Text(text.clone()))],
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let results = match self {
            Self::Result {
                token,
                class,
                results,
            } => {
                if let Some(token) = token {
                    write!(f, "{token}")?;
                }
                write!(f, "^{class}")?;
                results
            }
            Self::Async {
                kind,
                class,
                results,
            } => {
                write!(f, "{}{class}", kind.prefix())?;
                results
            }
            Self::Stream { kind, text } => {
                write!(f, "{}", kind.prefix())?;
                return write_cstring(f, text);
            }
        };
        if !results.is_empty() {
            write!(f, ",{results}")?;
        }
        Ok(())
    }
}
