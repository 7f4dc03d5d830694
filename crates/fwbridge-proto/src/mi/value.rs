use std::fmt;

/// A GDB/MI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A c-string constant, unescaped.
    String(String),
    /// `[value, ...]`
    List(Vec<Value>),
    /// `{name=value, ...}`, and also `[name=value, ...]` result lists.
    Tuple(Results),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Results> {
        match self {
            Self::Tuple(results) => Some(results),
            _ => None,
        }
    }

    /// Field lookup on a tuple.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_tuple().and_then(|r| r.get(name))
    }

    /// Element lookup on a list.
    pub fn index(&self, i: usize) -> Option<&Value> {
        self.as_list().and_then(|items| items.get(i))
    }

    /// Interpret a string value as an integer: `0x`-prefixed hex or decimal.
    pub fn as_u64(&self) -> Option<u64> {
        self.as_str().and_then(parse_integer)
    }
}

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_integer(text: &str) -> Option<u64> {
    let text = text.trim();
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Ordered `name=value` pairs. Duplicate names are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Results(Vec<(String, Value)>);

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.0.push((name.into(), value));
    }

    /// First value named `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Every value named `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.0.iter().filter(move |(n, _)| n == name).map(|(_, v)| v)
    }

    /// String value of the first field named `name`.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Results {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub(crate) fn write_cstring(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\\' => f.write_str("\\\\")?,
            '"' => f.write_str("\\\"")?,
            other => write!(f, "{other}")?,
        }
    }
    f.write_str("\"")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write_cstring(f, s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Tuple(results) => write!(f, "{{{results}}}"),
        }
    }
}

/// Renders as `a="1",b={...}` without surrounding braces.
impl fmt::Display for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}
