//! Events exchanged between the emulator side and the target side.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// Which half of the bridge produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Emulator,
    Target,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Emulator => "emulator",
            Self::Target => "target",
        })
    }
}

/// Event classification. An event carries one or more tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EventTag {
    #[serde(rename = "EVENT_STOPPED")]
    Stopped,
    #[serde(rename = "EVENT_BREAKPOINT")]
    Breakpoint,
    #[serde(rename = "EVENT_END_STEPPING")]
    EndStepping,
    #[serde(rename = "EVENT_RUNNING")]
    Running,
    #[serde(rename = "EVENT_REQUEST_READ_MEMORY")]
    RequestReadMemory,
    #[serde(rename = "EVENT_REQUEST_WRITE_MEMORY")]
    RequestWriteMemory,
    #[serde(rename = "EVENT_RESPONSE_READ_MEMORY")]
    ResponseReadMemory,
    #[serde(rename = "EVENT_RESPONSE_WRITE_MEMORY")]
    ResponseWriteMemory,
    #[serde(rename = "EVENT_SIGABRT")]
    SigAbrt,
}

impl EventTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "EVENT_STOPPED",
            Self::Breakpoint => "EVENT_BREAKPOINT",
            Self::EndStepping => "EVENT_END_STEPPING",
            Self::Running => "EVENT_RUNNING",
            Self::RequestReadMemory => "EVENT_REQUEST_READ_MEMORY",
            Self::RequestWriteMemory => "EVENT_REQUEST_WRITE_MEMORY",
            Self::ResponseReadMemory => "EVENT_RESPONSE_READ_MEMORY",
            Self::ResponseWriteMemory => "EVENT_RESPONSE_WRITE_MEMORY",
            Self::SigAbrt => "EVENT_SIGABRT",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed event payload. Anything without a dedicated field goes in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bkpt_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<u8>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A message on the [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub source: Source,
    pub tags: BTreeSet<EventTag>,
    /// Backend that produced the event (`"gdb"`, `"avatar-stub"`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub properties: EventProperties,
}

impl Event {
    pub fn new(source: Source, tags: impl IntoIterator<Item = EventTag>) -> Self {
        Self {
            source,
            tags: tags.into_iter().collect(),
            channel: None,
            properties: EventProperties::default(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.properties.address = Some(address);
        self
    }

    pub fn with_bkpt_number(mut self, number: u32) -> Self {
        self.properties.bkpt_number = Some(number);
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.properties.size = Some(size);
        self
    }

    pub fn with_value(mut self, value: u64) -> Self {
        self.properties.value = Some(value);
        self
    }

    pub fn with_signal(mut self, signal: u8) -> Self {
        self.properties.signal = Some(signal);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.extra.insert(key.into(), value);
        self
    }

    pub fn has_tag(&self, tag: EventTag) -> bool {
        self.tags.contains(&tag)
    }

    pub fn address(&self) -> Option<u64> {
        self.properties.address
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.source)?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(tag.as_str())?;
        }
        f.write_str("]")?;
        if let Some(address) = self.properties.address {
            write!(f, " @0x{address:08x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_keep_original_names() {
        assert_eq!(EventTag::SigAbrt.as_str(), "EVENT_SIGABRT");
        assert_eq!(EventTag::EndStepping.to_string(), "EVENT_END_STEPPING");
    }

    #[test]
    fn duplicate_tags_collapse() {
        let event = Event::new(
            Source::Target,
            [EventTag::Stopped, EventTag::Breakpoint, EventTag::Stopped],
        );
        assert_eq!(event.tags.len(), 2);
        assert!(event.has_tag(EventTag::Breakpoint));
        assert!(!event.has_tag(EventTag::Running));
    }

    #[test]
    fn serializes_with_event_names() {
        let event = Event::new(Source::Target, [EventTag::Stopped, EventTag::Breakpoint])
            .with_channel("gdb")
            .with_address(0x8000)
            .with_bkpt_number(2);
        let json = serde_json::to_value(&event).expect("should serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "source": "target",
                "tags": ["EVENT_STOPPED", "EVENT_BREAKPOINT"],
                "channel": "gdb",
                "properties": {"address": 0x8000, "bkpt_number": 2},
            })
        );
    }

    #[test]
    fn display_is_compact() {
        let event = Event::new(Source::Emulator, [EventTag::RequestReadMemory]).with_address(0x10);
        assert_eq!(event.to_string(), "emulator[EVENT_REQUEST_READ_MEMORY] @0x00000010");
    }
}
