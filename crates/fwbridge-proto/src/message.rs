//! Protocol-neutral view of a decoded message.
//!
//! Every message has a discriminator (MI class, RPC name, or packet kind) and
//! an ordered list of named fields. This is what the CLI prints and what
//! logs carry; the typed forms in [`crate::rpc`], [`crate::mi`] and
//! [`crate::rsp`] are what code matches on.

use bytes::Bytes;
use serde::ser::{SerializeMap, SerializeSeq, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::mi::{Record, Value};
use crate::rpc::RpcMessage;

/// One field value: scalar, ordered sequence, or nested mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Bytes(Bytes),
    Text(String),
    List(Vec<FieldValue>),
    Map(Vec<(String, FieldValue)>),
}

impl From<u8> for FieldValue {
    fn from(value: u8) -> Self {
        Self::Int(u64::from(value))
    }
}

impl From<u16> for FieldValue {
    fn from(value: u16) -> Self {
        Self::Int(u64::from(value))
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::Int(u64::from(value))
    }
}

impl From<&Value> for FieldValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s.clone()),
            Value::List(items) => Self::List(items.iter().map(Self::from).collect()),
            Value::Tuple(results) => Self::Map(
                results
                    .iter()
                    .map(|(name, value)| (name.to_string(), Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Int(value) => serializer.serialize_str(&format!("0x{value:x}")),
            Self::Bytes(bytes) => serializer.serialize_str(&hex_string(bytes)),
            Self::Text(text) => serializer.serialize_str(text),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => serialize_entries(entries, serializer),
        }
    }
}

fn serialize_entries<S: Serializer>(
    entries: &[(String, FieldValue)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(entries.len()))?;
    for (name, value) in entries {
        map.serialize_entry(name, value)?;
    }
    map.end()
}

struct Entries<'a>(&'a [(String, FieldValue)]);

impl Serialize for Entries<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_entries(self.0, serializer)
    }
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Which wire protocol and record type a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    TextResult,
    TextAsync,
    TextStream,
    BinaryRpc,
    RemoteDebug,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextResult => "text-result",
            Self::TextAsync => "text-async",
            Self::TextStream => "text-stream",
            Self::BinaryRpc => "binary-rpc",
            Self::RemoteDebug => "remote-debug",
        }
    }
}

/// A decoded message from any of the three protocols.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(Record),
    Rpc(RpcMessage),
    RemoteDebug(Bytes),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(Record::Result { .. }) => MessageKind::TextResult,
            Self::Text(Record::Async { .. }) => MessageKind::TextAsync,
            Self::Text(Record::Stream { .. }) => MessageKind::TextStream,
            Self::Rpc(_) => MessageKind::BinaryRpc,
            Self::RemoteDebug(_) => MessageKind::RemoteDebug,
        }
    }

    /// Record class, RPC message name, or remote packet command letter.
    pub fn discriminator(&self) -> String {
        match self {
            Self::Text(record) => record.class().to_string(),
            Self::Rpc(message) => message.name().to_string(),
            Self::RemoteDebug(payload) => payload
                .first()
                .map(|b| char::from(*b).to_string())
                .unwrap_or_default(),
        }
    }

    /// Ordered field list.
    pub fn fields(&self) -> Vec<(String, FieldValue)> {
        match self {
            Self::Text(record) => record.fields(),
            Self::Rpc(message) => message
                .fields()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
            Self::RemoteDebug(payload) => vec![(
                "payload".to_string(),
                FieldValue::Text(String::from_utf8_lossy(payload).into_owned()),
            )],
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.fields();
        let token = match self {
            Self::Text(record) => record.token(),
            _ => None,
        };
        let mut state = serializer.serialize_struct("Message", 4)?;
        state.serialize_field("kind", self.kind().as_str())?;
        state.serialize_field("class", &self.discriminator())?;
        state.serialize_field("token", &token)?;
        state.serialize_field("fields", &Entries(&fields))?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::parse_record;

    #[test]
    fn rpc_message_serializes_in_field_order() {
        let message = Message::Rpc(RpcMessage::WriteMemory {
            address: 0x1000,
            size: 4,
            value: 0xdeadbeef,
        });
        let json = serde_json::to_string(&message).expect("should serialize");
        assert_eq!(
            json,
            r#"{"kind":"binary-rpc","class":"AVATAR_RPC_HTD_WRITE_MEMORY","token":null,"fields":{"address":"0x1000","size":"0x4","value":"0xdeadbeef"}}"#
        );
    }

    #[test]
    fn text_record_keeps_nested_mapping() {
        let record = parse_record(r#"*stopped,reason="breakpoint-hit",bkptno="1",frame={addr="0x080483ed"}"#)
            .expect("should parse");
        let message = Message::Text(record);
        assert_eq!(message.kind(), MessageKind::TextAsync);
        assert_eq!(message.discriminator(), "stopped");

        let json = serde_json::to_string(&message).expect("should serialize");
        assert_eq!(
            json,
            r#"{"kind":"text-async","class":"stopped","token":null,"fields":{"reason":"breakpoint-hit","bkptno":"1","frame":{"addr":"0x080483ed"}}}"#
        );
    }

    #[test]
    fn remote_packet_discriminator() {
        let message = Message::RemoteDebug(Bytes::from_static(b"m2000,4"));
        assert_eq!(message.discriminator(), "m");
        assert_eq!(message.kind(), MessageKind::RemoteDebug);
    }
}
