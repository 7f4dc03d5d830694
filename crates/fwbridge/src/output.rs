use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use fwbridge_proto::{FieldValue, Message};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Print a decoded message. JSON output is one object per line.
pub fn print_message(message: &Message, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"])
                .add_row(vec!["kind".to_string(), message.kind().as_str().to_string()])
                .add_row(vec!["class".to_string(), message.discriminator()]);
            for (name, value) in message.fields() {
                table.add_row(vec![name, field_text(&value)]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let fields: Vec<String> = message
                .fields()
                .iter()
                .map(|(name, value)| format!("{name}={}", field_text(value)))
                .collect();
            println!("{} {}", message.discriminator(), fields.join(" "));
        }
    }
}

/// Print a flat report: `value` as JSON, or `rows` as a table or
/// `key=value` line.
pub fn print_report<T: Serialize>(value: &T, rows: &[(&str, String)], format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KEY", "VALUE"]);
            for (key, value) in rows {
                table.add_row(vec![key.to_string(), value.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line: Vec<String> = rows
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            println!("{}", line.join(" "));
        }
    }
}

fn field_text(value: &FieldValue) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(text)) => text,
        Ok(other) => other.to_string(),
        Err(_) => format!("{value:?}"),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn field_text_flattens_scalars() {
        assert_eq!(field_text(&FieldValue::Int(0x1000)), "0x1000");
        assert_eq!(field_text(&FieldValue::Bytes(Bytes::from_static(&[0xbe, 0x01]))), "be01");
        assert_eq!(
            field_text(&FieldValue::List(vec![FieldValue::Text("a".into())])),
            r#"["a"]"#
        );
    }
}
