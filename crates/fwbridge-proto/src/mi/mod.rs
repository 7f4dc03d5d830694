//! GDB/MI: record parser, line client, and debugger commands.

mod client;
mod debugger;
mod parser;
mod record;
mod value;

pub use client::{AsyncHandler, MiClient, MiConfig, MiHandlers, StreamHandler, DEFAULT_PROMPT};
pub use debugger::{BreakpointLocation, BreakpointRequest, GdbMi};
pub use parser::parse_record;
pub use record::{AsyncKind, Record, ResultClass, StreamKind};
pub use value::{parse_integer, Results, Value};
