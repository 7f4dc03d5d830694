use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::exit::{CliError, CliResult, DATA_INVALID};
use crate::output::OutputFormat;

pub mod checksum;
pub mod decode;
pub mod encode_rsp;
pub mod mi_parse;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compute a frame checksum over hex-encoded bytes.
    Checksum(ChecksumArgs),
    /// Decode a binary RPC frame or message.
    Decode(DecodeArgs),
    /// Parse GDB/MI output lines.
    MiParse(MiParseArgs),
    /// Wrap a payload in a remote-protocol packet.
    EncodeRsp(EncodeRspArgs),
    /// Run a bridge from a configuration file until interrupted.
    Serve(ServeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Checksum(args) => checksum::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::MiParse(args) => mi_parse::run(args, format),
        Command::EncodeRsp(args) => encode_rsp::run(args, format),
        Command::Serve(args) => serve::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Algorithm {
    /// CRC-8, polynomial 0x07 (binary RPC frames).
    #[default]
    Crc8,
    /// Sum of bytes mod 256 (remote-protocol packets).
    Modsum,
}

#[derive(Args, Debug)]
pub struct ChecksumArgs {
    /// Input bytes as hex, e.g. `01 00 10 00 00 04` or `0x0100100000 04`.
    pub hex: String,
    #[arg(long, value_enum, default_value_t = Algorithm::Crc8)]
    pub algorithm: Algorithm,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Frame bytes as hex.
    pub hex: String,
    /// Input is a bare message: no escaping, checksum, or terminator.
    #[arg(long)]
    pub raw: bool,
}

#[derive(Args, Debug)]
pub struct MiParseArgs {
    /// File of GDB/MI output. Reads stdin when omitted.
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EncodeRspArgs {
    /// Packet payload, e.g. `m2000,4`.
    pub payload: String,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bridge configuration (JSON).
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Decode hex input. Whitespace, `0x` prefixes and `:` separators are
/// ignored.
pub fn parse_hex_input(text: &str) -> CliResult<Vec<u8>> {
    let digits: String = text
        .split(|c: char| c.is_whitespace() || c == ':')
        .map(|chunk| {
            chunk
                .strip_prefix("0x")
                .or_else(|| chunk.strip_prefix("0X"))
                .unwrap_or(chunk)
        })
        .collect();
    fwbridge_proto::rsp::decode_hex(digits.as_bytes())
        .map_err(|err| CliError::new(DATA_INVALID, format!("invalid hex input: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_input_tolerates_separators() {
        assert_eq!(
            parse_hex_input("0x01 00:10 0x0000 04").expect("should parse"),
            vec![0x01, 0x00, 0x10, 0x00, 0x00, 0x04]
        );
        assert_eq!(parse_hex_input("abc").expect_err("odd length").code, DATA_INVALID);
        assert!(parse_hex_input("").expect("empty is fine").is_empty());
    }
}
