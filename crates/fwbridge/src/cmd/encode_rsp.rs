use bytes::BytesMut;
use fwbridge_frame::{encode_packet, modsum};
use serde::Serialize;

use crate::cmd::EncodeRspArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_report, OutputFormat};

#[derive(Serialize)]
struct PacketOutput {
    payload: String,
    checksum: String,
    packet: String,
}

pub fn run(args: EncodeRspArgs, format: OutputFormat) -> CliResult<i32> {
    let mut wire = BytesMut::new();
    encode_packet(args.payload.as_bytes(), &mut wire);
    let out = PacketOutput {
        checksum: format!("{:02x}", modsum(args.payload.as_bytes())),
        packet: String::from_utf8_lossy(&wire).into_owned(),
        payload: args.payload,
    };
    print_report(
        &out,
        &[
            ("payload", out.payload.clone()),
            ("checksum", out.checksum.clone()),
            ("packet", out.packet.clone()),
        ],
        format,
    );
    Ok(SUCCESS)
}
