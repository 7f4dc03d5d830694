use bytes::BytesMut;
use fwbridge_frame::decode_rpc_frame;
use fwbridge_proto::rpc::RpcMessage;
use fwbridge_proto::Message;
use tracing::debug;

use crate::cmd::{parse_hex_input, DecodeArgs};
use crate::exit::{frame_error, proto_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let data = parse_hex_input(&args.hex)?;
    if args.raw {
        let message = RpcMessage::decode(&data).map_err(|err| proto_error("decode failed", err))?;
        print_message(&Message::Rpc(message), format);
        return Ok(SUCCESS);
    }

    let mut buffer = BytesMut::from(&data[..]);
    let mut decoded = 0usize;
    while let Some(frame) =
        decode_rpc_frame(&mut buffer).map_err(|err| frame_error("unframing failed", err))?
    {
        debug!(len = frame.len(), "unframed message");
        let message = RpcMessage::decode(&frame).map_err(|err| proto_error("decode failed", err))?;
        print_message(&Message::Rpc(message), format);
        decoded += 1;
    }
    if !buffer.is_empty() {
        return Err(CliError::new(
            DATA_INVALID,
            format!("{} trailing bytes without a frame terminator", buffer.len()),
        ));
    }
    if decoded == 0 {
        return Err(CliError::new(DATA_INVALID, "no frames in input"));
    }
    Ok(SUCCESS)
}
