use fwbridge_frame::{crc8, modsum};
use serde::Serialize;

use crate::cmd::{parse_hex_input, Algorithm, ChecksumArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_report, OutputFormat};

#[derive(Serialize)]
struct ChecksumOutput {
    algorithm: &'static str,
    length: usize,
    checksum: String,
}

pub fn run(args: ChecksumArgs, format: OutputFormat) -> CliResult<i32> {
    let data = parse_hex_input(&args.hex)?;
    let (algorithm, value) = match args.algorithm {
        Algorithm::Crc8 => ("crc8", crc8(&data)),
        Algorithm::Modsum => ("modsum", modsum(&data)),
    };
    let out = ChecksumOutput {
        algorithm,
        length: data.len(),
        checksum: format!("0x{value:02x}"),
    };
    print_report(
        &out,
        &[
            ("algorithm", out.algorithm.to_string()),
            ("length", out.length.to_string()),
            ("checksum", out.checksum.clone()),
        ],
        format,
    );
    Ok(SUCCESS)
}
