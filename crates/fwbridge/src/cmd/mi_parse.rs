use std::fs::File;
use std::io::{self, BufRead, BufReader};

use fwbridge_proto::mi::{parse_record, DEFAULT_PROMPT};
use fwbridge_proto::Message;
use tracing::warn;

use crate::cmd::MiParseArgs;
use crate::exit::{io_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: MiParseArgs, format: OutputFormat) -> CliResult<i32> {
    let input: Box<dyn BufRead> = match &args.file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).map_err(|err| io_error(&format!("open {}", path.display()), err))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut rejected = 0usize;
    for (index, line) in input.lines().enumerate() {
        let line = line.map_err(|err| io_error("read failed", err))?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_end() == DEFAULT_PROMPT.trim_end() {
            continue;
        }
        match parse_record(line) {
            Ok(record) => print_message(&Message::Text(record), format),
            Err(err) => {
                rejected += 1;
                warn!(line = index + 1, %err, "skipping unparseable line");
            }
        }
    }
    if rejected > 0 {
        warn!(rejected, "some lines were not GDB/MI records");
    }
    Ok(SUCCESS)
}
