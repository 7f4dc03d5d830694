use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fwbridge_session::{Bridge, BridgeConfig};
use serde::Serialize;
use tracing::info;

use crate::cmd::ServeArgs;
use crate::exit::{session_error, CliError, CliResult, SUCCESS};
use crate::output::{print_report, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct ServeOutput {
    target: String,
    kind: String,
    gdb_server: Option<String>,
    remote_memory: Option<String>,
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = BridgeConfig::load(&args.config).map_err(|err| {
        session_error(&format!("config {}", args.config.display()), err)
    })?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut bridge = Bridge::start(&config).map_err(|err| session_error("bridge failed", err))?;

    let out = ServeOutput {
        target: config.target.address.clone(),
        kind: format!("{:?}", config.target.kind),
        gdb_server: bridge.gdb_server_endpoint().map(ToString::to_string),
        remote_memory: config.remote_memory.clone(),
    };
    print_report(
        &out,
        &[
            ("target", out.target.clone()),
            ("kind", out.kind.clone()),
            ("gdb_server", out.gdb_server.clone().unwrap_or_default()),
            ("remote_memory", out.remote_memory.clone().unwrap_or_default()),
        ],
        format,
    );

    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
    }
    info!("interrupted, shutting down");
    bridge.stop();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
