use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Targets that follow `--log-level`. Everything else is capped at warn.
const BRIDGE_TARGETS: [&str; 5] = [
    "fwbridge",
    "fwbridge_transport",
    "fwbridge_frame",
    "fwbridge_proto",
    "fwbridge_session",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

pub fn log_filter(level: LogLevel) -> Targets {
    let level = level.as_filter();
    BRIDGE_TARGETS.iter().fold(
        Targets::new().with_default(level.min(LevelFilter::WARN)),
        |filter, target| filter.with_target(*target, level),
    )
}

/// Install the stderr subscriber. A second call is a no-op.
///
/// Thread names are printed: each connection's reader and the event bus
/// run on their own `fwbridge-*` thread.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::TRACE)
        .with_ansi(false)
        .with_thread_names(true)
        .with_target(matches!(level, LogLevel::Debug | LogLevel::Trace));
    let filter = log_filter(level);

    match format {
        LogFormat::Text => {
            let _ = builder.finish().with(filter).try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().with(filter).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;

    #[test]
    fn bridge_crates_follow_requested_level() {
        let filter = log_filter(LogLevel::Debug);
        assert!(filter.would_enable("fwbridge_session::gdb_server", &Level::DEBUG));
        assert!(filter.would_enable("fwbridge_proto::rpc::client", &Level::DEBUG));
        assert!(!filter.would_enable("fwbridge_frame::reader", &Level::TRACE));
    }

    #[test]
    fn other_targets_capped_at_warn() {
        let filter = log_filter(LogLevel::Trace);
        assert!(filter.would_enable("mio::poll", &Level::WARN));
        assert!(!filter.would_enable("mio::poll", &Level::INFO));

        let quiet = log_filter(LogLevel::Error);
        assert!(!quiet.would_enable("mio::poll", &Level::WARN));
        assert!(!quiet.would_enable("fwbridge_session::bridge", &Level::WARN));
    }
}
