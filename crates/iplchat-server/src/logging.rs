//! Tracing initialization. Console output uses the default fmt layer; when
//! the config names a log file, events are appended there as
//! `<timestamp> - [LEVEL] <message>` lines.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::error::Result;

/// `2024-03-09 12:00:00 - [INFO] message fields`
struct LogFileFormat;

impl<S, N> FormatEvent<S, N> for LogFileFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "{} - [{}] ",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

pub fn init(config: &ServerConfig) -> Result<()> {
    let default_filter = if config.log_verbose {
        "debug,rustls=info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    match &config.logfile_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .event_format(LogFileFormat)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
