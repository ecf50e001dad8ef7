//! Log output tagged with the current task's trace id.

use std::fmt::Display;
use std::io::{self, Write};

use env_logger::Env;
use log::Record;

use crate::trace::current_trace_id;

/// Install an `env_logger` writing `timestamp - trace_id - level - message`
/// lines. `RUST_LOG` overrides the default `info` filter.
///
/// Does nothing if a logger is already installed.
pub fn init() {
    let _ = try_init();
}

pub fn try_init() -> Result<(), log::SetLoggerError> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            write_record(buf, timestamp, &current_trace_id(), record)
        })
        .try_init()
}

fn write_record(
    out: &mut impl Write,
    timestamp: impl Display,
    trace_id: &str,
    record: &Record<'_>,
) -> io::Result<()> {
    writeln!(
        out,
        "{} - {} - {} - {}",
        timestamp,
        trace_id,
        record.level(),
        record.args()
    )
}
