//! Logger construction: terminal output in the foreground/`-E` case,
//! syslog otherwise, both wrapped in an async drain so a slow destination
//! never blocks the pipeline thread.

use slog::{Drain, Level, Logger};

/// `-v` is warning, `-vv` is info, `-vvv` is debug, `-vvvv`+ is trace.
fn level_for(verbosity: u64) -> Level {
    match verbosity {
        0 => Level::Error,
        1 => Level::Warning,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

pub fn init(verbosity: u64, stdout_log: bool) -> Logger {
    let level = level_for(verbosity);

    if stdout_log {
        let decorator = slog_term::TermDecorator::new().stdout().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog::LevelFilter::new(drain, level).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!("component" => "rohctund"))
    } else {
        match slog_syslog::unix_3164(slog_syslog::Facility::LOG_DAEMON) {
            Ok(drain) => {
                let drain = slog::LevelFilter::new(drain.fuse(), level).fuse();
                let drain = slog_async::Async::new(drain).build().fuse();
                Logger::root(drain, slog::o!("component" => "rohctund"))
            }
            Err(_) => {
                // No syslog socket available (e.g. running in a minimal
                // container): fall back to stdout rather than going silent.
                let decorator = slog_term::TermDecorator::new().stdout().build();
                let drain = slog_term::FullFormat::new(decorator).build().fuse();
                let drain = slog::LevelFilter::new(drain, level).fuse();
                let drain = slog_async::Async::new(drain).build().fuse();
                Logger::root(drain, slog::o!("component" => "rohctund"))
            }
        }
    }
}
