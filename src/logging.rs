use log::{Level, LevelFilter, Metadata, Record};
use std::io::Write;
use std::sync::OnceLock;
use std::time::SystemTime;

static START_TIME: OnceLock<SystemTime> = OnceLock::new();

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Logger that prints colored lines with a time-since-start stamp to stderr.
///
/// Stdout is left to the CLI for its own result messages.
struct OtaLogger;

impl log::Log for OtaLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let start = START_TIME.get_or_init(SystemTime::now);
        let elapsed = SystemTime::now().duration_since(*start).unwrap_or_default();

        let (color, level_char) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, 'E'),
            Level::Warn => (colors::BRIGHT_YELLOW, 'W'),
            Level::Info => (colors::BRIGHT_GREEN, 'I'),
            Level::Debug => (colors::BRIGHT_BLUE, 'D'),
            Level::Trace => (colors::GRAY, 'T'),
        };

        let line = format!(
            "{}{} [{}] {:>12} | {}{}",
            color,
            compact_timestamp(elapsed.as_secs(), elapsed.subsec_millis()),
            level_char,
            module_display(record.module_path()),
            record.args(),
            colors::RESET
        );

        // A closed stderr must never take the server down with it
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OtaLogger = OtaLogger;

/// Install the logger. Calling this again only updates the level.
pub fn init(level: LevelFilter) {
    let _ = START_TIME.set(SystemTime::now());
    if log::set_logger(&LOGGER).is_ok() {
        log::debug!("logger installed");
    }
    log::set_max_level(level);
}

/// Map a `-v` count onto a level filter, starting at `Warn`.
pub fn level_from_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}


fn compact_timestamp(seconds: u64, millis: u32) -> String {
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, millis)
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

fn module_display(module_path: Option<&str>) -> &str {
    let module = module_path
        .unwrap_or("unknown")
        .rsplit("::")
        .next()
        .unwrap_or("unknown");
    match module.char_indices().nth(12) {
        Some((idx, _)) => &module[..idx],
        None => module,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_timestamp() {
        assert_eq!(compact_timestamp(1, 234), "  1.234s");
        assert_eq!(compact_timestamp(61, 0), " 1m01s");
        assert_eq!(compact_timestamp(3_720, 0), " 1h02m");
    }

    #[test]
    fn test_module_display_truncates() {
        assert_eq!(module_display(Some("mqtt_house::ota::staging")), "staging");
        assert_eq!(module_display(Some("a::very_long_module_name")), "very_long_mo");
        assert_eq!(module_display(None), "unknown");
    }

    #[test]
    fn test_level_from_verbosity() {
        assert_eq!(level_from_verbosity(0), LevelFilter::Warn);
        assert_eq!(level_from_verbosity(1), LevelFilter::Info);
        assert_eq!(level_from_verbosity(7), LevelFilter::Trace);
    }
}
