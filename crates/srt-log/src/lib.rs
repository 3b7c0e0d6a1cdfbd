use chrono::Local;
use log::{Level, Log, SetLoggerError, set_boxed_logger, set_max_level};

/// Console logger for the transport.
///
/// Loss, pacing and scheduled-delivery events happen well below the
/// millisecond, so records carry microsecond timestamps. The second column
/// is the functional area (the first module segment below the crate root,
/// e.g. `connection` or `mux`), which keeps a mixed trace of several
/// sockets greppable. Records go to stderr so the tools can keep stdout
/// for payload or stats.
pub struct SrtLogger {
    max_level: Level,
}

impl SrtLogger {
    pub fn init(max_level: Level) -> Result<(), SetLoggerError> {
        set_boxed_logger(Box::new(SrtLogger { max_level }))?;
        set_max_level(max_level.to_level_filter());
        Ok(())
    }
}

/// First module segment below the crate root: `srt::connection::sender`
/// becomes `connection`, a bare crate name stays as is.
fn functional_area(target: &str) -> &str {
    let rest = match target.split_once("::") {
        Some((_, rest)) => rest,
        None => return target,
    };
    rest.split("::").next().unwrap_or(rest)
}

impl Log for SrtLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let now = Local::now();
            eprintln!(
                "{} {:5} {:<12} {}",
                now.format("%H:%M:%S%.6f"),
                record.level(),
                functional_area(record.target()),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functional_area_strips_crate_prefix() {
        assert_eq!(functional_area("srt::connection::sender"), "connection");
        assert_eq!(functional_area("srt::mux"), "mux");
        assert_eq!(functional_area("srt"), "srt");
        assert_eq!(functional_area("other_crate::deep::module"), "deep");
    }

    #[test]
    fn level_gates_records() {
        let logger = SrtLogger {
            max_level: Level::Info,
        };
        let meta = log::Metadata::builder().level(Level::Debug).build();
        assert!(!logger.enabled(&meta));
        let meta = log::Metadata::builder().level(Level::Warn).build();
        assert!(logger.enabled(&meta));
    }
}
