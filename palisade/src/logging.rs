//! Process-wide structured logging.
//!
//! The root logger writes to the terminal through `sloggers` and mirrors
//! every record into a bounded in-memory history (most recent 100 entries,
//! FIFO eviction) that can be searched by substring or by error code.
//! `init` and `shutdown` bracket the process lifecycle explicitly; before
//! `init` all records are discarded.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use crate::time::timestamp_millis;
use lazy_static::lazy_static;
use sloggers::{Config, LoggerConfig};
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::{Mutex, RwLock};

const HISTORY_LIMIT: usize = 100;

const TERMINAL_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

lazy_static! {
    static ref ROOT: RwLock<Option<Logger>> = RwLock::new(None);
    static ref HISTORY: Mutex<VecDeque<(u64, String)>> =
        Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT));
}

/// Initializes the root logger and returns it. Replaces any previous root.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(TERMINAL_CONFIG).expect("Invalid logger configuration");

    let terminal = config.build_logger().expect("Error building terminal logger");

    let root = Logger::root(HistoryDrain { inner: terminal }, o!());

    *ROOT.write().unwrap() = Some(root.clone());

    root
}

/// Tears down the root logger. Records logged afterwards are discarded.
/// The history buffer is left intact for post-mortem inspection.
pub fn shutdown() {
    *ROOT.write().unwrap() = None;
}

/// Returns the root logger, or a discarding logger if `init` has not run.
pub fn get() -> Logger {
    match ROOT.read().unwrap().as_ref() {
        Some(log) => log.clone(),
        None => Logger::root(Discard, o!()),
    }
}

/// A snapshot of the retained log history, oldest entry first.
pub fn history() -> Vec<(u64, String)> {
    HISTORY.lock().unwrap().iter().cloned().collect()
}

/// Entries in the retained history containing the substring.
pub fn search_history(substr: &str) -> Vec<(u64, String)> {
    HISTORY
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, line)| line.contains(substr))
        .cloned()
        .collect()
}

/// Entries in the retained history carrying the given error code.
pub fn search_history_code(code: u32) -> Vec<(u64, String)> {
    search_history(&format!("code={}", code))
}

pub fn clear_history() {
    HISTORY.lock().unwrap().clear();
}

/// Drain that records a formatted copy of every entry in the history
/// buffer before forwarding the record to the terminal logger.
struct HistoryDrain {
    inner: Logger,
}

impl Drain for HistoryDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> Result<(), slog::Never> {
        use slog::KV;

        let mut line = format!("{} {}", record.level().as_short_str(), record.msg());

        let mut serializer = LineSerializer { line: &mut line };
        let _ = record.kv().serialize(record, &mut serializer);
        let _ = values.serialize(record, &mut serializer);

        {
            let mut history = HISTORY.lock().unwrap();

            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }

            history.push_back((timestamp_millis(), line));
        }

        self.inner.log(record);

        Ok(())
    }
}

/// Flattens key-value pairs into `key=value` segments on the history line.
struct LineSerializer<'a> {
    line: &'a mut String,
}

impl<'a> slog::Serializer for LineSerializer<'a> {
    fn emit_arguments(&mut self, key: slog::Key, val: &std::fmt::Arguments) -> slog::Result {
        let _ = write!(self.line, " {}={}", key, val);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    lazy_static! {
        // The history buffer is process-wide, so these tests cannot overlap.
        static ref TEST_LOCK: Mutex<()> = Mutex::new(());
    }

    // Other tests in this process may log into the shared history while
    // these run, so the assertions search for their own entries instead of
    // relying on exact totals.

    #[test]
    fn test_history_records_and_searches() {
        let _guard = TEST_LOCK.lock().unwrap();
        let log = init();
        clear_history();

        info!(log, "red crested cardinal spotted"; "context" => "aviary");
        error!(log, "lorikeet escaped"; "context" => "aviary", "code" => 13003u32);

        let matches = search_history("red crested cardinal spotted");
        assert_eq!(matches.len(), 1);
        assert!(matches[0].1.contains("context=aviary"));
        assert!(matches[0].1.contains("INFO"));

        assert_eq!(search_history("lorikeet escaped").len(), 1);
        assert_eq!(search_history_code(13003).len(), 1);
        assert!(search_history_code(15002).is_empty());

        shutdown();
    }

    #[test]
    fn test_history_is_bounded() {
        let _guard = TEST_LOCK.lock().unwrap();
        let log = init();
        clear_history();

        for i in 0..(HISTORY_LIMIT + 20) {
            debug!(log, "sequenced entry"; "n" => i);
        }

        assert_eq!(history().len(), HISTORY_LIMIT);

        // The newest entry survived, the oldest was evicted
        assert_eq!(search_history("sequenced entry n=119").len(), 1);
        assert!(search_history("sequenced entry n=0").is_empty());

        shutdown();
    }
}
