//! Progress reporting.

use std::fmt::Display;
use std::io::Write;
use std::sync::Mutex;

use imager_utils::ResultExt;
use owo_colors::OwoColorize;

/// The state of a reported step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The step started.
    Running,
    /// The step finished.
    Succeeded,
    /// The step was not needed.
    Skipped,
    /// The build failed.
    Error,
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Skipped => "skipped",
            Status::Error => "error",
        })
    }
}

/// A progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// What happened.
    pub message: String,
    /// The state it is in.
    pub status: Status,
}

impl Update {
    /// Shorthand constructor.
    pub fn new(message: impl Into<String>, status: Status) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }
}

/// Receives progress updates.
pub trait Reporter: std::fmt::Debug + Send + Sync {
    /// Report `update`.
    fn report(&self, update: Update);
}

/// Writes updates to stderr, colored when it is a terminal.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    // Serializes lines from concurrent reports.
    lock: Mutex<()>,
}

/// Write `update` as one line to `out`.
fn write_update(out: &mut impl Write, update: &Update) -> std::io::Result<()> {
    match update.status {
        Status::Running => writeln!(out, "{}", update.message.cyan()),
        Status::Succeeded => writeln!(out, "{} {}", "✓".green(), update.message),
        Status::Skipped => writeln!(out, "{} {}", "-".dimmed(), update.message.dimmed()),
        Status::Error => writeln!(out, "{} {}", "✗".red(), update.message.red().bold()),
    }
}

impl Reporter for ConsoleReporter {
    fn report(&self, update: Update) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        write_update(&mut anstream::stderr().lock(), &update).log_err_ok("Writing progress");
    }
}

/// Discards updates.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _update: Update) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Keeps every update.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingReporter {
        pub(crate) updates: Mutex<Vec<Update>>,
    }

    impl RecordingReporter {
        pub(crate) fn statuses(&self) -> Vec<(String, Status)> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|u| (u.message.clone(), u.status))
                .collect()
        }
    }

    impl Reporter for RecordingReporter {
        fn report(&self, update: Update) {
            self.updates.lock().unwrap().push(update);
        }
    }

    static_assertions::assert_impl_all!(ConsoleReporter: Send, Sync);

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Succeeded.to_string(), "succeeded");
        assert_eq!(Status::Error.to_string(), "error");
    }

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_update() {
        let mut out = Vec::new();
        write_update(&mut out, &Update::new("building iso", Status::Succeeded)).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("✓"), "{out}");
        assert!(out.ends_with("building iso\n"), "{out}");

        let e = write_update(&mut Closed, &Update::new("lost", Status::Error)).unwrap_err();
        assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_recording() {
        let r = RecordingReporter::default();
        r.report(Update::new("building", Status::Running));
        NullReporter.report(Update::new("ignored", Status::Running));
        assert_eq!(r.statuses(), [("building".to_string(), Status::Running)]);
    }
}
