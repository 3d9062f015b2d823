//! Console progress reporting.
//!
//! Progress notes go to stderr so stdout stays free for machine-readable
//! output. Writes are best-effort: a closed pipe must not abort a build.

use std::io::{self, Write};

/// Writes human-readable progress notes to stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct Console;

impl Console {
    /// Creates a console reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Reports a progress note.
    pub fn note(&self, message: &str) {
        Self::emit(io::stderr(), message);
    }

    /// Reports a non-fatal problem the invocation continues past.
    pub fn warn(&self, message: &str) {
        Self::emit(io::stderr(), &format!("warning: {message}"));
    }

    fn emit(mut target: impl Write, message: &str) {
        writeln!(target, "{message}").ok();
    }
}
