//! Diagnostics context handed to each adapter.
//!
//! Verbosity travels with the adapter instead of living in process-wide state,
//! so two adapters in one test can behave differently.

use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub verbose: bool,
}

impl Diagnostics {
    pub fn verbose() -> Self {
        Self { verbose: true }
    }

    pub fn quiet() -> Self {
        Self { verbose: false }
    }

    /// Report an optional field the backend cannot carry. Silent unless verbose.
    ///
    /// Returns whether the note was emitted.
    pub fn absorbed(&self, backend: &str, field: &str) -> bool {
        if self.verbose {
            info!(backend = %backend, field = %field, "Field not supported by backend, ignored");
        }
        self.verbose
    }

    /// Emit a verbose-only progress note.
    pub fn note(&self, backend: &str, message: &str) {
        if self.verbose {
            info!(backend = %backend, "{}", message);
        }
    }
}
