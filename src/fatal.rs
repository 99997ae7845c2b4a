//! Escalation of unrecoverable errors.
//!
//! Queue connection errors must stop the process so an external supervisor
//! can restart it. The decision is made through [`FatalPolicy`] so embedders
//! and tests can observe escalation without exiting.

use tracing::error;

use crate::BellError;

/// Handler for errors the process cannot continue past.
pub trait FatalPolicy: Send + Sync + 'static {
    /// Take ownership of an unrecoverable error.
    fn escalate(&self, error: BellError);
}

/// Logs the error and exits the process.
#[derive(Debug, Clone, Copy)]
pub struct ExitProcess {
    code: i32,
}

impl Default for ExitProcess {
    fn default() -> Self {
        Self { code: 1 }
    }
}

impl ExitProcess {
    /// Exit with a specific status code
    pub fn with_code(code: i32) -> Self {
        Self { code }
    }
}

impl FatalPolicy for ExitProcess {
    fn escalate(&self, error: BellError) {
        error!("Fatal: {}", error);
        for suggestion in error.recovery_suggestions() {
            error!("  - {}", suggestion);
        }
        std::process::exit(self.code);
    }
}

impl<F> FatalPolicy for F
where
    F: Fn(BellError) + Send + Sync + 'static,
{
    fn escalate(&self, error: BellError) {
        self(error)
    }
}
