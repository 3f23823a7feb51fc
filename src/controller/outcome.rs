//! Typed soft failures
//!
//! Cleanup, restore and the ConfigMap convenience updates keep going when an
//! individual step fails. Instead of swallowing those errors into log lines
//! they are collected into a [`BestEffort`] report that callers (and tests)
//! can inspect.

use std::fmt;

use tracing::warn;

/// One absorbed failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftFailure {
    pub operation: String,
    pub message: String,
}

impl fmt::Display for SoftFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

/// Outcome of a best-effort operation: it always completes, possibly with
/// soft failures.
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct BestEffort {
    failures: Vec<SoftFailure>,
}

impl BestEffort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `result`, logging and keeping the error if it failed.
    pub fn absorb<T, E: fmt::Display>(
        &mut self,
        operation: impl Into<String>,
        result: Result<T, E>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.fail(operation, e.to_string());
                None
            }
        }
    }

    pub fn fail(&mut self, operation: impl Into<String>, message: impl Into<String>) {
        let failure = SoftFailure {
            operation: operation.into(),
            message: message.into(),
        };
        warn!(operation = %failure.operation, error = %failure.message, "Best-effort step failed");
        self.failures.push(failure);
    }

    pub fn merge(&mut self, other: BestEffort) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[SoftFailure] {
        &self.failures
    }
}

impl fmt::Display for BestEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return f.write_str("no failures");
        }
        let joined: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
        f.write_str(&joined.join("; "))
    }
}
