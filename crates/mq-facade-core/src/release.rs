//! Best-effort release bookkeeping for facade teardown.
//!
//! `close` never propagates a failure. Each release step records its outcome
//! in a [`ReleaseReport`]; failures are logged at `warn` as they happen and
//! kept for the caller to inspect.

use crate::error::{error_chain, MqError};
use tracing::warn;

#[cfg(test)]
#[path = "release_tests.rs"]
mod tests;

/// One resource that could not be released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub resource: String,
    pub message: String,
}

impl ReleaseFailure {
    /// View the failure as an error value
    pub fn to_error(&self) -> MqError {
        MqError::ResourceRelease {
            resource: self.resource.clone(),
            message: self.message.clone(),
        }
    }
}

/// Outcome of releasing a facade's resources
#[derive(Debug, Clone, Default)]
pub struct ReleaseReport {
    released: Vec<String>,
    failures: Vec<ReleaseFailure>,
}

impl ReleaseReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of releasing `resource`
    pub fn record(&mut self, resource: impl Into<String>, result: Result<(), MqError>) {
        let resource = resource.into();
        match result {
            Ok(()) => self.released.push(resource),
            Err(e) => {
                let message = error_chain(&e);
                warn!(resource = %resource, error = %message, "Failed to release resource");
                self.failures.push(ReleaseFailure { resource, message });
            }
        }
    }

    /// Fold another report into this one, keeping release order
    pub fn merge(&mut self, other: ReleaseReport) {
        self.released.extend(other.released);
        self.failures.extend(other.failures);
    }

    /// Resources released successfully, in release order
    pub fn released(&self) -> &[String] {
        &self.released
    }

    pub fn failures(&self) -> &[ReleaseFailure] {
        &self.failures
    }

    /// True when every attempted release succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when nothing was held, so nothing was attempted
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.failures.is_empty()
    }
}

impl std::fmt::Display for ReleaseReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "released {} resource(s), {} failure(s)",
            self.released.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.resource, failure.message)?;
        }
        Ok(())
    }
}
