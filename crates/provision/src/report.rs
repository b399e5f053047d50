use std::fmt;

use serde::{Deserialize, Serialize};

/// One recorded, non-fatal problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub message: String,
}

/// Collects step failures for a run. A run with any failure ends `Failed`;
/// nothing here stops the phase.
#[derive(Debug, Default)]
pub struct Aggregator {
    failures: Vec<StepFailure>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_error(&mut self, step: &str, error: impl fmt::Display) {
        let message = error.to_string();
        tracing::warn!(step, %message, "step failure recorded");
        self.failures.push(StepFailure {
            step: step.to_string(),
            message,
        });
    }

    /// Take over failures recorded before a reboot.
    pub fn absorb(&mut self, carried: impl IntoIterator<Item = StepFailure>) {
        self.failures.extend(carried);
    }

    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failures(&self) -> &[StepFailure] {
        &self.failures
    }

    pub fn summarize(&self) -> Summary {
        Summary {
            failures: self.failures.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub failures: Vec<StepFailure>,
}

impl Summary {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            return write!(f, "Provisioning completed successfully");
        }
        write!(
            f,
            "Provisioning finished with {} error(s):",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  - {}: {}", failure.step, failure.message)?;
        }
        Ok(())
    }
}
