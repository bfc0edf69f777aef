//! Reconciliation outcomes
//!
//! Every operation reports exactly one [`Outcome`]. Multi-step operations
//! fold their sub-results with [`Outcome::combine`], which keeps the more
//! severe of the two.

use serde::{Deserialize, Serialize};

/// Result of reconciling one path, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Reality already matched the promise
    #[default]
    NoChange,
    /// The filesystem was changed to match the promise
    Changed,
    /// A change is needed but was only reported
    Warned,
    /// The remote source went away mid-operation
    Interrupted,
    /// Policy refused the operation
    Denied,
    /// The operation could not be completed
    Failed,
}

impl Outcome {
    /// Worse of two outcomes.
    ///
    /// Failed > Denied > Interrupted > Warned > Changed > NoChange
    pub fn combine(self, other: Outcome) -> Outcome {
        self.max(other)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Denied | Self::Interrupted)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NoChange => "kept",
            Self::Changed => "repaired",
            Self::Warned => "warning",
            Self::Interrupted => "interrupted",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromIterator<Outcome> for Outcome {
    fn from_iter<I: IntoIterator<Item = Outcome>>(iter: I) -> Self {
        iter.into_iter().fold(Outcome::NoChange, Outcome::combine)
    }
}
