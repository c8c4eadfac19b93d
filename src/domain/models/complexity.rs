//! Eight-dimension complexity classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rating of one complexity dimension. `Critical` is only produced for risk
/// (by explicit override) and counts as High everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl ComplexityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn is_high(&self) -> bool {
        *self >= Self::High
    }
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket that groups execution records for learning.
pub type ComplexityBucket = ComplexityLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ComplexityProfile {
    pub cognitive: ComplexityLevel,
    pub technical: ComplexityLevel,
    pub coordination: ComplexityLevel,
    pub data: ComplexityLevel,
    pub time_sensitivity: ComplexityLevel,
    pub quality: ComplexityLevel,
    pub scope: ComplexityLevel,
    pub risk: ComplexityLevel,
}

impl ComplexityProfile {
    pub fn dimensions(&self) -> [ComplexityLevel; 8] {
        [
            self.cognitive,
            self.technical,
            self.coordination,
            self.data,
            self.time_sensitivity,
            self.quality,
            self.scope,
            self.risk,
        ]
    }

    /// Number of dimensions rated High or above.
    pub fn high_count(&self) -> usize {
        self.dimensions().iter().filter(|d| d.is_high()).count()
    }

    /// Overall bucket: three or more High dimensions is Critical, two High,
    /// one Medium, none Low.
    pub fn bucket(&self) -> ComplexityBucket {
        match self.high_count() {
            0 => ComplexityLevel::Low,
            1 => ComplexityLevel::Medium,
            2 => ComplexityLevel::High,
            _ => ComplexityLevel::Critical,
        }
    }

    /// Wide scope: the scope dimension is High or above.
    pub fn is_wide_scope(&self) -> bool {
        self.scope.is_high()
    }

    pub fn requires_decomposition(&self) -> bool {
        self.bucket().is_high() || self.scope.is_high() || self.coordination.is_high()
    }
}
