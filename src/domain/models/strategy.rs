use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fan-out shape a workflow executes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    DirectExecution,
    SequentialDecomposition,
    ParallelExecution,
    RecursiveDecomposition,
    CouncilDriven,
    IterativeRefinement,
}

impl Strategy {
    pub const ALL: [Strategy; 6] = [
        Self::DirectExecution,
        Self::SequentialDecomposition,
        Self::ParallelExecution,
        Self::RecursiveDecomposition,
        Self::CouncilDriven,
        Self::IterativeRefinement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectExecution => "direct_execution",
            Self::SequentialDecomposition => "sequential_decomposition",
            Self::ParallelExecution => "parallel_execution",
            Self::RecursiveDecomposition => "recursive_decomposition",
            Self::CouncilDriven => "council_driven",
            Self::IterativeRefinement => "iterative_refinement",
        }
    }

    /// Concurrent slots the shape needs to be worth running.
    pub fn required_slots(&self) -> usize {
        match self {
            Self::ParallelExecution | Self::RecursiveDecomposition => 2,
            _ => 1,
        }
    }

    /// The next cheaper shape when resources cannot be reserved.
    pub fn degraded(&self) -> Option<Strategy> {
        match self {
            Self::RecursiveDecomposition | Self::ParallelExecution => Some(Self::SequentialDecomposition),
            Self::CouncilDriven | Self::IterativeRefinement | Self::SequentialDecomposition => {
                Some(Self::DirectExecution)
            }
            Self::DirectExecution => None,
        }
    }

    /// Whether the shape spawns children under a coordinating root agent.
    pub fn decomposes(&self) -> bool {
        matches!(
            self,
            Self::SequentialDecomposition | Self::ParallelExecution | Self::RecursiveDecomposition
        )
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| format!("Invalid strategy: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degradation_chain_terminates() {
        for start in Strategy::ALL {
            let mut current = start;
            let mut steps = 0;
            while let Some(next) = current.degraded() {
                assert!(next.required_slots() <= current.required_slots());
                current = next;
                steps += 1;
            }
            assert_eq!(current, Strategy::DirectExecution);
            assert!(steps <= 2);
        }
    }

    #[test]
    fn test_round_trip_str() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.as_str().parse::<Strategy>().unwrap(), strategy);
        }
    }
}
