use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse stage of processing one work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Run,
    Extract,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Setup, Phase::Run, Phase::Extract];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Run => "run",
            Phase::Extract => "extract",
        }
    }

    /// Subtask key under which this phase's durations are tracked.
    pub fn subtask(&self) -> &'static str {
        match self {
            Phase::Setup => "setup_scene",
            Phase::Run => "run_simulation",
            Phase::Extract => "extract_results",
        }
    }

    /// Phases that must be valid before this one can run.
    pub fn upstream(&self) -> &'static [Phase] {
        match self {
            Phase::Setup => &[],
            Phase::Run => &[Phase::Setup],
            Phase::Extract => &[Phase::Setup, Phase::Run],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "setup" => Ok(Phase::Setup),
            "run" => Ok(Phase::Run),
            "extract" => Ok(Phase::Extract),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parse_and_display() {
        for phase in Phase::ALL {
            assert_eq!(phase.to_string().parse::<Phase>(), Ok(phase));
        }
        assert!("simulate".parse::<Phase>().is_err());
        assert_eq!(" Extract ".parse::<Phase>(), Ok(Phase::Extract));
    }

    #[test]
    fn test_upstream_order() {
        assert!(Phase::Setup.upstream().is_empty());
        assert_eq!(Phase::Extract.upstream(), &[Phase::Setup, Phase::Run]);
    }
}
