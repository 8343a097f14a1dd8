//! The four independent classification axes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    InputStructure,
    CoreConstraints,
    Objective,
    Invariant,
}

/// How the attempts of one (item, dimension) pair are reduced to a consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteMode {
    /// One dominant label per attempt; plurality wins.
    Single,
    /// A set of labels per attempt; each label needs a strict majority.
    Set,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::InputStructure,
        Dimension::CoreConstraints,
        Dimension::Objective,
        Dimension::Invariant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::InputStructure => "input_structure",
            Dimension::CoreConstraints => "core_constraints",
            Dimension::Objective => "objective",
            Dimension::Invariant => "invariant",
        }
    }

    /// Position in [`Dimension::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Dimension::InputStructure => 0,
            Dimension::CoreConstraints => 1,
            Dimension::Objective => 2,
            Dimension::Invariant => 3,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Dimension::InputStructure => "Input Structure",
            Dimension::CoreConstraints => "Core Constraints",
            Dimension::Objective => "Objective",
            Dimension::Invariant => "Algorithmic Invariant",
        }
    }

    /// Vote mode used unless configuration overrides the invariant axis.
    pub fn default_vote_mode(&self) -> VoteMode {
        match self {
            Dimension::InputStructure | Dimension::Objective => VoteMode::Single,
            Dimension::CoreConstraints | Dimension::Invariant => VoteMode::Set,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dimension: {0}")]
pub struct UnknownDimension(pub String);

impl FromStr for Dimension {
    type Err = UnknownDimension;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "input_structure" => Ok(Dimension::InputStructure),
            "core_constraints" | "constraints" => Ok(Dimension::CoreConstraints),
            "objective" => Ok(Dimension::Objective),
            "invariant" | "invariants" => Ok(Dimension::Invariant),
            _ => Err(UnknownDimension(s.to_string())),
        }
    }
}
