use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::GapwatchError;

/// Which workflow a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Main scan shortly after the US open.
    Primary,
    /// Follow-up scan later in the session.
    SecondLook,
    /// Operator-triggered scan.
    Manual,
}

impl ScanKind {
    /// Snake-case label used in events and files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::SecondLook => "second_look",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanKind {
    type Err = GapwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "second_look" => Ok(Self::SecondLook),
            "manual" => Ok(Self::Manual),
            other => Err(GapwatchError::InvalidArg(format!("unknown scan kind '{other}'"))),
        }
    }
}
