//! Code-signing identity.

use serde::{Deserialize, Serialize};

/// Code-signing identity of an executable.
///
/// Empty `signing_id` / `team_id` mean "unsigned or unknown". That is a
/// legitimate state consumed by the detection engine, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeIdentity {
    pub path: String,
    pub signing_id: String,
    pub team_id: String,
}

impl CodeIdentity {
    pub fn new(
        path: impl Into<String>,
        signing_id: impl Into<String>,
        team_id: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            signing_id: signing_id.into(),
            team_id: team_id.into(),
        }
    }

    /// Identity for a path whose signature could not be read.
    pub fn unsigned(path: impl Into<String>) -> Self {
        Self::new(path, "", "")
    }

    pub fn is_unsigned(&self) -> bool {
        self.signing_id.is_empty() && self.team_id.is_empty()
    }
}
