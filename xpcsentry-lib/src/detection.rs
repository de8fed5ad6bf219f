//! Impersonation detection for endpoint connections.
//!
//! A connection is suspicious when the requesting process does not carry
//! the code identity of the program that owns the endpoint it connected to.
//! Team identifiers are compared first since they are the harder field to
//! forge; signing identifiers are only compared when the owner has no team.

use crate::config::DetectionConfig;
use crate::models::{CodeIdentity, Verdict, VerdictReason};

/// Stateless classifier for (owner, requester) identity pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionPolicy {
    trusted_signing_prefixes: Vec<String>,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self::from(&DetectionConfig::default())
    }
}

impl From<&DetectionConfig> for DetectionPolicy {
    fn from(config: &DetectionConfig) -> Self {
        Self::new(config.trusted_signing_prefixes.iter().cloned())
    }
}

impl DetectionPolicy {
    /// Creates a policy exempting owners whose signing identifier starts with
    /// one of `trusted_signing_prefixes`. Empty prefixes are ignored.
    pub fn new(trusted_signing_prefixes: impl IntoIterator<Item = String>) -> Self {
        Self {
            trusted_signing_prefixes: trusted_signing_prefixes
                .into_iter()
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn trusted_signing_prefixes(&self) -> &[String] {
        &self.trusted_signing_prefixes
    }

    fn is_trusted(&self, signing_id: &str) -> bool {
        self.trusted_signing_prefixes
            .iter()
            .any(|prefix| signing_id.starts_with(prefix.as_str()))
    }

    /// Classifies a connection from `requester` to an endpoint owned by `owner`.
    pub fn classify(&self, owner: &CodeIdentity, requester: &CodeIdentity) -> Verdict {
        if owner.signing_id.is_empty() {
            return Verdict::benign(VerdictReason::UnresolvedOwner);
        }

        if self.is_trusted(&owner.signing_id) {
            return Verdict::benign(VerdictReason::TrustedVendor);
        }

        if !owner.team_id.is_empty() {
            if owner.team_id != requester.team_id {
                return Verdict::suspicious(VerdictReason::TeamMismatch);
            }
        } else if owner.signing_id != requester.signing_id {
            return Verdict::suspicious(VerdictReason::SigningIdMismatch);
        }

        Verdict::benign(VerdictReason::IdentityMatch)
    }
}
