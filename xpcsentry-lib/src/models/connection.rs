//! Connection events and the per-connection output record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::domain::{Domain, RequesterScope, XpcDomainType};
use crate::models::identity::CodeIdentity;

/// The process that opened a connection to a named endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub pid: i32,
    pub euid: u32,
    pub audit_session_id: u64,
    pub path: String,
    pub signing_id: String,
    pub team_id: String,
}

impl ProcessDescriptor {
    /// Identity as reported by the event source.
    pub fn identity(&self) -> CodeIdentity {
        CodeIdentity::new(&self.path, &self.signing_id, &self.team_id)
    }

    pub const fn scope(&self) -> RequesterScope {
        RequesterScope {
            pid: self.pid,
            euid: self.euid,
            audit_session_id: self.audit_session_id,
        }
    }
}

/// One connection notification delivered by the event-capture collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub requester: ProcessDescriptor,
    pub service_name: String,
    pub domain_type: XpcDomainType,
}

impl ConnectionEvent {
    /// The domain to resolve the endpoint in, if the kind is queryable.
    pub fn domain(&self) -> Option<Domain> {
        Domain::from_event(self.domain_type, self.requester.scope())
    }
}

/// Why a connection was or was not flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    /// The endpoint owner has no signing identifier to compare against
    UnresolvedOwner,
    /// The endpoint owner is platform-signed
    TrustedVendor,
    /// Team identifiers differ
    TeamMismatch,
    /// Owner has no team; signing identifiers differ
    SigningIdMismatch,
    /// Identities agree
    IdentityMatch,
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UnresolvedOwner => "unresolved owner",
            Self::TrustedVendor => "trusted vendor",
            Self::TeamMismatch => "team identifier mismatch",
            Self::SigningIdMismatch => "signing identifier mismatch",
            Self::IdentityMatch => "identity match",
        };
        f.write_str(label)
    }
}

/// Classification of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub suspicious: bool,
    pub reason: VerdictReason,
}

impl Verdict {
    pub const fn benign(reason: VerdictReason) -> Self {
        Self {
            suspicious: false,
            reason,
        }
    }

    pub const fn suspicious(reason: VerdictReason) -> Self {
        Self {
            suspicious: true,
            reason,
        }
    }
}

/// Structured record produced for each processed connection.
///
/// Unresolved endpoints keep their row with an empty `program_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub timestamp: DateTime<Utc>,
    pub service_name: String,
    pub domain: Domain,
    pub program_path: String,
    pub owner_team_id: String,
    pub owner_signing_id: String,
    pub requester_path: String,
    pub requester_team_id: String,
    pub requester_signing_id: String,
    pub suspicious: bool,
    pub reason: VerdictReason,
}

impl ConnectionRecord {
    pub fn new(
        service_name: impl Into<String>,
        domain: Domain,
        owner: &CodeIdentity,
        requester: &CodeIdentity,
        verdict: Verdict,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            service_name: service_name.into(),
            domain,
            program_path: owner.path.clone(),
            owner_team_id: owner.team_id.clone(),
            owner_signing_id: owner.signing_id.clone(),
            requester_path: requester.path.clone(),
            requester_team_id: requester.team_id.clone(),
            requester_signing_id: requester.signing_id.clone(),
            suspicious: verdict.suspicious,
            reason: verdict.reason,
        }
    }
}
