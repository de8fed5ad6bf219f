//! Request and reply shapes for the supervisor's private query protocol.
//!
//! The protocol is undocumented. Each request is a dictionary with four
//! integer fields (`type`, `handle`, `subsystem`, `routine`), an optional
//! `name`, and for the textual routines a shared-memory region that the
//! supervisor writes its human-readable dump into.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Domain, Endpoint, EndpointKind, ProgramTarget};

/// Default shared-memory region size for textual replies (1 MiB).
pub const DEFAULT_SHMEM_SIZE: usize = 0x10_0000;

/// Known supervisor routines.
///
/// The routine/subsystem pairs were recovered by observing `launchctl`.
/// Wrong values are answered with a supervisor-side error, so new routines
/// belong here as new variants rather than as free integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Routine {
    /// `launchctl print <domain>/<service>`: one service's detail record.
    PrintService,
    /// `launchctl print <domain>`: a whole domain's listing.
    PrintDomain,
    /// Direct attribute lookup returning a structured dictionary.
    ServiceAttributes,
}

impl Routine {
    pub const fn routine(self) -> u64 {
        match self {
            Self::PrintService => 708,
            Self::PrintDomain => 828,
            Self::ServiceAttributes => 712,
        }
    }

    pub const fn subsystem(self) -> u64 {
        match self {
            Self::PrintService | Self::ServiceAttributes => 2,
            Self::PrintDomain => 3,
        }
    }

    /// Whether the reply payload arrives through a shared-memory region.
    pub const fn uses_shared_memory(self) -> bool {
        match self {
            Self::PrintService | Self::PrintDomain => true,
            Self::ServiceAttributes => false,
        }
    }
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PrintService => "print-service",
            Self::PrintDomain => "print-domain",
            Self::ServiceAttributes => "service-attributes",
        };
        write!(f, "{label}({}/{})", self.routine(), self.subsystem())
    }
}

/// One request to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub handle: u64,
    pub domain_type: u64,
    pub routine: Routine,
    pub name: Option<String>,
}

impl Request {
    /// A request scoped to `domain`, optionally naming a service.
    pub fn new(domain: Domain, routine: Routine, name: Option<&str>) -> Self {
        Self {
            handle: domain.handle(),
            domain_type: domain.domain_type(),
            routine,
            name: name.map(ToOwned::to_owned),
        }
    }

    /// Print a whole domain.
    pub fn print_domain(domain: Domain) -> Self {
        Self::new(domain, Routine::PrintDomain, None)
    }

    /// Print one service in a domain.
    pub fn print_service(domain: Domain, service: &str) -> Self {
        Self::new(domain, Routine::PrintService, Some(service))
    }

    /// Look up a service's attributes.
    pub fn service_attributes(domain: Domain, service: &str) -> Self {
        Self::new(domain, Routine::ServiceAttributes, Some(service))
    }

    pub const fn routine(&self) -> u64 {
        self.routine.routine()
    }

    pub const fn subsystem(&self) -> u64 {
        self.routine.subsystem()
    }
}

/// Endpoint entry of an attribute-lookup reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEndpoint {
    /// `XPCServiceEndpointName`
    pub name: String,
    /// `XPCServiceEndpointEvent`
    pub event: bool,
}

/// Structured reply of [`Routine::ServiceAttributes`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAttributes {
    pub program: Option<String>,
    pub endpoints: Vec<AttributeEndpoint>,
}

impl ServiceAttributes {
    pub fn program_target(&self) -> Option<ProgramTarget> {
        self.program
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(ProgramTarget::path)
    }

    /// Endpoints in model form. Event endpoints carry no port.
    pub fn model_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .map(|e| Endpoint::new(&e.name, EndpointKind::Standard, None))
            .collect()
    }
}

/// A supervisor reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Text copied out of the shared-memory region.
    Text(String),
    /// Structured attribute dictionary.
    Attributes(ServiceAttributes),
}

impl Reply {
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Attributes(_) => None,
        }
    }

    pub fn into_attributes(self) -> Option<ServiceAttributes> {
        match self {
            Self::Attributes(attrs) => Some(attrs),
            Self::Text(_) => None,
        }
    }
}
