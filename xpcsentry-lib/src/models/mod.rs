//! Core data models for xpcsentry.
//!
//! This module provides the value types shared by the resolver, the
//! code-identity resolver and the detection engine: supervisor domains,
//! services and endpoints, code identities, and connection records.

pub mod connection;
pub mod domain;
pub mod identity;
pub mod service;

// Re-export the main types for convenience
pub use connection::{ConnectionEvent, ConnectionRecord, ProcessDescriptor, Verdict, VerdictReason};
pub use domain::{Domain, DomainParseError, RequesterScope, XpcDomainType};
pub use identity::CodeIdentity;
pub use service::{Endpoint, EndpointKind, ProgramTarget, Service, ServiceTarget};
