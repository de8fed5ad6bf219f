#![deny(unsafe_code)]

//! xpcsentry-lib: endpoint ownership resolution and XPC impersonation detection.
//!
//! This library provides the components shared by the xpcsentry agent and CLI:
//! - A client for launchd's private query protocol and a parser for its dumps
//! - Resolution of named endpoints to the programs that own them
//! - Code-signing identity extraction
//! - Classification of connections whose requester does not match the owner
//! - Configuration management with hierarchical overrides
//! - Logging setup and performance telemetry

pub mod codesign;
pub mod config;
pub mod detection;
pub mod launchd;
pub mod models;
pub mod telemetry;

pub use codesign::{CodeIdentityResolver, CodesignTool, SigningInspector};
pub use detection::DetectionPolicy;
pub use launchd::{LaunchdTransport, Resolver, ResolverConfig, Supervisor};
