//! Services and endpoints as reported by the supervisor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A supervisor-managed job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    /// Runtime identity (a pid), absent when the job is not running
    pub handle: Option<u64>,
    /// Stable label
    pub name: String,
}

impl Service {
    /// Create a service with an optional runtime handle.
    pub fn new(handle: Option<u64>, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
        }
    }

    /// Create a service that is known only by its label.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(None, name)
    }
}

/// Which endpoint section of a service record an endpoint was listed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Standard,
    PidLocal,
    InstanceSpecific,
}

impl EndpointKind {
    /// Header line that opens this kind's section in a service dump.
    pub const fn section_header(self) -> &'static str {
        match self {
            Self::Standard => "endpoints = {",
            Self::PidLocal => "pid-local endpoints = {",
            Self::InstanceSpecific => "instance-specific endpoints = {",
        }
    }

    /// All kinds, in the order their sections are scanned.
    pub const ALL: [Self; 3] = [Self::Standard, Self::PidLocal, Self::InstanceSpecific];
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::PidLocal => write!(f, "pid-local"),
            Self::InstanceSpecific => write!(f, "instance-specific"),
        }
    }
}

/// A named low-level communication channel advertised by a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub kind: EndpointKind,
    /// Raw port string (e.g. `0x4f03`) when the supervisor exposes it
    pub port: Option<String>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, kind: EndpointKind, port: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            port,
        }
    }

    /// Deduplication key.
    pub fn key(&self) -> (&str, EndpointKind) {
        (&self.name, self.kind)
    }
}

/// One service's detail record, resolved to its program and endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub service: Service,
    pub program_path: String,
    pub endpoints: Vec<Endpoint>,
}

impl ServiceTarget {
    /// Whether this service advertises an endpoint with the given name.
    pub fn advertises(&self, endpoint_name: &str) -> bool {
        self.endpoints.iter().any(|e| e.name == endpoint_name)
    }
}

/// Program reference extracted from a service record.
///
/// When `pid` is present, `path` is only a stem and the real executable
/// path must be looked up from the process id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramTarget {
    pub path: String,
    pub pid: Option<i32>,
}

impl ProgramTarget {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pid: None,
        }
    }

    pub fn with_pid(stem: impl Into<String>, pid: i32) -> Self {
        Self {
            path: stem.into(),
            pid: Some(pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_target_advertises() {
        let target = ServiceTarget {
            service: Service::new(Some(812), "com.xpc.example.agent"),
            program_path: "/Users/csaby/SampleLaunchAgent".to_owned(),
            endpoints: vec![
                Endpoint::new("com.xpc.example.agent.hello", EndpointKind::Standard, Some("0x4f03".to_owned())),
                Endpoint::new("com.xpc.example.agent.local", EndpointKind::PidLocal, None),
            ],
        };
        assert!(target.advertises("com.xpc.example.agent.hello"));
        assert!(target.advertises("com.xpc.example.agent.local"));
        assert!(!target.advertises("com.xpc.example.agent"));
    }

    #[test]
    fn test_endpoint_kind_headers_are_distinct() {
        let headers: Vec<_> = EndpointKind::ALL.iter().map(|k| k.section_header()).collect();
        assert_eq!(headers.len(), 3);
        assert!(headers.iter().all(|h| h.ends_with("endpoints = {")));
        assert_eq!(EndpointKind::PidLocal.to_string(), "pid-local");
    }

    #[test]
    fn test_program_target_constructors() {
        assert_eq!(ProgramTarget::path("/bin/ls").pid, None);
        let t = ProgramTarget::with_pid("com.apple.WebKit.Networking", 931);
        assert_eq!(t.pid, Some(931));
        assert_eq!(t.path, "com.apple.WebKit.Networking");
    }
}
