//! Supervisor domain (namespace) types.
//!
//! A domain scopes a set of launchd-managed services: the whole system, a
//! single user, a login session, a single process, or a GUI session. Every
//! variant maps onto the numeric `(handle, type)` pair that the supervisor
//! expects in a request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing a domain specifier such as `gui/501`.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DomainParseError {
    #[error("Unknown domain kind: {0}")]
    UnknownKind(String),

    #[error("Domain {kind} requires a numeric identifier")]
    MissingIdentifier { kind: String },

    #[error("Invalid identifier '{value}' for domain {kind}")]
    InvalidIdentifier { kind: String, value: String },
}

/// A supervisor-managed namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Domain {
    /// The system-wide domain.
    System,
    /// Per-user domain for a uid.
    User(u32),
    /// Per-login-session domain for an audit session id.
    Login(u64),
    /// Per-process domain for a pid.
    Pid(u32),
    /// GUI session domain for a uid.
    Gui(u32),
}

impl Domain {
    /// Wire type code for the system domain.
    pub const TYPE_SYSTEM: u64 = 1;
    /// Wire type code for per-user domains.
    pub const TYPE_USER: u64 = 2;
    /// Wire type code for login-session domains.
    pub const TYPE_LOGIN: u64 = 3;
    /// Wire type code for per-process domains.
    pub const TYPE_PID: u64 = 5;
    /// Wire type code for GUI domains.
    pub const TYPE_GUI: u64 = 8;

    /// Numeric handle sent in the request's `handle` field.
    pub fn handle(&self) -> u64 {
        match *self {
            Self::System => 0,
            Self::User(id) | Self::Gui(id) | Self::Pid(id) => u64::from(id),
            Self::Login(asid) => asid,
        }
    }

    /// Numeric type code sent in the request's `type` field.
    pub const fn domain_type(&self) -> u64 {
        match *self {
            Self::System => Self::TYPE_SYSTEM,
            Self::User(_) => Self::TYPE_USER,
            Self::Login(_) => Self::TYPE_LOGIN,
            Self::Pid(_) => Self::TYPE_PID,
            Self::Gui(_) => Self::TYPE_GUI,
        }
    }

    /// Launchctl-style specifier, also used as the cache key.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// The sub-domain in which disabled services of this domain are re-queried.
    ///
    /// System stays System and a user domain escalates to the GUI session of
    /// the same uid. Login, Pid and Gui domains have no escalation.
    pub const fn escalated(&self) -> Option<Self> {
        match *self {
            Self::System => Some(Self::System),
            Self::User(uid) => Some(Self::Gui(uid)),
            Self::Login(_) | Self::Pid(_) | Self::Gui(_) => None,
        }
    }

    /// Maps an event's domain kind onto a concrete domain for the requester.
    ///
    /// Returns `None` for the session and port kinds, which have no
    /// counterpart among the queryable domains, and for a negative pid.
    pub fn from_event(kind: XpcDomainType, requester: RequesterScope) -> Option<Self> {
        match kind {
            XpcDomainType::System | XpcDomainType::Manager => Some(Self::System),
            XpcDomainType::User => Some(Self::User(requester.euid)),
            XpcDomainType::UserLogin => Some(Self::Login(requester.audit_session_id)),
            XpcDomainType::Pid => u32::try_from(requester.pid).ok().map(Self::Pid),
            XpcDomainType::Gui => Some(Self::Gui(requester.euid)),
            XpcDomainType::Session | XpcDomainType::Port => None,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::System => write!(f, "system"),
            Self::User(uid) => write!(f, "user/{uid}"),
            Self::Login(asid) => write!(f, "login/{asid}"),
            Self::Pid(pid) => write!(f, "pid/{pid}"),
            Self::Gui(uid) => write!(f, "gui/{uid}"),
        }
    }
}

impl FromStr for Domain {
    type Err = DomainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('/');
        let (kind, id) = match trimmed.split_once('/') {
            Some((kind, id)) => (kind.to_lowercase(), Some(id)),
            None => (trimmed.to_lowercase(), None),
        };

        if kind == "system" {
            return Ok(Self::System);
        }

        let id = id.ok_or_else(|| match kind.as_str() {
            "user" | "login" | "pid" | "gui" => DomainParseError::MissingIdentifier {
                kind: kind.clone(),
            },
            _ => DomainParseError::UnknownKind(kind.clone()),
        })?;

        let invalid = || DomainParseError::InvalidIdentifier {
            kind: kind.clone(),
            value: id.to_owned(),
        };

        match kind.as_str() {
            "user" => id.parse().map(Self::User).map_err(|_err| invalid()),
            "gui" => id.parse().map(Self::Gui).map_err(|_err| invalid()),
            "login" => id.parse().map(Self::Login).map_err(|_err| invalid()),
            "pid" => id.parse().map(Self::Pid).map_err(|_err| invalid()),
            _ => Err(DomainParseError::UnknownKind(kind.clone())),
        }
    }
}

/// Domain classifier as reported by the connection-event collaborator.
///
/// The numeric values are the supervisor's own domain-type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XpcDomainType {
    System,
    User,
    UserLogin,
    Session,
    Pid,
    Manager,
    Port,
    Gui,
}

impl XpcDomainType {
    /// Decodes a raw domain-type code.
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::System),
            2 => Some(Self::User),
            3 => Some(Self::UserLogin),
            4 => Some(Self::Session),
            5 => Some(Self::Pid),
            6 => Some(Self::Manager),
            7 => Some(Self::Port),
            8 => Some(Self::Gui),
            _ => None,
        }
    }

    /// The raw domain-type code.
    pub const fn code(self) -> u64 {
        match self {
            Self::System => 1,
            Self::User => 2,
            Self::UserLogin => 3,
            Self::Session => 4,
            Self::Pid => 5,
            Self::Manager => 6,
            Self::Port => 7,
            Self::Gui => 8,
        }
    }
}

impl fmt::Display for XpcDomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::System => "system",
            Self::User => "user",
            Self::UserLogin => "user_login",
            Self::Session => "session",
            Self::Pid => "pid",
            Self::Manager => "manager",
            Self::Port => "port",
            Self::Gui => "gui",
        };
        f.write_str(label)
    }
}

/// The parts of a requesting process that select its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequesterScope {
    pub pid: i32,
    pub euid: u32,
    pub audit_session_id: u64,
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wire_pairs() {
        assert_eq!((Domain::System.handle(), Domain::System.domain_type()), (0, 1));
        assert_eq!((Domain::User(501).handle(), Domain::User(501).domain_type()), (501, 2));
        assert_eq!(
            (Domain::Login(100_004).handle(), Domain::Login(100_004).domain_type()),
            (100_004, 3)
        );
        assert_eq!((Domain::Pid(42).handle(), Domain::Pid(42).domain_type()), (42, 5));
        assert_eq!((Domain::Gui(501).handle(), Domain::Gui(501).domain_type()), (501, 8));
    }

    #[test]
    fn test_escalation() {
        assert_eq!(Domain::System.escalated(), Some(Domain::System));
        assert_eq!(Domain::User(501).escalated(), Some(Domain::Gui(501)));
        assert_eq!(Domain::Gui(501).escalated(), None);
        assert_eq!(Domain::Login(7).escalated(), None);
        assert_eq!(Domain::Pid(7).escalated(), None);
    }

    #[test]
    fn test_parse_specifiers() {
        assert_eq!("system".parse::<Domain>().unwrap(), Domain::System);
        assert_eq!("system/".parse::<Domain>().unwrap(), Domain::System);
        assert_eq!("gui/501".parse::<Domain>().unwrap(), Domain::Gui(501));
        assert_eq!("user/0".parse::<Domain>().unwrap(), Domain::User(0));
        assert_eq!("login/100004".parse::<Domain>().unwrap(), Domain::Login(100_004));
        assert_eq!("pid/123".parse::<Domain>().unwrap(), Domain::Pid(123));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "gui".parse::<Domain>(),
            Err(DomainParseError::MissingIdentifier {
                kind: "gui".to_owned()
            })
        );
        assert!(matches!(
            "gui/abc".parse::<Domain>(),
            Err(DomainParseError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            "pid/-1".parse::<Domain>(),
            Err(DomainParseError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            "session/1".parse::<Domain>(),
            Err(DomainParseError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_event_kinds_collapse() {
        let scope = RequesterScope {
            pid: 812,
            euid: 501,
            audit_session_id: 100_004,
        };
        assert_eq!(Domain::from_event(XpcDomainType::System, scope), Some(Domain::System));
        assert_eq!(Domain::from_event(XpcDomainType::Manager, scope), Some(Domain::System));
        assert_eq!(Domain::from_event(XpcDomainType::User, scope), Some(Domain::User(501)));
        assert_eq!(
            Domain::from_event(XpcDomainType::UserLogin, scope),
            Some(Domain::Login(100_004))
        );
        assert_eq!(Domain::from_event(XpcDomainType::Pid, scope), Some(Domain::Pid(812)));
        assert_eq!(Domain::from_event(XpcDomainType::Gui, scope), Some(Domain::Gui(501)));
        assert_eq!(Domain::from_event(XpcDomainType::Session, scope), None);
        assert_eq!(Domain::from_event(XpcDomainType::Port, scope), None);
    }

    #[test]
    fn test_negative_pid_has_no_domain() {
        let scope = RequesterScope {
            pid: -1,
            euid: 501,
            audit_session_id: 100_004,
        };
        assert_eq!(Domain::from_event(XpcDomainType::Pid, scope), None);
        assert_eq!(Domain::from_event(XpcDomainType::Gui, scope), Some(Domain::Gui(501)));
    }

    #[test]
    fn test_domain_type_codes() {
        for code in 1..=8 {
            let kind = XpcDomainType::from_code(code).expect("known code");
            assert_eq!(kind.code(), code);
        }
        assert_eq!(XpcDomainType::from_code(0), None);
        assert_eq!(XpcDomainType::from_code(9), None);
    }

    fn any_domain() -> impl Strategy<Value = Domain> {
        prop_oneof![
            Just(Domain::System),
            any::<u32>().prop_map(Domain::User),
            any::<u64>().prop_map(Domain::Login),
            any::<u32>().prop_map(Domain::Pid),
            any::<u32>().prop_map(Domain::Gui),
        ]
    }

    proptest! {
        #[test]
        fn prop_wire_pair_is_stable(domain in any_domain()) {
            let first = (domain.handle(), domain.domain_type());
            let copy = domain;
            prop_assert_eq!(first, (copy.handle(), copy.domain_type()));
        }

        #[test]
        fn prop_specifier_round_trips(domain in any_domain()) {
            let parsed: Domain = domain.name().parse().expect("specifier parses");
            prop_assert_eq!(parsed, domain);
            prop_assert_eq!(parsed.handle(), domain.handle());
        }
    }
}
