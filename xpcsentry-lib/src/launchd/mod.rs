//! Client for launchd's private query protocol and the endpoint resolver
//! built on it.

#[cfg(target_os = "macos")]
mod ffi;
pub mod parser;
pub mod process;
pub mod protocol;
pub mod resolver;
pub mod transport;

pub use process::{ProgramLocator, SysinfoLocator};
pub use protocol::{AttributeEndpoint, DEFAULT_SHMEM_SIZE, Reply, Request, Routine, ServiceAttributes};
pub use resolver::{CacheEntry, Resolver, ResolverConfig, ResolverStatsSnapshot, ServiceCache};
pub use transport::{LaunchdTransport, Supervisor, TransportError};
