//! Endpoint-to-program resolution over the supervisor's domains.
//!
//! The resolver drives [`Supervisor`] queries and the dump parser to answer
//! "which program owns this endpoint?". A domain is searched by listing its
//! services and querying each service's detail record in listing order; the
//! first service that advertises the endpoint wins. Services that are
//! defined but disabled are re-queried afterwards in the domain's escalated
//! sub-domain. Nothing found is a normal outcome and yields an empty path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::LaunchdConfig;
use crate::launchd::parser::{parse_disabled_services, parse_endpoints, parse_program_target, parse_services};
use crate::launchd::process::{ProgramLocator, SysinfoLocator};
use crate::launchd::protocol::{Reply, Request, ServiceAttributes};
use crate::launchd::transport::{LaunchdTransport, Supervisor, TransportError};
use crate::models::{Domain, ProgramTarget, Service, ServiceTarget};

/// Resolver behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Memoize per-domain sweeps for [`Resolver::resolve`].
    pub cache_enabled: bool,
    /// Retry a failed detail query with the structured attribute lookup.
    pub attribute_fallback: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            attribute_fallback: true,
        }
    }
}

impl From<&LaunchdConfig> for ResolverConfig {
    fn from(config: &LaunchdConfig) -> Self {
        Self {
            cache_enabled: config.cache_enabled,
            attribute_fallback: config.attribute_fallback,
        }
    }
}

/// One memoized domain sweep.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub timestamp: DateTime<Utc>,
    pub services: Arc<Vec<ServiceTarget>>,
}

/// Domain sweeps keyed by domain name. Reads, writes and clears share one lock.
#[derive(Debug, Default)]
pub struct ServiceCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ServiceCache {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries().get(key).cloned()
    }

    /// Stores a sweep unless another caller stored one first, and returns
    /// whichever sweep is now cached.
    pub fn insert(&self, key: String, services: Vec<ServiceTarget>) -> Arc<Vec<ServiceTarget>> {
        let mut entries = self.entries();
        let entry = entries.entry(key).or_insert_with(|| CacheEntry {
            timestamp: Utc::now(),
            services: Arc::new(services),
        });
        Arc::clone(&entry.services)
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Drops one domain's sweep. Returns whether it was cached.
    pub fn remove(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Cached domain names, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Counters maintained by a [`Resolver`].
#[derive(Debug, Default)]
pub struct ResolverStats {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of [`ResolverStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverStatsSnapshot {
    pub queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalidations: u64,
}

impl ResolverStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ResolverStatsSnapshot {
        ResolverStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Resolves endpoint names to the programs that own them.
#[derive(Debug)]
pub struct Resolver<S, L = SysinfoLocator> {
    supervisor: S,
    locator: L,
    config: ResolverConfig,
    cache: ServiceCache,
    stats: ResolverStats,
}

impl Resolver<LaunchdTransport, SysinfoLocator> {
    /// Resolver talking to the local launchd.
    pub fn from_config(config: &LaunchdConfig) -> Self {
        Self::new(
            LaunchdTransport::new(config.shmem_size_bytes),
            SysinfoLocator::new(),
            ResolverConfig::from(config),
        )
    }
}

impl<S: Supervisor, L: ProgramLocator> Resolver<S, L> {
    pub fn new(supervisor: S, locator: L, config: ResolverConfig) -> Self {
        Self {
            supervisor,
            locator,
            config,
            cache: ServiceCache::default(),
            stats: ResolverStats::default(),
        }
    }

    pub const fn config(&self) -> ResolverConfig {
        self.config
    }

    pub const fn cache(&self) -> &ServiceCache {
        &self.cache
    }

    pub fn stats(&self) -> ResolverStatsSnapshot {
        self.stats.snapshot()
    }

    fn query(&self, request: &Request) -> Result<Reply, TransportError> {
        ResolverStats::bump(&self.stats.queries);
        self.supervisor.send(request)
    }

    fn query_text(&self, request: &Request) -> Option<String> {
        match self.query(request) {
            Ok(Reply::Text(text)) => Some(text),
            Ok(Reply::Attributes(_)) => {
                warn!(routine = %request.routine, "Expected a textual reply, got attributes");
                None
            }
            Err(e) => {
                debug!(routine = %request.routine, name = ?request.name, error = %e, "No answer from supervisor");
                None
            }
        }
    }

    /// Raw textual dump of a domain, or of one service when `service` is given.
    pub fn print(&self, domain: Domain, service: Option<&str>) -> Result<String, TransportError> {
        let request = match service {
            Some(name) => Request::print_service(domain, name),
            None => Request::print_domain(domain),
        };
        self.query(&request)?
            .into_text()
            .ok_or_else(|| TransportError::MalformedReply("expected a textual reply".to_owned()))
    }

    /// Services listed in a domain, in listing order.
    pub fn domain_services(&self, domain: Domain) -> Option<Vec<Service>> {
        let text = self.query_text(&Request::print_domain(domain))?;
        Some(parse_services(&text))
    }

    /// Labels of the domain's disabled services.
    pub fn disabled_services(&self, domain: Domain) -> Option<Vec<String>> {
        let text = self.query_text(&Request::print_domain(domain))?;
        Some(parse_disabled_services(&text))
    }

    /// Queries one service's detail record in `domain`.
    pub fn service_target(&self, domain: Domain, name: &str) -> Option<ServiceTarget> {
        self.describe(domain, Service::named(name))
    }

    fn describe(&self, domain: Domain, service: Service) -> Option<ServiceTarget> {
        match self.query(&Request::print_service(domain, &service.name)) {
            Ok(Reply::Text(text)) => {
                let program_path = parse_program_target(&text)
                    .map(|target| self.program_path(target))
                    .unwrap_or_default();
                Some(ServiceTarget {
                    service,
                    program_path,
                    endpoints: parse_endpoints(&text),
                })
            }
            Ok(Reply::Attributes(attrs)) => Some(self.target_from_attributes(service, &attrs)),
            Err(e) if self.config.attribute_fallback && !e.is_channel_failure() => {
                trace!(domain = %domain, service = %service.name, error = %e, "Falling back to attribute lookup");
                self.query(&Request::service_attributes(domain, &service.name))
                    .ok()
                    .and_then(Reply::into_attributes)
                    .map(|attrs| self.target_from_attributes(service, &attrs))
            }
            Err(e) => {
                trace!(domain = %domain, service = %service.name, error = %e, "Service detail unavailable");
                None
            }
        }
    }

    fn target_from_attributes(&self, service: Service, attrs: &ServiceAttributes) -> ServiceTarget {
        ServiceTarget {
            service,
            program_path: attrs
                .program_target()
                .map(|target| self.program_path(target))
                .unwrap_or_default(),
            endpoints: attrs.model_endpoints(),
        }
    }

    /// Turns a pid-form program target into a real path, falling back to the stem.
    fn program_path(&self, target: ProgramTarget) -> String {
        match target.pid {
            Some(pid) => self
                .locator
                .program_path_for_pid(pid)
                .map_or(target.path, |path| path.to_string_lossy().into_owned()),
            None => target.path,
        }
    }

    /// Services to re-query for the domain's disabled entries, paired with
    /// the sub-domain to query them in.
    fn disabled_candidates(&self, domain: Domain) -> Option<(Domain, Vec<String>)> {
        let escalated = domain.escalated()?;
        Some((escalated, self.disabled_services(domain).unwrap_or_default()))
    }

    /// Live search that stops at the first service advertising `endpoint`.
    fn search_live(&self, endpoint: &str, domain: Domain) -> Option<String> {
        for service in self.domain_services(domain).unwrap_or_default() {
            if let Some(target) = self.describe(domain, service)
                && target.advertises(endpoint)
            {
                return Some(target.program_path);
            }
        }

        let (escalated, disabled) = self.disabled_candidates(domain)?;
        disabled.into_iter().find_map(|label| {
            self.describe(escalated, Service::named(label))
                .filter(|target| target.advertises(endpoint))
                .map(|target| target.program_path)
        })
    }

    /// Full sweep of a domain. `None` when the domain listing itself failed.
    fn sweep(&self, domain: Domain) -> Option<Vec<ServiceTarget>> {
        let services = self.domain_services(domain)?;
        let mut targets: Vec<ServiceTarget> = services
            .into_iter()
            .filter_map(|service| self.describe(domain, service))
            .collect();

        if let Some((escalated, disabled)) = self.disabled_candidates(domain) {
            targets.extend(
                disabled
                    .into_iter()
                    .filter_map(|label| self.describe(escalated, Service::named(label))),
            );
        }
        Some(targets)
    }

    /// Whether sweeps of `domain` are memoized. Pids are reused by the OS, so
    /// a pid domain is always swept live.
    const fn memoizes(domain: Domain) -> bool {
        !matches!(domain, Domain::Pid(_))
    }

    /// Every service target of `domain`, memoized by domain name.
    ///
    /// A failed domain listing is not cached, and pid domains never are.
    pub fn cached_domain_services(&self, domain: Domain) -> Arc<Vec<ServiceTarget>> {
        if !Self::memoizes(domain) {
            return Arc::new(self.sweep(domain).unwrap_or_default());
        }

        let key = domain.name();
        if let Some(entry) = self.cache.get(&key) {
            ResolverStats::bump(&self.stats.cache_hits);
            trace!(domain = %key, cached_at = %entry.timestamp, "Domain sweep cache hit");
            return entry.services;
        }

        ResolverStats::bump(&self.stats.cache_misses);
        match self.sweep(domain) {
            Some(targets) => {
                debug!(domain = %key, services = targets.len(), "Cached domain sweep");
                self.cache.insert(key, targets)
            }
            None => Arc::new(Vec::new()),
        }
    }

    fn find_cached(&self, endpoint: &str, domain: Domain) -> Option<String> {
        self.cached_domain_services(domain)
            .iter()
            .find(|target| target.advertises(endpoint))
            .map(|target| target.program_path.clone())
    }

    const fn uses_cache(&self, domain: Domain) -> bool {
        self.config.cache_enabled && Self::memoizes(domain)
    }

    /// Program path of the service advertising `endpoint` in `domain`, or an
    /// empty string when nothing does.
    pub fn resolve(&self, endpoint: &str, domain: Domain) -> String {
        let found = if self.uses_cache(domain) {
            self.find_cached(endpoint, domain)
        } else {
            self.search_live(endpoint, domain)
        };
        Self::outcome(endpoint, domain, found)
    }

    /// Like [`Resolver::resolve`], but a miss against a cached sweep drops
    /// that domain's sweep and searches it exactly once more, so services
    /// started after the sweep are found.
    pub fn resolve_refreshing(&self, endpoint: &str, domain: Domain) -> String {
        if !self.uses_cache(domain) {
            return self.resolve(endpoint, domain);
        }

        let found = self.find_cached(endpoint, domain).or_else(|| {
            debug!(endpoint, domain = %domain, "Endpoint not in cached sweep, refreshing domain");
            self.invalidate(domain);
            self.find_cached(endpoint, domain)
        });
        Self::outcome(endpoint, domain, found)
    }

    fn outcome(endpoint: &str, domain: Domain, found: Option<String>) -> String {
        match found {
            Some(path) => {
                debug!(endpoint, domain = %domain, program = %path, "Resolved endpoint");
                path
            }
            None => {
                debug!(endpoint, domain = %domain, "Endpoint unresolved");
                String::new()
            }
        }
    }

    /// Searches the System, User and Gui domains of `uid` for `endpoint`.
    ///
    /// A miss clears the cache and retries exactly once, since services may
    /// have started since the cached sweeps were taken.
    pub fn resolve_endpoint(&self, endpoint: &str, uid: u32) -> String {
        let domains = [Domain::System, Domain::User(uid), Domain::Gui(uid)];
        let search = || {
            domains
                .iter()
                .find_map(|domain| self.find_cached(endpoint, *domain))
        };

        if let Some(path) = search() {
            return path;
        }

        info!(endpoint, uid, "Endpoint not in cached sweeps, refreshing");
        self.clear_cache();
        search().unwrap_or_default()
    }

    /// Drops every cached sweep.
    pub fn clear_cache(&self) {
        self.cache.clear();
        ResolverStats::bump(&self.stats.invalidations);
    }

    /// Drops the cached sweep of one domain.
    pub fn invalidate(&self, domain: Domain) {
        self.cache.remove(&domain.name());
        ResolverStats::bump(&self.stats.invalidations);
    }
}
