//! The resolve, identify and classify chain for each connection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use xpcsentry_lib::codesign::{CodeIdentityResolver, CodesignTool, SigningInspector};
use xpcsentry_lib::config::Config;
use xpcsentry_lib::detection::DetectionPolicy;
use xpcsentry_lib::launchd::{LaunchdTransport, ProgramLocator, Resolver, Supervisor, SysinfoLocator};
use xpcsentry_lib::models::{ConnectionEvent, ConnectionRecord};
use xpcsentry_lib::telemetry::{HealthCheck, Metrics, PerformanceTimer, TelemetryCollector};

use crate::sink::RecordSink;

/// Counter of connections whose endpoint owner was not found.
pub const UNRESOLVED: &str = "unresolved";
/// Counter of connections classified as suspicious.
pub const SUSPICIOUS: &str = "suspicious";
/// Counter of connections in domain kinds that cannot be queried.
pub const SKIPPED: &str = "skipped";

/// Turns connection events into records.
pub struct ConnectionPipeline<S = LaunchdTransport, L = SysinfoLocator, I = CodesignTool> {
    resolver: Resolver<S, L>,
    identities: CodeIdentityResolver<I>,
    policy: DetectionPolicy,
    telemetry: Mutex<TelemetryCollector>,
}

impl ConnectionPipeline {
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Resolver::from_config(&config.launchd),
            CodeIdentityResolver::from_config(&config.codesign),
            DetectionPolicy::from(&config.detection),
        )
    }
}

impl<S, L, I> ConnectionPipeline<S, L, I>
where
    S: Supervisor + 'static,
    L: ProgramLocator + 'static,
    I: SigningInspector + 'static,
{
    pub fn new(resolver: Resolver<S, L>, identities: CodeIdentityResolver<I>, policy: DetectionPolicy) -> Self {
        Self {
            resolver,
            identities,
            policy,
            telemetry: Mutex::new(TelemetryCollector::new("xpcsentry-agent")),
        }
    }

    pub const fn resolver(&self) -> &Resolver<S, L> {
        &self.resolver
    }

    fn telemetry(&self) -> MutexGuard<'_, TelemetryCollector> {
        self.telemetry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one event through the chain. Blocks on supervisor and signing
    /// queries.
    ///
    /// Returns `None` only for domain kinds without a queryable domain.
    /// An endpoint missing from a cached sweep triggers one fresh sweep of
    /// its domain; if it is still missing the record has an empty program path.
    pub fn process(&self, event: &ConnectionEvent) -> Option<ConnectionRecord> {
        let Some(domain) = event.domain() else {
            debug!(
                kind = %event.domain_type,
                service = %event.service_name,
                "Skipping connection in unsupported domain kind"
            );
            self.telemetry().increment(SKIPPED);
            return None;
        };

        let timer = PerformanceTimer::start("connection");
        let program = self.resolver.resolve_refreshing(&event.service_name, domain);
        let owner = self.identities.identify(&program);
        let requester = event.requester.identity();
        let verdict = self.policy.classify(&owner, &requester);
        let record = ConnectionRecord::new(&event.service_name, domain, &owner, &requester, verdict);
        let elapsed = timer.finish();

        let mut telemetry = self.telemetry();
        telemetry.record_operation(elapsed);
        if program.is_empty() {
            telemetry.increment(UNRESOLVED);
        }
        if verdict.suspicious {
            telemetry.increment(SUSPICIOUS);
            warn!(
                service = %record.service_name,
                domain = %domain,
                program = %record.program_path,
                requester = %record.requester_path,
                reason = %verdict.reason,
                "Suspicious endpoint connection"
            );
        } else {
            debug!(
                service = %record.service_name,
                domain = %domain,
                program = %record.program_path,
                reason = %verdict.reason,
                elapsed = ?elapsed,
                "Connection classified"
            );
        }

        Some(record)
    }

    /// Processes events until the channel closes, writing each record to
    /// every sink. Returns the number of records produced.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ConnectionEvent>, sinks: &[Box<dyn RecordSink>]) -> u64 {
        let mut produced: u64 = 0;

        while let Some(event) = events.recv().await {
            let pipeline = Arc::clone(&self);
            let record = match tokio::task::spawn_blocking(move || pipeline.process(&event)).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Connection processing task failed");
                    self.telemetry().record_error();
                    continue;
                }
            };
            produced = produced.saturating_add(1);

            for sink in sinks {
                if let Err(e) = sink.write(&record).await {
                    warn!(sink = sink.name(), error = %e, "Failed to write record");
                    self.telemetry().record_error();
                }
            }
        }

        for sink in sinks {
            if let Err(e) = sink.flush().await {
                warn!(sink = sink.name(), error = %e, "Failed to flush sink");
            }
        }
        info!(produced, "Event channel closed");
        produced
    }

    pub fn metrics(&self) -> Metrics {
        self.telemetry().get_metrics().clone()
    }

    /// Telemetry health plus resolver statistics.
    pub fn health_check(&self) -> HealthCheck {
        let mut health = self.telemetry().health_check();
        let stats = self.resolver.stats();
        health.add_detail("supervisor_queries", stats.queries);
        health.add_detail("cache_hits", stats.cache_hits);
        health.add_detail("cache_misses", stats.cache_misses);
        health.add_detail("cache_invalidations", stats.invalidations);
        health
    }
}
