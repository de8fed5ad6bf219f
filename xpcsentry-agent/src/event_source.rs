//! Connection event sources.
//!
//! A [`ConnectionEventSource`] delivers [`ConnectionEvent`]s for the event
//! kinds named in a [`Subscription`]. Two sources are provided:
//!
//! - [`EsloggerSource`] runs the host's endpoint-security logger and reads its
//!   JSON-lines output.
//! - [`ReplaySource`] reads the same JSON-lines format from a file, which is
//!   how captures are re-analysed and how the pipeline is exercised in tests.
//!
//! Both send into a bounded channel and await when it is full, so a slow
//! pipeline slows the source down instead of growing a queue.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use xpcsentry_lib::config::AgentConfig;
use xpcsentry_lib::models::{ConnectionEvent, ProcessDescriptor, XpcDomainType};

/// Event kind carrying endpoint connections.
pub const XPC_CONNECT: &str = "xpc_connect";

/// Event source failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventSourceError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Subscription does not include xpc_connect")]
    NoConnectionEvents,
}

/// Event kinds a source is asked to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    event_kinds: Vec<String>,
}

impl Subscription {
    pub fn new(event_kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            event_kinds: event_kinds.into_iter().map(Into::into).collect(),
        }
    }

    pub fn event_kinds(&self) -> &[String] {
        &self.event_kinds
    }

    pub fn includes(&self, kind: &str) -> bool {
        self.event_kinds.iter().any(|k| k == kind)
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new([XPC_CONNECT])
    }
}

impl From<&AgentConfig> for Subscription {
    fn from(config: &AgentConfig) -> Self {
        Self::new(config.event_kinds.iter().cloned())
    }
}

/// A producer of connection events.
#[async_trait]
pub trait ConnectionEventSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delivers events into `tx` until the source is exhausted, [`stop`] is
    /// called, or the receiving side goes away.
    ///
    /// [`stop`]: ConnectionEventSource::stop
    async fn subscribe(
        &self,
        subscription: &Subscription,
        tx: mpsc::Sender<ConnectionEvent>,
    ) -> Result<(), EventSourceError>;

    /// Asks a running [`subscribe`](ConnectionEventSource::subscribe) to return.
    async fn stop(&self) -> Result<(), EventSourceError>;
}

#[derive(Deserialize)]
struct EsMessage {
    process: EsProcess,
    event: EsEvent,
}

#[derive(Deserialize)]
struct EsProcess {
    audit_token: EsAuditToken,
    executable: EsFile,
    #[serde(default)]
    signing_id: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
}

#[derive(Deserialize)]
struct EsAuditToken {
    pid: i32,
    euid: u32,
    asid: u64,
}

#[derive(Deserialize)]
struct EsFile {
    path: String,
}

#[derive(Deserialize)]
struct EsEvent {
    #[serde(default)]
    xpc_connect: Option<EsXpcConnect>,
}

#[derive(Deserialize)]
struct EsXpcConnect {
    service_name: String,
    service_domain_type: u64,
}

/// Parses one line of endpoint-security logger output.
///
/// Returns `Ok(None)` for events other than endpoint connections and for
/// domain-type codes this build does not know.
pub fn parse_eslogger_line(line: &str) -> Result<Option<ConnectionEvent>, EventSourceError> {
    let message: EsMessage = serde_json::from_str(line)?;
    let Some(connect) = message.event.xpc_connect else {
        return Ok(None);
    };

    let Some(domain_type) = XpcDomainType::from_code(connect.service_domain_type) else {
        debug!(
            code = connect.service_domain_type,
            service = %connect.service_name,
            "Unknown domain type code"
        );
        return Ok(None);
    };

    let process = message.process;
    Ok(Some(ConnectionEvent {
        requester: ProcessDescriptor {
            pid: process.audit_token.pid,
            euid: process.audit_token.euid,
            audit_session_id: process.audit_token.asid,
            path: process.executable.path,
            signing_id: process.signing_id.unwrap_or_default(),
            team_id: process.team_id.unwrap_or_default(),
        },
        service_name: connect.service_name,
        domain_type,
    }))
}

/// Forwards parsed connection events from `reader` into `tx`.
///
/// Returns early when `stop` is notified or the receiver is dropped.
/// Unparseable lines are logged and skipped.
async fn forward_lines<R>(
    source: &'static str,
    reader: R,
    tx: &mpsc::Sender<ConnectionEvent>,
    stop: &Notify,
) -> Result<u64, EventSourceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded: u64 = 0;

    loop {
        let line = tokio::select! {
            () = stop.notified() => {
                debug!(source, "Stop requested");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = match parse_eslogger_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(source, error = %e, "Skipping unparseable event");
                continue;
            }
        };

        if tx.send(event).await.is_err() {
            debug!(source, "Event receiver closed");
            break;
        }
        forwarded = forwarded.saturating_add(1);
    }

    Ok(forwarded)
}

/// Live capture through the host's endpoint-security logger.
#[derive(Debug)]
pub struct EsloggerSource {
    program: PathBuf,
    stop: Notify,
}

impl EsloggerSource {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            stop: Notify::new(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl ConnectionEventSource for EsloggerSource {
    fn name(&self) -> &'static str {
        "eslogger"
    }

    async fn subscribe(
        &self,
        subscription: &Subscription,
        tx: mpsc::Sender<ConnectionEvent>,
    ) -> Result<(), EventSourceError> {
        if !subscription.includes(XPC_CONNECT) {
            return Err(EventSourceError::NoConnectionEvents);
        }

        let mut child = Command::new(&self.program)
            .args(subscription.event_kinds())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EventSourceError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        info!(
            program = %self.program.display(),
            kinds = ?subscription.event_kinds(),
            pid = ?child.id(),
            "Endpoint-security logger started"
        );

        let stdout = child.stdout.take().ok_or_else(|| {
            EventSourceError::Io(std::io::Error::other("logger stdout was not captured"))
        })?;
        let result = forward_lines(self.name(), BufReader::new(stdout), &tx, &self.stop).await;

        if let Err(e) = child.kill().await {
            debug!(error = %e, "Logger already exited");
        }
        let forwarded = result?;
        info!(forwarded, "Endpoint-security logger stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<(), EventSourceError> {
        self.stop.notify_one();
        Ok(())
    }
}

/// Replays a saved capture.
#[derive(Debug)]
pub struct ReplaySource {
    path: PathBuf,
    stop: Notify,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stop: Notify::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConnectionEventSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn subscribe(
        &self,
        subscription: &Subscription,
        tx: mpsc::Sender<ConnectionEvent>,
    ) -> Result<(), EventSourceError> {
        if !subscription.includes(XPC_CONNECT) {
            return Err(EventSourceError::NoConnectionEvents);
        }

        let file = tokio::fs::File::open(&self.path).await?;
        let forwarded = forward_lines(self.name(), BufReader::new(file), &tx, &self.stop).await?;
        info!(path = %self.path.display(), forwarded, "Replay finished");
        Ok(())
    }

    async fn stop(&self) -> Result<(), EventSourceError> {
        self.stop.notify_one();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONNECT: &str = r#"{"event_type":48,"process":{"audit_token":{"pid":4242,"euid":501,"asid":100006},"executable":{"path":"/tmp/evil"},"signing_id":"com.evil.client","team_id":"EVIL000000"},"event":{"xpc_connect":{"service_name":"com.xpc.example.agent.hello","service_domain_type":8}}}"#;
    const UNSIGNED: &str = r#"{"event_type":48,"process":{"audit_token":{"pid":7,"euid":0,"asid":1},"executable":{"path":"/tmp/a.out"},"signing_id":null,"team_id":null},"event":{"xpc_connect":{"service_name":"com.apple.cfprefsd.daemon","service_domain_type":1}}}"#;
    const EXEC: &str = r#"{"event_type":9,"process":{"audit_token":{"pid":7,"euid":0,"asid":1},"executable":{"path":"/bin/ls"}},"event":{"exec":{}}}"#;

    #[test]
    fn test_parse_connect_event() {
        let event = parse_eslogger_line(CONNECT).unwrap().expect("connection event");
        assert_eq!(event.service_name, "com.xpc.example.agent.hello");
        assert_eq!(event.domain_type, XpcDomainType::Gui);
        assert_eq!(event.requester.pid, 4242);
        assert_eq!(event.requester.euid, 501);
        assert_eq!(event.requester.audit_session_id, 100_006);
        assert_eq!(event.requester.path, "/tmp/evil");
        assert_eq!(event.requester.team_id, "EVIL000000");
    }

    #[test]
    fn test_null_identity_fields_become_empty() {
        let event = parse_eslogger_line(UNSIGNED).unwrap().expect("connection event");
        assert_eq!(event.requester.signing_id, "");
        assert_eq!(event.requester.team_id, "");
        assert_eq!(event.domain_type, XpcDomainType::System);
    }

    #[test]
    fn test_other_events_and_unknown_codes_are_ignored() {
        assert!(parse_eslogger_line(EXEC).unwrap().is_none());
        let unknown = CONNECT.replace("\"service_domain_type\":8", "\"service_domain_type\":42");
        assert!(parse_eslogger_line(&unknown).unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        assert!(matches!(
            parse_eslogger_line("{\"process\":"),
            Err(EventSourceError::Malformed(_))
        ));
    }

    #[test]
    fn test_subscription_from_config() {
        let subscription = Subscription::from(&AgentConfig::default());
        assert!(subscription.includes(XPC_CONNECT));
        assert!(!subscription.includes("exec"));
        assert_eq!(Subscription::default(), subscription);
    }

    #[tokio::test]
    async fn test_replay_forwards_connection_events_only() {
        let mut capture = NamedTempFile::new().unwrap();
        writeln!(capture, "{CONNECT}").unwrap();
        writeln!(capture, "{EXEC}").unwrap();
        writeln!(capture, "not json").unwrap();
        writeln!(capture).unwrap();
        writeln!(capture, "{UNSIGNED}").unwrap();

        let source = ReplaySource::new(capture.path());
        let (tx, mut rx) = mpsc::channel(8);
        source.subscribe(&Subscription::default(), tx).await.unwrap();

        let first = rx.recv().await.expect("first event");
        let second = rx.recv().await.expect("second event");
        assert_eq!(first.requester.path, "/tmp/evil");
        assert_eq!(second.requester.path, "/tmp/a.out");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_replay_requires_connection_subscription() {
        let source = ReplaySource::new("/nonexistent/capture.jsonl");
        let (tx, _rx) = mpsc::channel(1);
        let result = source.subscribe(&Subscription::new(["exec"]), tx).await;
        assert!(matches!(result, Err(EventSourceError::NoConnectionEvents)));
    }

    #[tokio::test]
    async fn test_replay_missing_file() {
        let source = ReplaySource::new("/nonexistent/capture.jsonl");
        let (tx, _rx) = mpsc::channel(1);
        let result = source.subscribe(&Subscription::default(), tx).await;
        assert!(matches!(result, Err(EventSourceError::Io(_))));
    }

    #[tokio::test]
    async fn test_replay_returns_when_receiver_goes_away() {
        let mut capture = NamedTempFile::new().unwrap();
        for _ in 0..4 {
            writeln!(capture, "{CONNECT}").unwrap();
        }

        let source = std::sync::Arc::new(ReplaySource::new(capture.path()));
        let (tx, mut rx) = mpsc::channel(1);
        let task = {
            let source = std::sync::Arc::clone(&source);
            tokio::spawn(async move { source.subscribe(&Subscription::default(), tx).await })
        };

        // One event fits; the source is now parked on the full channel.
        let first = rx.recv().await.expect("first event");
        assert_eq!(first.service_name, "com.xpc.example.agent.hello");
        drop(rx);

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_logger_binary() {
        let source = EsloggerSource::new("/nonexistent/eslogger");
        let (tx, _rx) = mpsc::channel(1);
        let result = source.subscribe(&Subscription::default(), tx).await;
        assert!(matches!(result, Err(EventSourceError::Spawn { .. })));
    }
}
