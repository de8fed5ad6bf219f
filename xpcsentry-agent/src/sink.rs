//! Record output.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use xpcsentry_lib::config::OutputFormat;
use xpcsentry_lib::models::ConnectionRecord;

/// Record delivery errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Destination for connection records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, record: &ConnectionRecord) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Renders a record as a single line without a trailing newline.
pub fn render(record: &ConnectionRecord, format: OutputFormat) -> Result<String, SinkError> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string(record)?,
        OutputFormat::Human => format!(
            "[{}] service={} domain={} program=\"{}\" owner_team={} owner_signing_id={} requester=\"{}\" requester_team={} requester_signing_id={} reason=\"{}\"",
            if record.suspicious { "suspicious" } else { "ok" },
            record.service_name,
            record.domain,
            record.program_path,
            record.owner_team_id,
            record.owner_signing_id,
            record.requester_path,
            record.requester_team_id,
            record.requester_signing_id,
            record.reason,
        ),
    })
}

/// Writes records to standard output.
#[derive(Debug)]
pub struct StdoutSink {
    format: OutputFormat,
}

impl StdoutSink {
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl RecordSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn write(&self, record: &ConnectionRecord) -> Result<(), SinkError> {
        let mut line = render(record, self.format)?;
        line.push('\n');
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Appends records to a file as JSON lines.
#[derive(Debug)]
pub struct FileSink {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    /// Opens `path` for appending, creating it if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            name: format!("file:{}", path.display()),
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, record: &ConnectionRecord) -> Result<(), SinkError> {
        let mut line = render(record, OutputFormat::Json)?;
        line.push('\n');
        self.file.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.file.lock().await.flush().await?;
        Ok(())
    }
}
