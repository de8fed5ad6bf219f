//! xpcsentry agent library
//!
//! The monitoring daemon's building blocks: connection event sources, the
//! resolve/identify/classify pipeline, and record sinks. The binary wires
//! them together with a bounded channel between source and pipeline.

#![forbid(unsafe_code)]

pub mod event_source;
pub mod pipeline;
pub mod sink;

pub use event_source::{
    ConnectionEventSource, EsloggerSource, EventSourceError, ReplaySource, Subscription,
    parse_eslogger_line,
};
pub use pipeline::ConnectionPipeline;
pub use sink::{FileSink, RecordSink, SinkError, StdoutSink};
