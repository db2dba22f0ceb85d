//! Record output
//!
//! The engine hands finished [`probes_common::EventBundle`]s to a
//! [`RecordSink`]; everything downstream of that trait (wire format, IPC,
//! buffering) is an external concern.

pub mod sink;

pub use sink::{JsonLinesSink, MemorySink, RecordSink};
