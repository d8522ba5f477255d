// Lossy in-process logging for the data plane
//
// A cloneable handle feeds entries through a bounded channel to a single
// consumer thread; producers never block and never allocate more than the
// formatted message. Severity filtering happens on the producer side.

mod facility;
mod logger;
mod severity;

pub use facility::Facility;
pub use logger::{LogEntry, LogSink, Logger, MemorySink, StderrSink};
pub use severity::Severity;
