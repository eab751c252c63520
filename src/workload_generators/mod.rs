pub mod replay;
pub mod swf;

pub use replay::{ReplayOptions, ReplayStats, TraceReplayer};
pub use swf::{load_from_reader, load_from_trace_file, TraceError, TraceJob};
