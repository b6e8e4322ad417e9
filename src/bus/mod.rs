pub mod events;

pub use events::{EventSink, ExecEvent, MemorySink, TracingSink};
