//! Run Monitoring Module
//!
//! - [`ExecutionTimeline`]: per-instance start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, InstanceSpan, TimelineEvent};
