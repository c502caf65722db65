//! Monitoring Module
//!
//! Execution timeline recording for plan executions.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Node lifecycle events, spans and Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, NodeSpan, TimelineEvent};
