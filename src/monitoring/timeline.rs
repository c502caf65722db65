//! Execution Timeline
//!
//! Records node lifecycle events of one plan execution for timing reports
//! and the CLI's Gantt chart. Retry attempts appear as separate rows
//! (`build#1`, `build#2`).

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    /// Parked in WAITING or INTERVENTION_WAITING
    Suspended,
    Resumed,
    Completed,
    Failed,
    /// Aborted by an interrupt or an unwinding scope
    Interrupted,
}

impl EventType {
    /// True for events that close a node's span.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventType::Completed | EventType::Failed | EventType::Interrupted
        )
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub node: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Per-node span derived from the events.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpan {
    pub node: String,
    pub start_ms: u128,
    pub end_ms: Option<u128>,
    pub suspended: u32,
    pub outcome: Option<EventType>,
}

impl NodeSpan {
    pub fn duration_ms(&self) -> Option<u128> {
        self.end_ms.map(|end| end.saturating_sub(self.start_ms))
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, node: String, event_type: EventType) {
        self.events.push(TimelineEvent {
            node,
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Spans ordered by start time. Nodes that never started (skipped,
    /// failed before running) start at their first event.
    pub fn spans(&self) -> Vec<NodeSpan> {
        let mut spans: HashMap<&str, NodeSpan> = HashMap::new();

        for event in &self.events {
            let at = event
                .timestamp
                .duration_since(self.start_time)
                .as_millis();
            let span = spans.entry(event.node.as_str()).or_insert_with(|| NodeSpan {
                node: event.node.clone(),
                start_ms: at,
                end_ms: None,
                suspended: 0,
                outcome: None,
            });

            match event.event_type {
                EventType::Started => span.start_ms = at,
                EventType::Suspended => span.suspended += 1,
                EventType::Resumed => {}
                end => {
                    span.end_ms = Some(at);
                    span.outcome = Some(end);
                }
            }
        }

        let mut spans: Vec<NodeSpan> = spans.into_values().collect();
        spans.sort_by(|a, b| a.start_ms.cmp(&b.start_ms).then_with(|| a.node.cmp(&b.node)));
        spans
    }

    /// Node durations in milliseconds, for nodes that have ended.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|span| span.duration_ms().map(|d| (span.node, d)))
            .collect()
    }

    /// ASCII Gantt chart, 50 columns wide.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let spans = self.spans();
        let total = spans
            .iter()
            .filter_map(|s| s.end_ms)
            .max()
            .unwrap_or_else(|| self.elapsed().as_millis());
        if total == 0 {
            return output;
        }
        let scale = 50.0 / total as f64;

        for span in spans.iter().filter(|s| s.outcome.is_some()) {
            let (Some(end), Some(outcome)) = (span.end_ms, span.outcome) else {
                continue;
            };
            let offset = (span.start_ms as f64 * scale) as usize;
            let width = ((end.saturating_sub(span.start_ms)) as f64 * scale).max(1.0) as usize;
            let fill = match outcome {
                EventType::Completed => "#",
                EventType::Failed => "x",
                _ => "-",
            };

            output.push_str(&format!(
                "{:16} |{}{}| ({} ms)\n",
                truncate(&span.node, 16),
                " ".repeat(offset),
                fill.repeat(width),
                end.saturating_sub(span.start_ms)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_spans_track_suspensions() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("deploy".to_string(), EventType::Started);
        timeline.add_event("deploy".to_string(), EventType::Suspended);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("deploy".to_string(), EventType::Resumed);
        timeline.add_event("deploy".to_string(), EventType::Completed);

        let spans = timeline.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].suspended, 1);
        assert_eq!(spans[0].outcome, Some(EventType::Completed));
        assert!(spans[0].duration_ms().unwrap() >= 20);
    }

    #[test]
    fn test_durations_skip_running_nodes() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("a".to_string(), EventType::Started);
        timeline.add_event("b".to_string(), EventType::Started);
        timeline.add_event("a".to_string(), EventType::Failed);

        let durations = timeline.durations();
        assert!(durations.contains_key("a"));
        assert!(!durations.contains_key("b"));
    }

    #[test]
    fn test_node_without_start_spans_from_first_event() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("skipped".to_string(), EventType::Completed);
        let span = &timeline.spans()[0];
        assert_eq!(span.duration_ms(), Some(0));
    }

    #[test]
    fn test_gantt_chart_marks_outcomes() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("build".to_string(), EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("build".to_string(), EventType::Completed);
        timeline.add_event("test".to_string(), EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("test".to_string(), EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("build"));
        assert!(chart.contains('#'));
        assert!(chart.contains('x'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::new().gantt_chart();
        assert!(chart.contains("Timeline"));
    }

    #[test]
    fn test_truncate_long_labels() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("a-very-long-node-name", 8), "a-ver...");
    }

    #[test]
    fn test_terminal_events() {
        assert!(EventType::Interrupted.is_terminal());
        assert!(!EventType::Resumed.is_terminal());
    }
}
