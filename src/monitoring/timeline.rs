//! Execution Timeline
//!
//! Start and end events per step instance (`node_crop[0]`, `node_otsu`),
//! used for the per-instance duration table and the ASCII Gantt chart
//! printed after a run.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Width of the Gantt bar area in characters.
const CHART_WIDTH: f64 = 50.0;

/// Widest instance label shown before it is truncated.
const LABEL_WIDTH: usize = 24;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl EventType {
    fn is_end(self) -> bool {
        !matches!(self, EventType::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Instance label
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Span of one instance on the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpan {
    pub label: String,
    pub start_ms: u128,
    pub end_ms: u128,
    pub outcome: EventType,
}

/// Tracks when each step instance starts and ends.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, label: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            label: label.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finished instances ordered by start time.
    pub fn spans(&self) -> Vec<InstanceSpan> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let at = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.is_end() {
                if let Some(start) = starts.remove(event.label.as_str()) {
                    spans.push(InstanceSpan {
                        label: event.label.clone(),
                        start_ms: start,
                        end_ms: at,
                        outcome: event.event_type,
                    });
                }
            } else {
                starts.insert(event.label.as_str(), at);
            }
        }

        spans.sort_by(|a, b| a.start_ms.cmp(&b.start_ms).then_with(|| a.label.cmp(&b.label)));
        spans
    }

    /// Renders an ASCII Gantt chart, one row per finished instance.
    ///
    /// Bars are `#` for success, `x` for failure and `-` for cancellation.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.elapsed().as_millis();
        if total == 0 {
            return output;
        }
        let scale = CHART_WIDTH / total as f64;

        for span in self.spans() {
            let offset = (span.start_ms as f64 * scale) as usize;
            let width = ((span.end_ms - span.start_ms) as f64 * scale).max(1.0) as usize;
            let mark = match span.outcome {
                EventType::Failed => "x",
                EventType::Cancelled => "-",
                _ => "#",
            };
            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                fit(&span.label, LABEL_WIDTH),
                " ".repeat(offset),
                mark.repeat(width),
                span.end_ms - span.start_ms
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

/// Pads or truncates a label to exactly `width` characters.
fn fit(label: &str, width: usize) -> String {
    let chars: Vec<char> = label.chars().collect();
    if chars.len() <= width {
        format!("{:width$}", label, width = width)
    } else {
        let kept: String = chars[..width - 3].iter().collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_spans_pair_start_and_end() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("node_crop[0]", EventType::Started);
        timeline.add_event("node_crop[1]", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("node_crop[1]", EventType::Failed);
        timeline.add_event("node_crop[0]", EventType::Completed);
        timeline.add_event("node_otsu", EventType::Started);

        let spans = timeline.spans();
        assert_eq!(spans.len(), 2, "unfinished instances are not spans");
        let failed = spans.iter().find(|s| s.label == "node_crop[1]").unwrap();
        assert_eq!(failed.outcome, EventType::Failed);
        assert!(failed.end_ms - failed.start_ms >= 20);
    }

    #[test]
    fn test_gantt_chart_marks_outcomes() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("node_crop[0]", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("node_crop[0]", EventType::Completed);
        timeline.add_event("node_normalized_difference_with_a_long_name", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("node_normalized_difference_with_a_long_name", EventType::Cancelled);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("node_crop[0]"));
        assert!(chart.contains("node_normalized_diffe..."));
        assert!(chart.contains('#'));
        assert!(chart.contains('-'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_fit() {
        assert_eq!(fit("abc", 5), "abc  ");
        assert_eq!(fit("abcdefgh", 6), "abc...");
    }
}
