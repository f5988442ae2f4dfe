//! Execution Timeline
//!
//! Records node lifecycle events during a run for the CLI summary.
//! A node inside a loop is visited several times; each visit is shown as
//! its own bar.

use std::collections::HashMap;
use std::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Node started executing
    Started,
    /// Node completed successfully
    Completed,
    /// Node failed
    Failed,
    /// Loop node sent the cursor back
    Jumped,
    /// Run halted at this node
    Paused,
    /// Node was passed over
    Skipped,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub node_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// One start-to-end span of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visit {
    pub node_id: String,
    /// Milliseconds since the timeline started
    pub start_ms: u128,
    pub end_ms: u128,
    pub outcome: EventType,
}

/// Tracks the execution timeline of a run.
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

    /// Records an event for a node.
    pub fn add_event(&mut self, node_id: &str, event_type: EventType) {
        self.events.push(TimelineEvent {
            node_id: node_id.to_string(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    fn offset(&self, event: &TimelineEvent) -> u128 {
        event.timestamp.duration_since(self.start_time).as_millis()
    }

    /// Pairs each `Started` event with the event that ended it.
    ///
    /// Events without a matching start produce a zero-length visit.
    pub fn visits(&self) -> Vec<Visit> {
        let mut open: HashMap<&str, u128> = HashMap::new();
        let mut visits = Vec::new();

        for event in &self.events {
            let at = self.offset(event);
            if event.event_type == EventType::Started {
                open.insert(event.node_id.as_str(), at);
            } else {
                let start_ms = open.remove(event.node_id.as_str()).unwrap_or(at);
                visits.push(Visit {
                    node_id: event.node_id.clone(),
                    start_ms,
                    end_ms: at,
                    outcome: event.event_type,
                });
            }
        }

        visits.sort_by_key(|v| v.start_ms);
        visits
    }

    /// Number of times a node was started.
    pub fn visit_count(&self, node_id: &str) -> usize {
        self.events
            .iter()
            .filter(|e| e.node_id == node_id && e.event_type == EventType::Started)
            .count()
    }

    /// Generates an ASCII Gantt chart representation.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        let visits = self.visits();

        if visits.is_empty() {
            return output;
        }

        // Scale to 50 characters width
        let scale = if total_time == 0 {
            0.0
        } else {
            50.0 / total_time as f64
        };

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for visit in &visits {
            let round = seen.entry(visit.node_id.as_str()).or_insert(0);
            *round += 1;

            let label = if *round > 1 {
                format!("{}#{}", visit.node_id, round)
            } else {
                visit.node_id.clone()
            };

            let start_pos = (visit.start_ms as f64 * scale) as usize;
            let width = ((visit.end_ms - visit.start_ms) as f64 * scale).max(1.0) as usize;
            let mark = match visit.outcome {
                EventType::Failed => "!",
                EventType::Skipped => "-",
                EventType::Paused => "|",
                _ => "#",
            };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| ({} ms)\n",
                truncate(&label, 12),
                bar,
                visit.end_ms - visit.start_ms
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns total time spent per node in milliseconds, over all visits.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut durations: HashMap<String, u128> = HashMap::new();
        for visit in self.visits() {
            *durations.entry(visit.node_id).or_insert(0) += visit.end_ms - visit.start_ms;
        }
        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to a fixed number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
