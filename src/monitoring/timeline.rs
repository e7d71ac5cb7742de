//! Execution Timeline
//!
//! Records every step status transition of one execution, for
//! status history queries, duration reports and Gantt charts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::workflow::model::StepStatus;

/// A single status transition in the execution timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    /// ID of the step
    pub step_id: String,
    /// Status the step moved to
    pub status: StepStatus,
    /// Milliseconds since the timeline started
    pub offset_ms: u128,
    #[serde(skip)]
    pub timestamp: Instant,
}

/// Tracks the status history of every step in an execution.
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

    /// Records that a step moved to `status`.
    pub fn record(&mut self, step_id: impl Into<String>, status: StepStatus) {
        let timestamp = Instant::now();
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            status,
            offset_ms: timestamp.duration_since(self.start_time).as_millis(),
            timestamp,
        });
    }

    /// Returns all recorded events.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Statuses a step went through, in order, starting from PENDING.
    pub fn history(&self, step_id: &str) -> Vec<StepStatus> {
        std::iter::once(StepStatus::Pending)
            .chain(
                self.events
                    .iter()
                    .filter(|e| e.step_id == step_id)
                    .map(|e| e.status),
            )
            .collect()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finished attempts in the order they ended.
    fn attempts(&self) -> Vec<Attempt<'_>> {
        let mut open: HashMap<&str, u128> = HashMap::new();
        let mut attempts = Vec::new();

        for event in &self.events {
            if event.status == StepStatus::Running {
                open.insert(event.step_id.as_str(), event.offset_ms);
            } else if let Some(start) = open.remove(event.step_id.as_str()) {
                attempts.push(Attempt {
                    step_id: &event.step_id,
                    start,
                    end: event.offset_ms,
                    outcome: event.status,
                });
            }
        }

        attempts
    }

    /// Returns the total running time of each step in milliseconds.
    ///
    /// Retried steps sum all of their attempts.
    pub fn durations(&self) -> HashMap<String, u128> {
        let mut durations: HashMap<String, u128> = HashMap::new();
        for attempt in self.attempts() {
            *durations.entry(attempt.step_id.to_string()).or_insert(0) += attempt.end - attempt.start;
        }
        durations
    }

    /// Renders an ASCII Gantt chart, one row per step.
    ///
    /// `#` marks a successful attempt, `x` a failed or retried one and
    /// `~` an attempt that ended in SKIPPED.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nStep Timeline:\n\n");

        let total_ms = self.elapsed().as_millis();
        if total_ms == 0 {
            return output;
        }
        let scale = CHART_WIDTH as f64 / total_ms as f64;

        let mut rows: Vec<(&str, Vec<char>, u128)> = Vec::new();
        for attempt in self.attempts() {
            let row = match rows.iter().position(|(id, _, _)| *id == attempt.step_id) {
                Some(i) => i,
                None => {
                    rows.push((attempt.step_id, vec![' '; CHART_WIDTH], 0));
                    rows.len() - 1
                }
            };

            let glyph = match attempt.outcome {
                StepStatus::Completed => '#',
                StepStatus::Skipped => '~',
                _ => 'x',
            };
            let from = ((attempt.start as f64 * scale) as usize).min(CHART_WIDTH - 1);
            let to = ((attempt.end as f64 * scale) as usize).clamp(from + 1, CHART_WIDTH);

            let (_, cells, busy_ms) = &mut rows[row];
            cells[from..to].iter_mut().for_each(|c| *c = glyph);
            *busy_ms += attempt.end - attempt.start;
        }

        for (step_id, cells, busy_ms) in rows {
            let bar: String = cells.into_iter().collect();
            output.push_str(&format!(
                "{} |{}| {} ms\n",
                fit_label(step_id, LABEL_WIDTH),
                bar,
                busy_ms
            ));
        }

        output.push_str(&format!("\nElapsed: {} ms\n", total_ms));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

const CHART_WIDTH: usize = 50;
const LABEL_WIDTH: usize = 16;

/// One RUNNING interval of a step and the status that closed it.
struct Attempt<'a> {
    step_id: &'a str,
    start: u128,
    end: u128,
    outcome: StepStatus,
}

/// Pads or shortens a step id to exactly `width` characters.
fn fit_label(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let head: String = s.chars().take(width - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.events().is_empty());
    }

    #[test]
    fn test_history_starts_pending() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("step1", StepStatus::Running);
        timeline.record("step2", StepStatus::Running);
        timeline.record("step1", StepStatus::Completed);

        assert_eq!(
            timeline.history("step1"),
            vec![StepStatus::Pending, StepStatus::Running, StepStatus::Completed]
        );
        assert_eq!(timeline.history("other"), vec![StepStatus::Pending]);
    }

    #[test]
    fn test_durations_sum_attempts() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("flaky", StepStatus::Running);
        thread::sleep(Duration::from_millis(20));
        timeline.record("flaky", StepStatus::Retrying);
        timeline.record("flaky", StepStatus::Running);
        thread::sleep(Duration::from_millis(20));
        timeline.record("flaky", StepStatus::Completed);

        let durations = timeline.durations();
        assert!(*durations.get("flaky").unwrap() >= 40);
    }

    #[test]
    fn test_durations_ignores_open_interval() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("step1", StepStatus::Running);

        assert!(!timeline.durations().contains_key("step1"));
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();

        timeline.record("step1", StepStatus::Running);
        thread::sleep(Duration::from_millis(30));
        timeline.record("step1", StepStatus::Completed);

        timeline.record("step2", StepStatus::Running);
        thread::sleep(Duration::from_millis(30));
        timeline.record("step2", StepStatus::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains('#'));
        assert!(chart.contains('x'));
        assert!(chart.contains("Elapsed:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::new();
        let chart = timeline.gantt_chart();
        assert!(chart.contains("Step Timeline"));
        assert!(!chart.contains('|'));
    }

    #[test]
    fn test_fit_label() {
        assert_eq!(fit_label("search_keywords_10", 12), "search_ke...");
        assert_eq!(fit_label("merge", 8), "merge   ");
    }

    #[test]
    fn test_retried_step_shares_one_row() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("flaky", StepStatus::Running);
        thread::sleep(Duration::from_millis(10));
        timeline.record("flaky", StepStatus::Retrying);
        timeline.record("flaky", StepStatus::Running);
        thread::sleep(Duration::from_millis(10));
        timeline.record("flaky", StepStatus::Completed);

        let chart = timeline.gantt_chart();
        assert_eq!(chart.matches("flaky").count(), 1);
    }
}
