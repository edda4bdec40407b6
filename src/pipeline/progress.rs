//! Progress reporting.
//!
//! Stages report progress through a [`ProgressSink`] held by the run
//! context. Emission is synchronous and must never block the pipeline: the
//! channel sink drops events when its buffer is full.

use super::state::{Stage, TOTAL_STAGES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{info, trace};

/// A single progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 1-based stage number
    pub stage_number: usize,

    pub total_stages: usize,

    /// Overall run progress (0.0 to 100.0)
    pub percentage: f32,

    /// Human-readable description of what is happening
    pub description: String,

    /// Stage counters at the time of the event
    pub live_stats: BTreeMap<String, f64>,
}

impl ProgressEvent {
    /// Event for `stage`, `fraction` of the way through it.
    pub fn new(stage: Stage, fraction: f32, description: impl Into<String>) -> Self {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let done = (stage.number() - 1) as f32 + fraction;
        let percentage = if stage == Stage::Complete {
            100.0
        } else {
            (done / TOTAL_STAGES as f32 * 100.0).clamp(0.0, 100.0)
        };
        Self {
            stage_number: stage.number(),
            total_stages: TOTAL_STAGES,
            percentage,
            description: description.into(),
            live_stats: BTreeMap::new(),
        }
    }

    pub fn with_stats(mut self, stats: BTreeMap<String, f64>) -> Self {
        self.live_stats = stats;
        self
    }
}

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    /// Deliver an event. Must return promptly.
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, event: ProgressEvent) {
        info!(
            stage = event.stage_number,
            total = event.total_stages,
            percentage = event.percentage as f64,
            stats = ?event.live_stats,
            "{}",
            event.description
        );
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    sender: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(sender: mpsc::Sender<ProgressEvent>) -> Self {
        Self { sender }
    }

    /// A sink and the receiving end of a channel with `capacity` slots.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.sender.try_send(event) {
            trace!(error = %e, "Dropping progress event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_mapping() {
        assert_eq!(ProgressEvent::new(Stage::Familiarization, 0.0, "").percentage, 0.0);
        let halfway = ProgressEvent::new(Stage::ThemeGeneration, 1.0, "");
        assert!((halfway.percentage - 50.0).abs() < 1e-4);
        assert_eq!(ProgressEvent::new(Stage::ProvenanceAssembly, 1.0, "").percentage, 100.0);
        assert_eq!(ProgressEvent::new(Stage::Complete, 0.0, "").percentage, 100.0);

        let clamped = ProgressEvent::new(Stage::InitialCoding, f32::NAN, "x");
        assert_eq!(clamped.stage_number, 2);
        assert_eq!(clamped.total_stages, TOTAL_STAGES);
        assert!(clamped.percentage.is_finite());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelProgressSink::channel(4);
        let mut stats = BTreeMap::new();
        stats.insert("sources".to_string(), 3.0);
        sink.emit(ProgressEvent::new(Stage::Familiarization, 0.5, "reading").with_stats(stats));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.description, "reading");
        assert_eq!(event.live_stats["sources"], 3.0);
    }

    #[test]
    fn test_channel_sink_never_blocks() {
        let (sink, mut rx) = ChannelProgressSink::channel(1);
        for i in 0..10 {
            sink.emit(ProgressEvent::new(Stage::Refinement, 0.0, format!("event {}", i)));
        }
        assert_eq!(rx.try_recv().unwrap().description, "event 0");
        assert!(rx.try_recv().is_err(), "Events beyond capacity should be dropped");

        drop(rx);
        // Closed channel is not an error for the pipeline either
        sink.emit(ProgressEvent::new(Stage::Refinement, 1.0, "late"));
    }
}
