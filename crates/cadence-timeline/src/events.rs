//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (progress displays, loggers, recording sinks) can
//! follow a run without coupling to the executor internals.

use cadence_types::Progress;
use serde::{Deserialize, Serialize};

use crate::data::InteractionEvent;

/// Events emitted while an experiment runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        seed: u64,
        naive_total_trials: usize,
    },
    RunCompleted {
        trials_run: usize,
        duration_ms: u64,
    },
    RunFailed {
        error: String,
    },
    TimelineStarted {
        node_id: String,
        name: Option<String>,
    },
    /// A timeline whose conditional predicate returned false.
    TimelineSkipped {
        node_id: String,
    },
    /// A timeline whose loop predicate requested another pass.
    TimelineLooped {
        node_id: String,
        pass: usize,
    },
    TimelineCompleted {
        node_id: String,
        passes: usize,
    },
    TrialStarted {
        node_id: String,
        plugin: String,
        trial_index: usize,
        progress: Progress,
    },
    TrialCompleted {
        node_id: String,
        trial_index: usize,
        duration_ms: u64,
        progress: Progress,
    },
    InteractionRecorded {
        event: InteractionEvent,
        trial: usize,
        time: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(RunEvent::RunStarted {
            seed: 42,
            naive_total_trials: 12,
        });

        let event = rx.recv().await.unwrap();
        match event {
            RunEvent::RunStarted {
                seed,
                naive_total_trials,
            } => {
                assert_eq!(seed, 42);
                assert_eq!(naive_total_trials, 12);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(RunEvent::TimelineSkipped {
            node_id: "0.1".into(),
        });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();

        // Both subscribers should get the same event content.
        let json1 = serde_json::to_string(&e1).unwrap();
        let json2 = serde_json::to_string(&e2).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        // No subscriber — this must not panic.
        emitter.emit(RunEvent::RunFailed {
            error: "something went wrong".into(),
        });
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = RunEvent::TrialCompleted {
            node_id: "0.0-1.2".into(),
            trial_index: 7,
            duration_ms: 412,
            progress: Progress {
                total_trials: 20,
                total_timelines: 3,
                current_trial_global: 8,
                current_trial_local: 2,
                current_timeline: 2,
            },
        };

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: RunEvent = serde_json::from_str(&json).unwrap();

        match deserialized {
            RunEvent::TrialCompleted {
                node_id,
                trial_index,
                duration_ms,
                progress,
            } => {
                assert_eq!(node_id, "0.0-1.2");
                assert_eq!(trial_index, 7);
                assert_eq!(duration_ms, 412);
                assert_eq!(progress.current_trial_global, 8);
                assert_eq!(progress.total_trials, 20);
            }
            other => panic!("unexpected variant after round-trip: {:?}", other),
        }
    }
}
