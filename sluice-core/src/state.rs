use std::fmt::Display;

use serde::Serialize;
use tokio::sync::watch;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Streaming,
    Rotating,
    Draining,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Idle, Streaming) | (Idle, Draining) => true,
            (Streaming, Rotating) | (Rotating, Streaming) => true,
            (Streaming, Draining) | (Draining, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Idle => "IDLE",
            PipelineState::Streaming => "STREAMING",
            PipelineState::Rotating => "ROTATING",
            PipelineState::Draining => "DRAINING",
            PipelineState::Done => "DONE",
            PipelineState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Publishes the state of a run to any number of watchers.
#[derive(Debug)]
pub(crate) struct StateTracker {
    tx: watch::Sender<PipelineState>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PipelineState::Idle);
        Self { tx }
    }

    pub fn current(&self) -> PipelineState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.tx.subscribe()
    }

    pub fn transition(&self, next: PipelineState) -> Result<(), PipelineError> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition { from, to: next });
        }
        tracing::trace!("Pipeline state {} -> {}", from, next);
        self.tx.send_replace(next);
        Ok(())
    }

    /// Move to FAILED from wherever the run is.
    pub fn fail(&self) {
        let from = self.current();
        if from != PipelineState::Failed {
            tracing::debug!("Pipeline state {} -> {}", from, PipelineState::Failed);
            self.tx.send_replace(PipelineState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_the_documented_lifecycle() {
        let tracker = StateTracker::new();
        for next in [
            PipelineState::Streaming,
            PipelineState::Rotating,
            PipelineState::Streaming,
            PipelineState::Draining,
            PipelineState::Done,
        ] {
            tracker.transition(next).unwrap();
        }
        assert_eq!(tracker.current(), PipelineState::Done);
    }

    #[test]
    fn empty_source_drains_from_idle() {
        let tracker = StateTracker::new();
        tracker.transition(PipelineState::Draining).unwrap();
        tracker.transition(PipelineState::Done).unwrap();
    }

    #[test]
    fn rejects_illegal_transitions() {
        let tracker = StateTracker::new();
        let err = tracker.transition(PipelineState::Done).unwrap_err();

        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: PipelineState::Idle,
                to: PipelineState::Done
            }
        ));
        assert!(!PipelineState::Done.can_transition_to(PipelineState::Failed));
        assert!(!PipelineState::Rotating.can_transition_to(PipelineState::Draining));
    }

    #[test]
    fn watchers_see_failure() {
        let tracker = StateTracker::new();
        let rx = tracker.subscribe();
        tracker.transition(PipelineState::Streaming).unwrap();
        tracker.fail();

        assert_eq!(*rx.borrow(), PipelineState::Failed);
    }
}
