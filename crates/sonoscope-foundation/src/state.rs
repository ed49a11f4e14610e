use crate::error::AppError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Lifecycle of a device pipeline. `Starting` and `Stopping` are
/// transient; operations arriving during them wait for the transition
/// to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl PipelineState {
    pub fn is_transient(self) -> bool {
        matches!(self, PipelineState::Starting | PipelineState::Stopping)
    }
}

#[derive(Clone)]
pub struct StateMachine {
    state: Arc<RwLock<PipelineState>>,
    state_tx: Sender<PipelineState>,
    state_rx: Receiver<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, state_rx) = crossbeam_channel::unbounded();
        Self {
            state: Arc::new(RwLock::new(PipelineState::Stopped)),
            state_tx,
            state_rx,
        }
    }

    pub fn transition(&self, new_state: PipelineState) -> Result<(), AppError> {
        let mut current = self.state.write();

        let valid = matches!(
            (*current, new_state),
            (PipelineState::Stopped, PipelineState::Starting)
                | (PipelineState::Starting, PipelineState::Running)
                | (PipelineState::Starting, PipelineState::Stopped)
                | (PipelineState::Running, PipelineState::Stopping)
                | (PipelineState::Running, PipelineState::Stopped)
                | (PipelineState::Stopping, PipelineState::Stopped)
        );

        if !valid {
            return Err(AppError::Fatal(format!(
                "Invalid state transition: {:?} -> {:?}",
                *current, new_state
            )));
        }

        tracing::debug!("Pipeline state: {:?} -> {:?}", *current, new_state);
        *current = new_state;
        let _ = self.state_tx.send(new_state);
        Ok(())
    }

    pub fn current(&self) -> PipelineState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> Receiver<PipelineState> {
        self.state_rx.clone()
    }
}
