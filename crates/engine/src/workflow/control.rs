//! Pause/resume/cancel handling for a running interpreter.
//!
//! Commands are only observed at checkpoints, which the interpreter hits before every step
//! and every loop iteration. An in-flight action always runs to completion.

use stepflow_types::{RunControl, RunEvent, RunPhase};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, info};

/// Control and event channels of one run. Either side may be absent.
pub(crate) struct RunSignals {
    control_rx: Option<UnboundedReceiver<RunControl>>,
    event_tx: Option<UnboundedSender<RunEvent>>,
    state: ControlState,
}

impl RunSignals {
    /// Signals for a run nobody observes or controls.
    pub(crate) fn detached() -> Self {
        Self {
            control_rx: None,
            event_tx: None,
            state: ControlState::default(),
        }
    }

    pub(crate) fn new(control_rx: Option<UnboundedReceiver<RunControl>>, event_tx: Option<UnboundedSender<RunEvent>>) -> Self {
        Self {
            control_rx,
            event_tx,
            state: ControlState::default(),
        }
    }

    /// Sends an event. A dropped receiver is not an error; the run keeps going unobserved.
    pub(crate) fn emit(&self, event: RunEvent) {
        if let Some(event_tx) = &self.event_tx {
            let _ = event_tx.send(event);
        }
    }

    /// Applies pending commands, blocks while paused, and reports whether cancellation
    /// has been requested.
    pub(crate) async fn checkpoint(&mut self) -> bool {
        self.drain_pending_commands();
        if self.state.paused && !self.state.cancel_requested {
            self.wait_for_resume().await;
        }
        self.state.cancel_requested
    }

    fn drain_pending_commands(&mut self) {
        let Some(control_rx) = self.control_rx.as_mut() else {
            return;
        };
        loop {
            match control_rx.try_recv() {
                Ok(command) => self.state.process_command(command, self.event_tx.as_ref()),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    async fn wait_for_resume(&mut self) {
        let Some(control_rx) = self.control_rx.as_mut() else {
            self.state.paused = false;
            return;
        };
        info!("run paused; waiting for resume");
        while self.state.paused && !self.state.cancel_requested {
            match control_rx.recv().await {
                Some(command) => self.state.process_command(command, self.event_tx.as_ref()),
                None => {
                    debug!("control channel closed while paused; resuming");
                    self.state.paused = false;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    cancel_requested: bool,
}

impl ControlState {
    fn process_command(&mut self, command: RunControl, event_tx: Option<&UnboundedSender<RunEvent>>) {
        match command {
            RunControl::Pause => {
                if !self.paused && !self.cancel_requested {
                    self.paused = true;
                    emit_status(event_tx, RunPhase::Paused, None);
                }
            }
            RunControl::Resume => {
                if self.paused {
                    self.paused = false;
                    emit_status(event_tx, RunPhase::Running, None);
                }
            }
            RunControl::Cancel => {
                if !self.cancel_requested {
                    self.cancel_requested = true;
                    self.paused = false;
                    emit_status(event_tx, RunPhase::CancelRequested, Some("aborting…".to_string()));
                }
            }
        }
    }
}

pub(crate) fn emit_status(event_tx: Option<&UnboundedSender<RunEvent>>, phase: RunPhase, message: Option<String>) {
    if let Some(event_tx) = event_tx {
        let _ = event_tx.send(RunEvent::RunStatusChanged { phase, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn pause_blocks_until_resume_then_cancel_is_reported() {
        let (control_tx, control_rx) = unbounded_channel();
        let (event_tx, mut event_rx) = unbounded_channel();
        let mut signals = RunSignals::new(Some(control_rx), Some(event_tx));

        control_tx.send(RunControl::Pause).unwrap();
        control_tx.send(RunControl::Resume).unwrap();
        assert!(!signals.checkpoint().await);

        control_tx.send(RunControl::Cancel).unwrap();
        assert!(signals.checkpoint().await);

        let phases: Vec<RunPhase> = std::iter::from_fn(|| event_rx.try_recv().ok())
            .filter_map(|event| match event {
                RunEvent::RunStatusChanged { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![RunPhase::Paused, RunPhase::Running, RunPhase::CancelRequested]);
    }

    #[tokio::test]
    async fn closed_control_channel_does_not_hang_a_paused_run() {
        let (control_tx, control_rx) = unbounded_channel();
        let mut signals = RunSignals::new(Some(control_rx), None);
        control_tx.send(RunControl::Pause).unwrap();
        drop(control_tx);

        assert!(!signals.checkpoint().await);
    }
}
