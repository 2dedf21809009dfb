//! Operator confirmation between protocol phases.
//!
//! Text lines from the operator are handed to [`OperatorGate::submit`]. While
//! a run is parked in [`OperatorGate::wait`] they are delivered to it; outside
//! a wait only a quit request has an effect.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};
use ulab_hardware::Ulab;

/// How often a parked gate re-checks the stop flag.
pub const STOP_POLL: Duration = Duration::from_secs(1);

/// Whether a sequencer is parked at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Parked until the operator answers.
    WaitingForInput,
    /// Nothing is waiting.
    Resumed,
}

/// A parsed operator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorInput {
    /// `continue` or `c`.
    Continue,
    /// `quit`, `q` or `exit`.
    Quit,
    /// Anything else, trimmed.
    Other(String),
}

impl OperatorInput {
    /// Case-insensitive; surrounding whitespace is ignored.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "continue" | "c" => OperatorInput::Continue,
            "quit" | "q" | "exit" => OperatorInput::Quit,
            _ => OperatorInput::Other(trimmed.to_string()),
        }
    }
}

/// What [`OperatorGate::submit`] did with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Handed to the waiting gate.
    Delivered,
    /// Quit outside a wait: the stop flag is set and the caller should shut down.
    Quit,
    /// Nothing was waiting for it.
    Ignored,
}

/// How a wait at the gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The operator typed continue.
    Resumed,
    /// The operator quit; devices have been stopped.
    Quit,
    /// The stop flag was set by someone else.
    Cancelled,
}

/// Pauses a sequencer until the operator confirms.
///
/// Only one wait can be parked at a time. Lines submitted while nothing waits
/// are dropped, except `quit`, which always stops the devices.
pub struct OperatorGate {
    ulab: Arc<Ulab>,
    state: watch::Sender<GateState>,
    input_tx: mpsc::UnboundedSender<OperatorInput>,
    input_rx: Mutex<mpsc::UnboundedReceiver<OperatorInput>>,
}

impl OperatorGate {
    /// A resumed gate that stops devices through `ulab`.
    pub fn new(ulab: Arc<Ulab>) -> Self {
        let (state, _) = watch::channel(GateState::Resumed);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            ulab,
            state,
            input_tx,
            input_rx: Mutex::new(input_rx),
        }
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Watch state changes, for prompting the operator.
    pub fn subscribe_state(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    /// Route one operator line.
    pub fn submit(&self, line: &str) -> Submitted {
        let input = OperatorInput::parse(line);
        if self.state() == GateState::WaitingForInput && self.input_tx.send(input.clone()).is_ok() {
            return Submitted::Delivered;
        }
        if input == OperatorInput::Quit {
            info!("quit requested outside a confirmation wait");
            self.ulab.cancel().request_stop();
            return Submitted::Quit;
        }
        debug!(?input, "operator input ignored");
        Submitted::Ignored
    }

    /// Park until the operator continues or quits, or a stop is requested.
    pub async fn wait(&self, prompt: &str) -> GateOutcome {
        let mut input = self.input_rx.lock().await;
        while input.try_recv().is_ok() {}

        let events = self.ulab.events();
        self.state.send_replace(GateState::WaitingForInput);
        events.message(format!("{} (type 'continue' to proceed or 'quit' to stop)", prompt));

        let mut stop_poll = interval_at(Instant::now() + STOP_POLL, STOP_POLL);
        stop_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            if self.ulab.cancel().is_stop_requested() {
                break GateOutcome::Cancelled;
            }
            tokio::select! {
                line = input.recv() => match line {
                    Some(OperatorInput::Continue) => break GateOutcome::Resumed,
                    Some(OperatorInput::Quit) => {
                        events.message("quit requested, stopping all devices");
                        self.ulab.stop_all_devices().await;
                        break GateOutcome::Quit;
                    }
                    Some(OperatorInput::Other(text)) => {
                        events.message(format!(
                            "unrecognised input '{}', type 'continue' or 'quit'",
                            text
                        ));
                    }
                    None => break GateOutcome::Cancelled,
                },
                _ = stop_poll.tick() => {}
            }
        };

        self.state.send_replace(GateState::Resumed);
        if outcome == GateOutcome::Resumed {
            events.message("resuming");
        }
        outcome
    }
}

impl std::fmt::Debug for OperatorGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorGate")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn until_waiting(gate: &OperatorGate) {
        let mut state = gate.subscribe_state();
        while *state.borrow_and_update() != GateState::WaitingForInput {
            state.changed().await.unwrap();
        }
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(OperatorInput::parse("Continue\n"), OperatorInput::Continue);
        assert_eq!(OperatorInput::parse(" c "), OperatorInput::Continue);
        assert_eq!(OperatorInput::parse("EXIT"), OperatorInput::Quit);
        assert_eq!(OperatorInput::parse("q"), OperatorInput::Quit);
        assert_eq!(
            OperatorInput::parse("go on"),
            OperatorInput::Other("go on".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_resumes_after_reprompt() {
        let ulab = Arc::new(Ulab::default());
        let mut messages = ulab.events().subscribe_messages();
        let gate = Arc::new(OperatorGate::new(ulab));

        let waiter = Arc::clone(&gate);
        let handle = tokio::spawn(async move { waiter.wait("lines washed").await });

        until_waiting(&gate).await;
        assert_eq!(gate.submit("what"), Submitted::Delivered);
        assert_eq!(gate.submit("c"), Submitted::Delivered);
        assert_eq!(handle.await.unwrap(), GateOutcome::Resumed);
        assert_eq!(gate.state(), GateState::Resumed);

        let prompt = messages.recv().await.unwrap();
        assert!(prompt.starts_with("lines washed"));
        let reprompt = messages.recv().await.unwrap();
        assert!(reprompt.contains("'what'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flag_releases_within_a_second() {
        let ulab = Arc::new(Ulab::default());
        let gate = Arc::new(OperatorGate::new(Arc::clone(&ulab)));

        let waiter = Arc::clone(&gate);
        let handle = tokio::spawn(async move { waiter.wait("paused").await });
        until_waiting(&gate).await;

        let set_at = Instant::now();
        ulab.cancel().request_stop();
        assert_eq!(handle.await.unwrap(), GateOutcome::Cancelled);
        assert!(set_at.elapsed() <= STOP_POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_while_waiting_stops_devices() {
        let ulab = Arc::new(Ulab::default());
        let gate = Arc::new(OperatorGate::new(Arc::clone(&ulab)));

        let waiter = Arc::clone(&gate);
        let handle = tokio::spawn(async move { waiter.wait("paused").await });
        until_waiting(&gate).await;

        assert_eq!(gate.submit("quit"), Submitted::Delivered);
        assert_eq!(handle.await.unwrap(), GateOutcome::Quit);
        assert!(ulab.cancel().is_stop_requested());
    }

    #[test]
    fn test_input_outside_wait() {
        let ulab = Arc::new(Ulab::default());
        let gate = OperatorGate::new(Arc::clone(&ulab));
        assert_eq!(gate.submit("continue"), Submitted::Ignored);
        assert!(!ulab.cancel().is_stop_requested());
        assert_eq!(gate.submit("Q"), Submitted::Quit);
        assert!(ulab.cancel().is_stop_requested());
    }
}
