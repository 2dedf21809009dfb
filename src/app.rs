//! Session wiring shared by the CLI subcommands.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use ulab_core::Completion;
use ulab_experiment::{OperatorGate, Protocol, ProtocolRunner, RunReport, Submitted};
use ulab_hardware::Ulab;

use crate::config::UlabConfig;

/// Longest wait for the pump stops to be written before the port closes.
pub const STOP_FLUSH_LIMIT: Duration = Duration::from_secs(5);

/// Engine and sequencers configured from `config`. No port is opened.
pub fn build_runner(config: &UlabConfig) -> ProtocolRunner {
    let ulab = Ulab::new(config.transport_settings(), config.stage_table())
        .with_baud_rate(config.port.baud_rate);
    let runner = ProtocolRunner::new(Arc::new(ulab));
    runner.liquid().set_reagent_config(config.reagents.clone());
    runner.liquid().set_sample_config(config.samples.clone());
    runner
}

/// Read stdin on a plain thread and hand the lines over a channel.
///
/// A blocking stdin read inside the runtime would hold shutdown until the
/// next line arrives.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        use std::io::BufRead;
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Route operator lines to the gate until the input ends or the operator
/// quits outside a wait, which stops every device.
pub async fn forward_operator_input(
    mut lines: mpsc::UnboundedReceiver<String>,
    gate: Arc<OperatorGate>,
    ulab: Arc<Ulab>,
) {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        match gate.submit(&line) {
            Submitted::Delivered => {}
            Submitted::Ignored => ulab
                .events()
                .message("no confirmation pending; type 'quit' to stop the run"),
            Submitted::Quit => {
                ulab.stop_all_devices().await;
                return;
            }
        }
    }
}

/// Open the port, run `protocol` with operator input from `lines`, and close
/// the port again. Ctrl-C stops every device before the port is closed.
pub async fn run_session(
    runner: Arc<ProtocolRunner>,
    port: &str,
    protocol: &Protocol,
    lines: mpsc::UnboundedReceiver<String>,
) -> Result<RunReport> {
    let ulab = Arc::clone(runner.ulab());
    if !ulab.init_port(port).await {
        bail!("could not open serial port {}", port);
    }

    let input = tokio::spawn(forward_operator_input(
        lines,
        Arc::clone(runner.gate()),
        Arc::clone(&ulab),
    ));

    let outcome = tokio::select! {
        result = runner.run(protocol) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    input.abort();

    let result = match outcome {
        Some(result) => result.with_context(|| format!("protocol '{}' failed", protocol.name)),
        None => {
            warn!("interrupted, stopping all devices");
            ulab.stop_all_devices().await;
            Ok(RunReport {
                completion: Completion::Cancelled,
                completed: 0,
                failures: Vec::new(),
            })
        }
    };
    if ulab.cancel().is_stop_requested() && !ulab.flush(STOP_FLUSH_LIMIT).await {
        warn!(unsent = ulab.queue().len(), "closing with stop frames still queued");
    }
    ulab.close_port().await;

    if let Ok(report) = &result {
        info!(
            completed = report.completed,
            failed = report.failures.len(),
            cancelled = report.completion.is_cancelled(),
            "session finished"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulab_experiment::GateState;

    #[test]
    fn test_build_runner_applies_channel_maps() {
        let mut config = UlabConfig::default();
        config.reagents.insert("PBS".into(), 1);
        config.samples.insert("Waste".into(), 1);
        config.samples.insert("Sample1".into(), 2);

        let runner = build_runner(&config);
        assert_eq!(runner.liquid().reagent_config().get("PBS"), Some(&1));
        assert_eq!(runner.liquid().sample_config().len(), 2);
        assert!(!runner.ulab().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_outside_wait_stops_devices() {
        let runner = build_runner(&UlabConfig::default());
        let ulab = Arc::clone(runner.ulab());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("continue".to_string()).unwrap();
        tx.send("exit".to_string()).unwrap();

        forward_operator_input(rx, Arc::clone(runner.gate()), Arc::clone(&ulab)).await;
        assert!(ulab.cancel().is_stop_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_reach_a_waiting_gate() {
        let runner = build_runner(&UlabConfig::default());
        let gate = Arc::clone(runner.gate());
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn(forward_operator_input(
            rx,
            Arc::clone(&gate),
            Arc::clone(runner.ulab()),
        ));

        let waiter = Arc::clone(&gate);
        let wait = tokio::spawn(async move { waiter.wait("check the plate").await });
        let mut state = gate.subscribe_state();
        while *state.borrow_and_update() != GateState::WaitingForInput {
            state.changed().await.unwrap();
        }
        tx.send("C".to_string()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ulab_experiment::GateOutcome::Resumed);
        drop(tx);
        forward.await.unwrap();
    }
}
