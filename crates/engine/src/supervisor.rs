use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{error, info, warn};

use ledger::PositionLedger;
use model::{CommandOutcome, EngineCommand, EngineEvent, EngineState, TriggerKind};
use risk::{RiskControl, SharedAccounting};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A command paired with its acknowledgement channel. Callers always get a
/// reply: `Accepted`, or `Denied` with an explanation.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: EngineCommand,
    pub reply: oneshot::Sender<CommandOutcome>,
}

/// Owner of the engine state machine.
///
/// Dispatches operator commands, observes the event bus for conditions
/// that force a state change (drawdown halt, persistence divergence), and
/// coordinates the bounded stop drain.
pub struct Supervisor {
    command_rx: mpsc::Receiver<CommandEnvelope>,
    state_tx: watch::Sender<EngineState>,
    control_tx: mpsc::Sender<RiskControl>,
    event_tx: broadcast::Sender<EngineEvent>,
    event_rx: broadcast::Receiver<EngineEvent>,
    stream_ready_rx: watch::Receiver<bool>,
    accounting: SharedAccounting,
    ledger: Arc<PositionLedger>,
    /// How long `Start` waits for the market stream.
    start_deadline: Duration,
    /// How long `Stop` waits for the executor to drain.
    stop_drain_deadline: Duration,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command_rx: mpsc::Receiver<CommandEnvelope>,
        state_tx: watch::Sender<EngineState>,
        control_tx: mpsc::Sender<RiskControl>,
        event_tx: broadcast::Sender<EngineEvent>,
        stream_ready_rx: watch::Receiver<bool>,
        accounting: SharedAccounting,
        ledger: Arc<PositionLedger>,
    ) -> Self {
        let event_rx = event_tx.subscribe();
        Self {
            command_rx,
            state_tx,
            control_tx,
            event_tx,
            event_rx,
            stream_ready_rx,
            accounting,
            ledger,
            start_deadline: Duration::from_secs(5),
            stop_drain_deadline: Duration::from_secs(30),
        }
    }

    pub fn with_start_deadline(mut self, deadline: Duration) -> Self {
        self.start_deadline = deadline;
        self
    }

    pub fn with_stop_drain_deadline(mut self, deadline: Duration) -> Self {
        self.stop_drain_deadline = deadline;
        self
    }

    pub async fn run(mut self) {
        info!("supervisor running, engine stopped until started");
        loop {
            tokio::select! {
                envelope = self.command_rx.recv() => match envelope {
                    Some(envelope) => {
                        info!(command = %envelope.command, "command received");
                        let outcome = self.handle_command(envelope.command).await;
                        if let CommandOutcome::Denied(reason) = &outcome {
                            info!(command = %envelope.command, reason = %reason, "command denied");
                        }
                        let _ = envelope.reply.send(outcome);
                    }
                    None => {
                        warn!("command channel closed, supervisor exiting");
                        return;
                    }
                },

                event = self.event_rx.recv() => match event {
                    Ok(event) => self.observe_event(event),
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "supervisor lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("event bus closed, supervisor exiting");
                        return;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) -> CommandOutcome {
        let state = *self.state_tx.borrow();

        match (command, state) {
            (EngineCommand::Start, EngineState::Stopped) => {
                if !self.await_stream_ready().await {
                    let _ = self.event_tx.send(EngineEvent::StreamUnavailable);
                    return CommandOutcome::Denied(format!(
                        "market stream not ready within {}s",
                        self.start_deadline.as_secs()
                    ));
                }
                self.transition(EngineState::Running);
                CommandOutcome::Accepted
            }
            (EngineCommand::Start, other) => {
                CommandOutcome::Denied(format!("already {other}"))
            }

            (EngineCommand::Stop, EngineState::Stopped) => {
                CommandOutcome::Denied("already stopped".into())
            }
            (EngineCommand::Stop, _) => {
                self.stop_sequence().await;
                CommandOutcome::Accepted
            }

            (EngineCommand::Pause, EngineState::Running) => {
                self.transition(EngineState::Paused);
                CommandOutcome::Accepted
            }
            (EngineCommand::Pause, other) => {
                CommandOutcome::Denied(format!("cannot pause while {other}"))
            }

            (EngineCommand::Resume, EngineState::Paused) => {
                self.transition(EngineState::Running);
                CommandOutcome::Accepted
            }
            (EngineCommand::Resume, other) => {
                CommandOutcome::Denied(format!("cannot resume while {other}"))
            }

            (EngineCommand::ResetDrawdown, EngineState::Halted) => {
                if self.control_tx.send(RiskControl::ResetDrawdown).await.is_err() {
                    return CommandOutcome::Denied("risk manager unavailable".into());
                }
                self.transition(EngineState::Running);
                CommandOutcome::Accepted
            }
            // A running engine can still carry a risk-level halt; the reset
            // clears it without a state change.
            (EngineCommand::ResetDrawdown, EngineState::Running) => {
                if self.control_tx.send(RiskControl::ResetDrawdown).await.is_err() {
                    return CommandOutcome::Denied("risk manager unavailable".into());
                }
                CommandOutcome::Accepted
            }
            (EngineCommand::ResetDrawdown, other) => {
                CommandOutcome::Denied(format!("nothing to reset while {other}"))
            }
        }
    }

    /// Flatten, drain, stop. Bounded: when the window expires the engine
    /// stops regardless and whatever stayed open is reported.
    async fn stop_sequence(&mut self) {
        self.transition(EngineState::Stopping);

        if self.control_tx.send(RiskControl::FlattenAll).await.is_err() {
            warn!("risk manager unavailable, stopping without flatten");
        }

        let deadline = tokio::time::Instant::now() + self.stop_drain_deadline;
        let drained = loop {
            if self.accounting.open_order_count() == 0 {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        };

        if !drained {
            warn!(
                in_flight = self.accounting.open_order_count(),
                "stop drain window expired with orders in flight"
            );
        }

        let orphans: Vec<String> = self
            .ledger
            .open_positions()
            .into_iter()
            .map(|p| p.pair)
            .collect();
        if !orphans.is_empty() {
            warn!(pairs = ?orphans, "positions still open at stop");
            let _ = self
                .event_tx
                .send(EngineEvent::StopTimeoutOrphans { pairs: orphans });
        }

        self.transition(EngineState::Stopped);
    }

    fn observe_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Trigger {
                kind: TriggerKind::DrawdownHalt,
                ..
            } => {
                let state = *self.state_tx.borrow();
                if state == EngineState::Running || state == EngineState::Paused {
                    self.transition(EngineState::Halted);
                }
            }
            EngineEvent::PersistenceDivergence { detail } => {
                error!(detail = %detail, "persistence divergence, halting new orders");
                let state = *self.state_tx.borrow();
                if state != EngineState::Stopped && state != EngineState::Stopping {
                    self.transition(EngineState::Halted);
                }
            }
            _ => {}
        }
    }

    async fn await_stream_ready(&mut self) -> bool {
        if *self.stream_ready_rx.borrow() {
            return true;
        }
        let wait = async {
            while self.stream_ready_rx.changed().await.is_ok() {
                if *self.stream_ready_rx.borrow() {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(self.start_deadline, wait)
            .await
            .unwrap_or(false)
    }

    fn transition(&self, to: EngineState) {
        let from = *self.state_tx.borrow();
        if from == to {
            return;
        }
        info!(from = %from, to = %to, "engine state changed");
        self.state_tx.send_replace(to);
        let _ = self.event_tx.send(EngineEvent::StateChanged { from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::TradingMode;
    use risk::create_accounting;
    use rust_decimal_macros::dec;

    struct Rig {
        command_tx: mpsc::Sender<CommandEnvelope>,
        state_rx: watch::Receiver<EngineState>,
        control_rx: mpsc::Receiver<RiskControl>,
        event_tx: broadcast::Sender<EngineEvent>,
        ready_tx: watch::Sender<bool>,
        accounting: SharedAccounting,
    }

    async fn rig(stream_ready: bool) -> Rig {
        let ledger = Arc::new(
            PositionLedger::open("sqlite::memory:", TradingMode::Paper)
                .await
                .unwrap(),
        );
        let accounting = create_accounting(dec!(10000));
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(EngineState::Stopped);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (event_tx, _) = broadcast::channel(64);
        let (ready_tx, ready_rx) = watch::channel(stream_ready);

        let supervisor = Supervisor::new(
            command_rx,
            state_tx,
            control_tx,
            event_tx.clone(),
            ready_rx,
            accounting.clone(),
            ledger,
        )
        .with_start_deadline(Duration::from_millis(100))
        .with_stop_drain_deadline(Duration::from_millis(300));

        tokio::spawn(supervisor.run());

        Rig {
            command_tx,
            state_rx,
            control_rx,
            event_tx,
            ready_tx,
            accounting,
        }
    }

    async fn send(rig: &Rig, command: EngineCommand) -> CommandOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        rig.command_tx
            .send(CommandEnvelope {
                command,
                reply: reply_tx,
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), reply_rx)
            .await
            .expect("reply in time")
            .expect("reply sent")
    }

    #[tokio::test]
    async fn test_start_requires_ready_stream() {
        let rig = rig(false).await;

        let outcome = send(&rig, EngineCommand::Start).await;
        assert!(matches!(outcome, CommandOutcome::Denied(_)));
        assert_eq!(*rig.state_rx.borrow(), EngineState::Stopped);

        rig.ready_tx.send(true).unwrap();
        let outcome = send(&rig, EngineCommand::Start).await;
        assert_eq!(outcome, CommandOutcome::Accepted);
        assert_eq!(*rig.state_rx.borrow(), EngineState::Running);
    }

    #[tokio::test]
    async fn test_start_is_denied_when_already_running() {
        let rig = rig(true).await;
        send(&rig, EngineCommand::Start).await;

        let outcome = send(&rig, EngineCommand::Start).await;
        assert!(matches!(outcome, CommandOutcome::Denied(reason) if reason.contains("running")));
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let rig = rig(true).await;
        send(&rig, EngineCommand::Start).await;

        assert_eq!(send(&rig, EngineCommand::Pause).await, CommandOutcome::Accepted);
        assert_eq!(*rig.state_rx.borrow(), EngineState::Paused);

        // Pausing a paused engine is an operator error, state unchanged
        assert!(matches!(
            send(&rig, EngineCommand::Pause).await,
            CommandOutcome::Denied(_)
        ));

        assert_eq!(send(&rig, EngineCommand::Resume).await, CommandOutcome::Accepted);
        assert_eq!(*rig.state_rx.borrow(), EngineState::Running);
    }

    #[tokio::test]
    async fn test_stop_flattens_and_reaches_stopped() {
        let mut rig = rig(true).await;
        send(&rig, EngineCommand::Start).await;

        assert_eq!(send(&rig, EngineCommand::Stop).await, CommandOutcome::Accepted);
        assert_eq!(*rig.state_rx.borrow(), EngineState::Stopped);
        assert_eq!(rig.control_rx.recv().await, Some(RiskControl::FlattenAll));
    }

    #[tokio::test]
    async fn test_stop_times_out_with_orders_in_flight() {
        let mut rig = rig(true).await;
        send(&rig, EngineCommand::Start).await;

        // An order that never resolves keeps the count up; the drain must
        // still finish within its window.
        rig.accounting.increment_open_orders();

        let started = tokio::time::Instant::now();
        assert_eq!(send(&rig, EngineCommand::Stop).await, CommandOutcome::Accepted);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(*rig.state_rx.borrow(), EngineState::Stopped);
        let _ = rig.control_rx.try_recv();
    }

    #[tokio::test]
    async fn test_drawdown_event_moves_engine_to_halted() {
        let mut rig = rig(true).await;
        send(&rig, EngineCommand::Start).await;

        rig.event_tx
            .send(EngineEvent::Trigger {
                kind: TriggerKind::DrawdownHalt,
                pair: "BTCUSDT".into(),
                detail: "test".into(),
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                rig.state_rx.changed().await.unwrap();
                if *rig.state_rx.borrow() == EngineState::Halted {
                    break;
                }
            }
        })
        .await
        .expect("engine halts on drawdown");

        // Reset restores Running and forwards the control to risk
        assert_eq!(
            send(&rig, EngineCommand::ResetDrawdown).await,
            CommandOutcome::Accepted
        );
        assert_eq!(*rig.state_rx.borrow(), EngineState::Running);
        assert_eq!(
            rig.control_rx.recv().await,
            Some(RiskControl::ResetDrawdown)
        );
    }

    #[tokio::test]
    async fn test_persistence_divergence_halts_engine() {
        let mut rig = rig(true).await;
        send(&rig, EngineCommand::Start).await;

        rig.event_tx
            .send(EngineEvent::PersistenceDivergence {
                detail: "test".into(),
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                rig.state_rx.changed().await.unwrap();
                if *rig.state_rx.borrow() == EngineState::Halted {
                    break;
                }
            }
        })
        .await
        .expect("engine halts on divergence");
    }

    #[tokio::test]
    async fn test_reset_drawdown_denied_while_stopped() {
        let rig = rig(true).await;
        assert!(matches!(
            send(&rig, EngineCommand::ResetDrawdown).await,
            CommandOutcome::Denied(_)
        ));
    }
}
