//! Position confirmation.
//!
//! Replies carry no request id, so a reply can only be attributed by its
//! (device, axis) pair. [`ResponseWaiter`] therefore allows at most one wait
//! per pair: a second concurrent wait fails with [`UlabError::WaiterBusy`]
//! instead of racing the first for the same replies.
//!
//! A wait also ends within one [`SLICE`] of a stop or emergency request,
//! with [`WaitOutcome::cancelled`] set and no further polls queued.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, instrument, warn};
use ulab_core::{CancellationToken, EventBus, Result, UlabError, SLICE};
use ulab_protocol::{Axis, Command, DeviceCode};

use crate::queue::CommandQueue;

/// Tuning of a single position wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitParams {
    /// A report strictly closer than this counts as arrived.
    pub tolerance_um: u16,
    /// Give up after this long without a report within tolerance.
    pub timeout: Duration,
    /// Period of the GetPosition re-poll while waiting.
    pub poll_interval: Duration,
}

impl Default for WaitParams {
    fn default() -> Self {
        Self {
            tolerance_um: 1000,
            timeout: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Result of a wait that was allowed to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOutcome {
    /// A report within tolerance arrived.
    pub reached: bool,
    /// Last position reported for the pair during this wait.
    pub last_seen_um: Option<u16>,
    /// The wait ended on a stop or emergency request.
    pub cancelled: bool,
}

type Slots = Arc<Mutex<HashSet<(DeviceCode, Axis)>>>;

/// Releases the (device, axis) slot when the wait ends, however it ends.
struct SlotGuard {
    slots: Slots,
    key: (DeviceCode, Axis),
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.key);
    }
}

/// Correlates position replies with an outstanding move.
#[derive(Debug, Clone)]
pub struct ResponseWaiter {
    queue: CommandQueue,
    events: EventBus,
    cancel: CancellationToken,
    slots: Slots,
}

impl ResponseWaiter {
    /// Waiter polling through `queue`, listening on `events` and giving up
    /// when `cancel` asks to.
    pub fn new(queue: CommandQueue, events: EventBus, cancel: CancellationToken) -> Self {
        Self {
            queue,
            events,
            cancel,
            slots: Arc::default(),
        }
    }

    fn claim(&self, device: DeviceCode, axis: Axis) -> Result<SlotGuard> {
        let key = (device, axis);
        if !self.slots.lock().insert(key) {
            return Err(UlabError::WaiterBusy { device, axis });
        }
        Ok(SlotGuard {
            slots: Arc::clone(&self.slots),
            key,
        })
    }

    /// Whether a wait on the pair is in flight.
    pub fn is_busy(&self, device: DeviceCode, axis: Axis) -> bool {
        self.slots.lock().contains(&(device, axis))
    }

    /// Wait until `device`/`axis` reports a position within tolerance of
    /// `target_um`, re-polling the stage until then.
    ///
    /// Issues no move itself. Returns `Ok` with `reached == false` on timeout
    /// and with `cancelled == true` on a stop or emergency request.
    #[instrument(skip(self, device, axis, params), fields(device = %device, axis = %axis))]
    pub async fn wait_for_position(
        &self,
        device: DeviceCode,
        axis: Axis,
        target_um: u16,
        params: WaitParams,
    ) -> Result<WaitOutcome> {
        let _slot = self.claim(device, axis)?;
        let mut updates = self.events.subscribe_positions();
        self.events
            .message(format!("confirming {} of {}, target {} um", axis, device, target_um));

        let mut poll = interval(params.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(params.timeout);
        tokio::pin!(deadline);
        let mut abort_check = interval(SLICE);
        abort_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_seen_um = None;
        loop {
            if self.cancel.should_abort() {
                debug!(target_um, "position wait cancelled");
                return Ok(WaitOutcome {
                    reached: false,
                    last_seen_um,
                    cancelled: true,
                });
            }
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(update) if update.device == device && update.axis == axis => {
                        last_seen_um = Some(update.position_um);
                        let error = (i32::from(update.position_um) - i32::from(target_um)).abs();
                        if error < i32::from(params.tolerance_um) {
                            debug!(position_um = update.position_um, "position reached");
                            return Ok(WaitOutcome {
                                reached: true,
                                last_seen_um,
                                cancelled: false,
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "position subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = abort_check.tick() => {}
                _ = poll.tick() => self.queue.push_command(Command::GetPosition { device, axis }),
                _ = &mut deadline => break,
            }
        }

        let last = last_seen_um.map_or_else(|| "none".to_string(), |p| p.to_string());
        warn!(target_um, last_seen = %last, "position not confirmed");
        self.events.message(format!(
            "error: {} of {} did not reach {} um within {} ms (last position: {})",
            axis,
            device,
            target_um,
            params.timeout.as_millis(),
            last
        ));
        Ok(WaitOutcome {
            reached: false,
            last_seen_um,
            cancelled: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulab_core::PositionUpdate;

    fn update(position_um: u16) -> PositionUpdate {
        PositionUpdate {
            device: DeviceCode::LowStage,
            axis: Axis::X,
            position_um,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_first_report_within_tolerance() {
        let queue = CommandQueue::new();
        let events = EventBus::new();
        let waiter = ResponseWaiter::new(queue.clone(), events.clone(), CancellationToken::new());

        let feeder = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            feeder.position(update(20_000 - 1500));
            tokio::time::sleep(Duration::from_millis(300)).await;
            feeder.position(update(20_000 - 200));
        });

        let start = tokio::time::Instant::now();
        let outcome = waiter
            .wait_for_position(DeviceCode::LowStage, Axis::X, 20_000, WaitParams::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WaitOutcome {
                reached: true,
                last_seen_um: Some(19_800),
                cancelled: false,
            }
        );
        assert_eq!(start.elapsed(), Duration::from_millis(600));
        // Polls at 0, 250 and 500 ms.
        assert_eq!(queue.len(), 3);
        assert!(!waiter.is_busy(DeviceCode::LowStage, Axis::X));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerance_is_strict() {
        let events = EventBus::new();
        let waiter = ResponseWaiter::new(CommandQueue::new(), events.clone(), CancellationToken::new());
        let feeder = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            feeder.position(update(9000));
        });

        let params = WaitParams {
            timeout: Duration::from_millis(500),
            ..WaitParams::default()
        };
        let outcome = waiter
            .wait_for_position(DeviceCode::LowStage, Axis::X, 10_000, params)
            .await
            .unwrap();
        assert!(!outcome.reached);
        assert_eq!(outcome.last_seen_um, Some(9000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_reports() {
        let events = EventBus::new();
        let mut messages = events.subscribe_messages();
        let waiter = ResponseWaiter::new(CommandQueue::new(), events, CancellationToken::new());

        let start = tokio::time::Instant::now();
        let outcome = waiter
            .wait_for_position(DeviceCode::HighStage, Axis::Y, 500, WaitParams::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WaitOutcome {
                reached: false,
                last_seen_um: None,
                cancelled: false,
            }
        );
        assert_eq!(start.elapsed(), Duration::from_millis(10_000));

        let _confirming = messages.recv().await.unwrap();
        let failure = messages.recv().await.unwrap();
        assert!(failure.ends_with("(last position: none)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_axes_are_ignored() {
        let events = EventBus::new();
        let waiter = ResponseWaiter::new(CommandQueue::new(), events.clone(), CancellationToken::new());
        let feeder = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            feeder.position(PositionUpdate {
                device: DeviceCode::LowStage,
                axis: Axis::Y,
                position_um: 5000,
            });
            feeder.position(PositionUpdate {
                device: DeviceCode::HighStage,
                axis: Axis::X,
                position_um: 5000,
            });
        });

        let params = WaitParams {
            timeout: Duration::from_millis(1000),
            ..WaitParams::default()
        };
        let outcome = waiter
            .wait_for_position(DeviceCode::LowStage, Axis::X, 5000, params)
            .await
            .unwrap();
        assert!(!outcome.reached);
        assert_eq!(outcome.last_seen_um, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_wait_on_same_axis_is_rejected() {
        let events = EventBus::new();
        let waiter = ResponseWaiter::new(CommandQueue::new(), events, CancellationToken::new());
        let first = waiter.clone();
        let handle = tokio::spawn(async move {
            first
                .wait_for_position(DeviceCode::LowStage, Axis::X, 100, WaitParams::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = waiter
            .wait_for_position(DeviceCode::LowStage, Axis::X, 100, WaitParams::default())
            .await;
        assert!(matches!(second, Err(UlabError::WaiterBusy { .. })));

        let other_axis = tokio::spawn({
            let waiter = waiter.clone();
            async move {
                waiter
                    .wait_for_position(DeviceCode::LowStage, Axis::Y, 100, WaitParams::default())
                    .await
            }
        });

        assert!(!handle.await.unwrap().unwrap().reached);
        assert!(!other_axis.await.unwrap().unwrap().reached);
        assert!(!waiter.is_busy(DeviceCode::LowStage, Axis::X));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_wait_within_a_slice() {
        let queue = CommandQueue::new();
        let events = EventBus::new();
        let cancel = CancellationToken::new();
        let waiter = ResponseWaiter::new(queue.clone(), events, cancel.clone());

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1030)).await;
            stopper.request_stop();
        });

        let start = tokio::time::Instant::now();
        let outcome = waiter
            .wait_for_position(DeviceCode::LowStage, Axis::X, 14_000, WaitParams::default())
            .await
            .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.reached);
        assert!(start.elapsed() <= Duration::from_millis(1030) + SLICE);
        assert!(!waiter.is_busy(DeviceCode::LowStage, Axis::X));

        // No polls are queued once the wait has ended.
        let polls = queue.len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.len(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_already_set_ends_wait_at_once() {
        let cancel = CancellationToken::new();
        cancel.trigger_emergency();
        let waiter = ResponseWaiter::new(CommandQueue::new(), EventBus::new(), cancel);

        let start = tokio::time::Instant::now();
        let outcome = waiter
            .wait_for_position(DeviceCode::HighStage, Axis::Y, 100, WaitParams::default())
            .await
            .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
