//! The task that owns the serial link.
//!
//! [`TransportPump::run`] multiplexes five activities over one port:
//!
//! | Activity | Default period | Effect |
//! |----------|----------------|--------|
//! | dispatch | 100 ms | write at most one queued frame |
//! | read | as bytes arrive | append to the frame codec |
//! | parse | 30 ms | decode buffered frames, publish replies |
//! | position poll | 1000 ms | queue GetPosition for every registered axis |
//! | telemetry | 3000 ms | queue GetPressure and GetFlow, alternating |
//!
//! Telemetry ticks at half the telemetry interval so each query is issued
//! once per interval and the two never overlap.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};
use ulab_core::{EventBus, PositionUpdate, Result, SerialPortIO};
use ulab_protocol::{Axis, Command, DeviceCode, Frame, FrameCodec, Reply};

use crate::queue::CommandQueue;

/// Periods of the transport activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// One queued frame is written per tick.
    pub dispatch_interval: Duration,
    /// Inbound bytes are read and decoded per tick.
    pub parse_interval: Duration,
    /// Position queries for every polled axis.
    pub poll_interval: Duration,
    /// Alternating pressure and flow queries.
    pub telemetry_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(100),
            parse_interval: Duration::from_millis(30),
            poll_interval: Duration::from_millis(1000),
            telemetry_interval: Duration::from_millis(6000),
        }
    }
}

/// Stage axes whose position is polled in the background.
#[derive(Debug, Clone, Default)]
pub struct PollRegistry {
    pairs: Arc<Mutex<BTreeSet<(DeviceCode, Axis)>>>,
}

impl PollRegistry {
    /// No axes polled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the pair was already registered.
    pub fn enable(&self, device: DeviceCode, axis: Axis) -> bool {
        self.pairs.lock().insert((device, axis))
    }

    /// Returns `false` if the pair was not registered.
    pub fn disable(&self, device: DeviceCode, axis: Axis) -> bool {
        self.pairs.lock().remove(&(device, axis))
    }

    /// Whether `axis` of `device` is polled.
    pub fn contains(&self, device: DeviceCode, axis: Axis) -> bool {
        self.pairs.lock().contains(&(device, axis))
    }

    /// Polled pairs in device then axis order.
    pub fn snapshot(&self) -> Vec<(DeviceCode, Axis)> {
        self.pairs.lock().iter().copied().collect()
    }
}

/// On/off switch for pressure and flow polling.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySwitch {
    enabled: Arc<AtomicBool>,
}

impl TelemetrySwitch {
    /// Turn polling on or off.
    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Polling state.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelemetryQuery {
    Pressure,
    Flow,
}

/// Sole writer and reader of the serial port.
pub struct TransportPump {
    settings: TransportSettings,
    queue: CommandQueue,
    events: EventBus,
    polls: PollRegistry,
    telemetry: TelemetrySwitch,
    codec: FrameCodec,
    next_query: TelemetryQuery,
}

impl TransportPump {
    /// A pump sharing its queue, bus and switches with the engine.
    pub fn new(
        settings: TransportSettings,
        queue: CommandQueue,
        events: EventBus,
        polls: PollRegistry,
        telemetry: TelemetrySwitch,
    ) -> Self {
        Self {
            settings,
            queue,
            events,
            polls,
            telemetry,
            codec: FrameCodec::new(),
            next_query: TelemetryQuery::Pressure,
        }
    }

    /// Service `port` until `shutdown` flips to `true`, its sender is dropped,
    /// or the port reaches end of stream.
    pub async fn run<P: SerialPortIO>(mut self, port: P, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(port);
        let mut dispatch = ticker(self.settings.dispatch_interval, false);
        let mut parse = ticker(self.settings.parse_interval, false);
        let mut poll = ticker(self.settings.poll_interval, true);
        let mut telemetry = ticker(self.settings.telemetry_interval / 2, true);
        let mut buf = [0u8; 256];

        debug!(settings = ?self.settings, "transport started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = dispatch.tick() => self.dispatch(&mut writer).await?,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        warn!("serial link reached end of stream");
                        break;
                    }
                    Ok(n) => {
                        trace!(bytes = n, "read");
                        self.codec.extend(&buf[..n]);
                    }
                    Err(e) => return Err(e.into()),
                },
                _ = parse.tick() => {
                    self.parse_pending();
                }
                _ = poll.tick() => self.poll_positions(),
                _ = telemetry.tick() => self.query_telemetry(),
            }
        }

        self.parse_pending();
        debug!(rejected = self.codec.rejected(), "transport stopped");
        Ok(())
    }

    async fn dispatch<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<()> {
        if let Some(frame) = self.queue.pop() {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await?;
            trace!(?frame, "sent");
        }
        Ok(())
    }

    /// Decode every complete buffered frame and publish the replies.
    /// Returns how many frames were decoded.
    pub fn parse_pending(&mut self) -> usize {
        let frames = self.codec.drain_frames();
        for frame in &frames {
            self.publish(frame);
        }
        frames.len()
    }

    /// Feed raw bytes to the decoder without a port.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.codec.extend(bytes);
    }

    fn publish(&self, frame: &Frame) {
        match Reply::classify(frame) {
            Some(Reply::Position {
                device,
                axis,
                position_um,
            }) => self.events.position(PositionUpdate {
                device,
                axis,
                position_um,
            }),
            Some(Reply::Pressure(value)) => self.events.pressure(value),
            Some(Reply::Flow(value)) => self.events.flow(value),
            None => trace!(?frame, "frame carries no telemetry"),
        }
    }

    fn poll_positions(&self) {
        for (device, axis) in self.polls.snapshot() {
            self.queue.push_command(Command::GetPosition { device, axis });
        }
    }

    fn query_telemetry(&mut self) {
        if !self.telemetry.is_enabled() {
            self.next_query = TelemetryQuery::Pressure;
            return;
        }
        match self.next_query {
            TelemetryQuery::Pressure => {
                self.queue.push_command(Command::GetPressure);
                self.next_query = TelemetryQuery::Flow;
            }
            TelemetryQuery::Flow => {
                self.queue.push_command(Command::GetFlow);
                self.next_query = TelemetryQuery::Pressure;
            }
        }
    }
}

fn ticker(period: Duration, delay_first: bool) -> Interval {
    let mut ticker = if delay_first {
        interval_at(Instant::now() + period, period)
    } else {
        interval(period)
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump() -> (TransportPump, CommandQueue, EventBus, PollRegistry, TelemetrySwitch) {
        let queue = CommandQueue::new();
        let events = EventBus::new();
        let polls = PollRegistry::new();
        let telemetry = TelemetrySwitch::default();
        let pump = TransportPump::new(
            TransportSettings::default(),
            queue.clone(),
            events.clone(),
            polls.clone(),
            telemetry.clone(),
        );
        (pump, queue, events, polls, telemetry)
    }

    #[tokio::test]
    async fn test_parse_publishes_typed_events() {
        let (mut pump, _queue, events, _polls, _telemetry) = pump();
        let mut positions = events.subscribe_positions();
        let mut pressure = events.subscribe_pressure();
        let mut flow = events.subscribe_flow();

        // GetPosition reply for low stage Y: opcode 0x09 + 7.
        pump.feed(Frame::with_content(0x10, 0x02, 31_000).as_bytes());
        pump.feed(Frame::with_content(0x24, 0x04, 250).as_bytes());
        pump.feed(&[0x00, 0xFE]);
        pump.feed(Frame::with_content(0x23, 0x04, 17).as_bytes());
        assert_eq!(pump.parse_pending(), 3);

        assert_eq!(
            positions.recv().await.unwrap(),
            PositionUpdate {
                device: DeviceCode::LowStage,
                axis: Axis::Y,
                position_um: 31_000,
            }
        );
        assert_eq!(pressure.recv().await.unwrap(), 250);
        assert_eq!(flow.recv().await.unwrap(), 17);
    }

    #[test]
    fn test_poll_queues_registered_axes() {
        let (pump, queue, _events, polls, _telemetry) = pump();
        assert!(polls.enable(DeviceCode::LowStage, Axis::X));
        assert!(!polls.enable(DeviceCode::LowStage, Axis::X));
        polls.enable(DeviceCode::HighStage, Axis::Z);

        pump.poll_positions();
        let frames = queue.snapshot();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode(), Axis::X.base() + 7);
        assert_eq!(frames[1].device_id(), 0x03);

        assert!(polls.disable(DeviceCode::HighStage, Axis::Z));
        queue.clear();
        pump.poll_positions();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_telemetry_alternates_only_when_enabled() {
        let (mut pump, queue, _events, _polls, telemetry) = pump();
        pump.query_telemetry();
        assert!(queue.is_empty());

        telemetry.set(true);
        pump.query_telemetry();
        pump.query_telemetry();
        pump.query_telemetry();
        let opcodes: Vec<u8> = queue.snapshot().iter().map(|f| f.opcode()).collect();
        assert_eq!(opcodes, vec![0x24, 0x23, 0x24]);
    }
}
