//! The device engine.
//!
//! [`Ulab`] owns the command queue, the transport task and the shared state
//! every sequencer works against: event bus, cancellation token, poll
//! registry, response waiter and the per-stage logical position cache.
//!
//! Primitive calls only enqueue frames; they return as soon as the frame is
//! queued. Anything that must observe the device goes through the
//! [`ResponseWaiter`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use ulab_core::serial::{drain_serial_buffer, list_ports, open_serial_async};
use ulab_core::{
    CancellationToken, EventBus, PortInfo, Result, SerialPortIO, UlabError,
};
use ulab_protocol::{Axis, Command, DeviceCode, BAUD_RATE};

use crate::queue::CommandQueue;
use crate::stage::{StageParams, StageTable};
use crate::transport::{PollRegistry, TelemetrySwitch, TransportPump, TransportSettings};
use crate::waiter::{ResponseWaiter, WaitOutcome, WaitParams};

/// Pipette-board pump that dispenses into the sample.
pub const INBOUND_PUMP_ID: u8 = 1;
/// Pipette-board pump that aspirates from the sample.
pub const OUTBOUND_PUMP_ID: u8 = 8;
/// Pause between the two pump stop commands of a full stop.
pub const STOP_SETTLE: Duration = Duration::from_millis(200);

const STAGES: [DeviceCode; 2] = [DeviceCode::LowStage, DeviceCode::HighStage];

/// Logical well coordinate of a stage: `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridPos {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl GridPos {
    /// No known position, or "before A1".
    pub const UNSET: GridPos = GridPos { x: -1, y: -1 };
    /// A1, also where homing leaves a stage.
    pub const ORIGIN: GridPos = GridPos { x: 0, y: 0 };

    /// Position at column `x`, row `y`.
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

struct Link {
    port_name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

/// Engine for one instrument on one serial link.
pub struct Ulab {
    settings: TransportSettings,
    baud_rate: u32,
    stages: StageTable,
    queue: CommandQueue,
    events: EventBus,
    cancel: CancellationToken,
    polls: PollRegistry,
    telemetry: TelemetrySwitch,
    waiter: ResponseWaiter,
    positions: Mutex<HashMap<DeviceCode, GridPos>>,
    link: Mutex<Option<Link>>,
}

impl Default for Ulab {
    fn default() -> Self {
        Self::new(TransportSettings::default(), StageTable::default())
    }
}

impl Ulab {
    /// An engine with no port attached. Commands fail with
    /// [`UlabError::PortNotOpen`] until a port is attached with
    /// [`init_port`](Self::init_port) or [`attach`](Self::attach).
    pub fn new(settings: TransportSettings, stages: StageTable) -> Self {
        let queue = CommandQueue::new();
        let events = EventBus::new();
        let cancel = CancellationToken::new();
        let waiter = ResponseWaiter::new(queue.clone(), events.clone(), cancel.clone());
        Self {
            settings,
            baud_rate: BAUD_RATE,
            stages,
            queue,
            events,
            cancel,
            polls: PollRegistry::new(),
            telemetry: TelemetrySwitch::default(),
            waiter,
            positions: Mutex::new(HashMap::new()),
            link: Mutex::new(None),
        }
    }

    /// Override the serial baud rate used by [`init_port`](Self::init_port).
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Event bus shared with the transport.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stop and emergency flags.
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Frames waiting for the dispatcher.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Axes polled in the background.
    pub fn polls(&self) -> &PollRegistry {
        &self.polls
    }

    /// Stage calibrations.
    pub fn stages(&self) -> &StageTable {
        &self.stages
    }

    /// Calibration of one stage.
    pub fn stage(&self, device: DeviceCode) -> Result<&StageParams> {
        self.stages.get(device)
    }

    /// Transport periods.
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    // =========================================================================
    // Link management
    // =========================================================================

    /// Serial ports visible to the operating system.
    pub fn list_ports() -> Vec<PortInfo> {
        list_ports()
    }

    /// Open `port_name` at the configured baud rate (8N1) and start the
    /// transport. Failure is reported on the message topic and as `false`.
    #[instrument(skip(self))]
    pub async fn init_port(&self, port_name: &str) -> bool {
        match open_serial_async(port_name, self.baud_rate).await {
            Ok(mut port) => {
                let stale = drain_serial_buffer(&mut port, 50).await;
                if stale > 0 {
                    info!(stale, "discarded stale bytes after opening");
                }
                self.attach(port_name, port);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to open serial port");
                self.events
                    .message(format!("failed to connect to {}: {}", port_name, e));
                false
            }
        }
    }

    /// Start the transport on an already open port.
    ///
    /// Replaces any running link. Must be called from within a tokio runtime.
    pub fn attach<P: SerialPortIO + 'static>(&self, port_name: &str, port: P) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pump = TransportPump::new(
            self.settings,
            self.queue.clone(),
            self.events.clone(),
            self.polls.clone(),
            self.telemetry.clone(),
        );
        let task = tokio::spawn(pump.run(port, shutdown_rx));

        let previous = self.link.lock().replace(Link {
            port_name: port_name.to_string(),
            shutdown,
            task,
        });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
        }
        self.queue.clear();
        self.events.message(format!("connected to {}", port_name));
    }

    /// Stop the transport and discard unsent frames.
    pub async fn close_port(&self) {
        let link = self.link.lock().take();
        let Some(link) = link else {
            return;
        };
        let _ = link.shutdown.send(true);
        match link.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "transport ended with an error"),
            Err(e) => warn!(error = %e, "transport task failed"),
        }
        let discarded = self.queue.clear();
        if discarded > 0 {
            info!(discarded, "discarded unsent frames on close");
        }
        self.events
            .message(format!("disconnected from {}", link.port_name));
    }

    /// A transport is attached and still running.
    pub fn is_open(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.task.is_finished())
    }

    /// Queue `command` for transmission.
    pub fn send(&self, command: Command) -> Result<()> {
        if !self.is_open() {
            return Err(UlabError::PortNotOpen);
        }
        self.queue.push_command(command);
        Ok(())
    }

    // =========================================================================
    // Pipette board
    // =========================================================================

    /// Start or stop pipette-board pump `id`.
    pub fn rotate(&self, id: u8, start: bool, forward: bool) -> Result<()> {
        self.send(Command::Rotate { id, start, forward })?;
        if start {
            let direction = if forward { "forward" } else { "reverse" };
            self.events
                .message(format!("peristaltic pump {} rotating {}", id, direction));
        } else {
            self.events
                .message(format!("peristaltic pump {} stopped", id));
        }
        Ok(())
    }

    /// Pipette-board pump speed.
    pub fn set_speed(&self, id: u8, speed: u16) -> Result<()> {
        self.send(Command::SetSpeed { id, speed })?;
        self.events
            .message(format!("peristaltic pump {} speed set to {}", id, speed));
        Ok(())
    }

    /// Switch a selector valve.
    pub fn goto_channel(&self, id: u8, address: u8, channel: u8) -> Result<()> {
        self.send(Command::GotoChannel {
            id,
            address,
            channel,
        })?;
        self.events
            .message(format!("valve {} switched to channel {}", address, channel));
        Ok(())
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Home one axis. Any home resets the logical position of `device` to
    /// [`GridPos::ORIGIN`].
    pub fn home(&self, device: DeviceCode, axis: Axis) -> Result<()> {
        self.send(Command::Home { device, axis })?;
        self.set_position(device, GridPos::ORIGIN);
        self.events
            .message(format!("{} of {} homing", axis, device));
        Ok(())
    }

    /// Absolute move of one axis, in µm.
    pub fn goto(&self, device: DeviceCode, axis: Axis, position_um: u16) -> Result<()> {
        self.send(Command::Goto {
            device,
            axis,
            position_um,
        })?;
        self.events
            .message(format!("{} of {} going to {} um", axis, device, position_um));
        Ok(())
    }

    /// Axis speed in 0.12 mm/s units.
    pub fn set_stage_speed(&self, device: DeviceCode, axis: Axis, speed: u16) -> Result<()> {
        self.send(Command::SetStageSpeed {
            device,
            axis,
            speed,
        })
    }

    /// Duration of the next timed move.
    pub fn set_time(&self, device: DeviceCode, axis: Axis, time_ms: u16) -> Result<()> {
        self.send(Command::SetTime {
            device,
            axis,
            time_ms,
        })
    }

    /// Start a timed move.
    pub fn go(&self, device: DeviceCode, axis: Axis, forward: bool) -> Result<()> {
        self.send(Command::Go {
            device,
            axis,
            forward,
        })
    }

    /// Energise or release one axis driver. Polling is left alone; see
    /// [`set_axis_enable`](Self::set_axis_enable).
    pub fn enable(&self, device: DeviceCode, axis: Axis, enable: bool) -> Result<()> {
        self.send(Command::Enable {
            device,
            axis,
            enable,
        })
    }

    /// Queue a position query. The reply arrives on the position topic.
    pub fn get_position(&self, device: DeviceCode, axis: Axis) -> Result<()> {
        self.send(Command::GetPosition { device, axis })
    }

    /// Enable or disable an axis and add or remove it from background
    /// position polling.
    pub fn set_axis_enable(&self, device: DeviceCode, axis: Axis, enable: bool) -> Result<()> {
        self.enable(device, axis, enable)?;
        if enable {
            self.polls.enable(device, axis);
        } else {
            self.polls.disable(device, axis);
        }
        Ok(())
    }

    /// Confirm a position through the shared [`ResponseWaiter`].
    pub async fn wait_for_position(
        &self,
        device: DeviceCode,
        axis: Axis,
        target_um: u16,
        params: WaitParams,
    ) -> Result<WaitOutcome> {
        self.waiter
            .wait_for_position(device, axis, target_um, params)
            .await
    }

    /// Last logical position of `device`, [`GridPos::UNSET`] if never set.
    pub fn position(&self, device: DeviceCode) -> GridPos {
        self.positions
            .lock()
            .get(&device)
            .copied()
            .unwrap_or(GridPos::UNSET)
    }

    /// Overwrite the logical position of `device`.
    pub fn set_position(&self, device: DeviceCode, pos: GridPos) {
        self.positions.lock().insert(device, pos);
    }

    // =========================================================================
    // Pump controller
    // =========================================================================

    /// Switch periodic pressure and flow queries on or off.
    pub fn set_telemetry_enabled(&self, enabled: bool) {
        self.telemetry.set(enabled);
    }

    /// Whether pressure and flow are polled.
    pub fn telemetry_enabled(&self) -> bool {
        self.telemetry.is_enabled()
    }

    /// Start the pneumatic pump.
    pub fn start_pump(&self, speed: u16) -> Result<()> {
        self.send(Command::StartPump { speed })
    }

    /// Stop the pneumatic pump.
    pub fn stop_pump(&self) -> Result<()> {
        self.send(Command::StopPump)
    }

    /// Pressure setpoint; the frame goes out three times.
    pub fn set_pressure(&self, pressure: u16) -> Result<()> {
        self.send(Command::SetPressure { pressure })
    }

    /// Flow setpoint; the frame goes out three times.
    pub fn set_flow(&self, flow: u16) -> Result<()> {
        self.send(Command::SetFlow { flow })
    }

    /// Queue a pressure query.
    pub fn get_pressure(&self) -> Result<()> {
        self.send(Command::GetPressure)
    }

    /// Queue a flow query.
    pub fn get_flow(&self) -> Result<()> {
        self.send(Command::GetFlow)
    }

    /// Start or stop the controller peristaltic pump.
    pub fn peristaltic_rotate(&self, start: bool) -> Result<()> {
        self.send(Command::PeristalticRotate { start })
    }

    /// Controller peristaltic pump speed.
    pub fn peristaltic_set_speed(&self, speed: u16) -> Result<()> {
        self.send(Command::PeristalticSetSpeed { speed })
    }

    /// One bit per solenoid valve, set bits open.
    pub fn set_solenoid_valves(&self, mask: u8) -> Result<()> {
        self.send(Command::SetSolenoidValves { mask })
    }

    // =========================================================================
    // Stops
    // =========================================================================

    /// Abort motion: set the emergency flag, drop the backlog, disable X and
    /// Y on both stages and stop polling them.
    pub fn emergency_stop(&self) {
        self.cancel.trigger_emergency();
        let discarded = self.queue.clear();
        for device in STAGES {
            for axis in [Axis::X, Axis::Y] {
                self.queue.push_command(Command::Enable {
                    device,
                    axis,
                    enable: false,
                });
                self.polls.disable(device, axis);
            }
        }
        warn!(discarded, "emergency stop");
        self.events.emergency();
        self.events.message("! emergency stop triggered !");
    }

    /// Full shutdown: set the stop flag, discard the backlog and stop both
    /// pipette pumps.
    ///
    /// The pump stops are queued [`STOP_SETTLE`] apart. Anything else queued
    /// while they wait is discarded; the stops themselves always go out.
    /// The stop flag stays set until [`CancellationToken::clear_stop`].
    #[instrument(skip(self))]
    pub async fn stop_all_devices(&self) {
        self.cancel.request_stop();
        let discarded = self.queue.clear();
        info!(discarded, "stopping all devices");
        self.events.message("stopping all devices");

        let mut stops = Vec::with_capacity(2);
        for id in [INBOUND_PUMP_ID, OUTBOUND_PUMP_ID] {
            let stop = Command::Rotate {
                id,
                start: false,
                forward: true,
            };
            stops.push(stop.to_frame());
            self.queue.push_command(stop);
            tokio::time::sleep(STOP_SETTLE).await;
        }

        let late = self.queue.retain(|frame| stops.contains(frame));
        if late > 0 {
            info!(late, "discarded frames queued during stop");
        }
        self.events.message("all devices stopped");
    }

    /// Wait until the transport has written every queued frame, at most
    /// `limit`. Returns whether the queue emptied.
    pub async fn flush(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while !self.queue.is_empty() {
            if !self.is_open() || tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.dispatch_interval.min(limit)).await;
        }
        true
    }
}

impl fmt::Debug for Ulab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ulab")
            .field("settings", &self.settings)
            .field("baud_rate", &self.baud_rate)
            .field("backlog", &self.queue.len())
            .field("open", &self.is_open())
            .finish()
    }
}
