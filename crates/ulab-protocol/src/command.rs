//! Device addressing, typed commands and reply classification.
//!
//! Stage opcodes are offsets from a per-axis base code; pump-controller and
//! pipette opcodes are fixed.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target subsystem of a command, echoed back in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceCode {
    /// Pipette board: peristaltic pumps and selector valves.
    Pipette = 0x01,
    /// Coarse XYZ stage carrying the well plate.
    LowStage = 0x02,
    /// Fine XYZ stage.
    HighStage = 0x03,
    /// Pneumatic controller with its own peristaltic pump and solenoid bank.
    PumpController = 0x04,
}

impl DeviceCode {
    /// Map a raw device byte, `None` for unknown codes.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Pipette),
            0x02 => Some(Self::LowStage),
            0x03 => Some(Self::HighStage),
            0x04 => Some(Self::PumpController),
            _ => None,
        }
    }

    /// Raw device byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the two XYZ stages.
    pub fn is_stage(self) -> bool {
        matches!(self, Self::LowStage | Self::HighStage)
    }
}

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceCode::Pipette => "pipette",
            DeviceCode::LowStage => "low-precision stage",
            DeviceCode::HighStage => "high-precision stage",
            DeviceCode::PumpController => "pump controller",
        };
        write!(f, "{}", label)
    }
}

/// Stage axis, encoded as the base of its opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Axis {
    /// Row axis.
    X = 0x01,
    /// Column axis.
    Y = 0x09,
    /// Vertical axis.
    Z = 0x11,
}

impl Axis {
    /// Every axis, in opcode order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// First opcode of this axis' family.
    pub fn base(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Axis::base`].
    pub fn from_base(base: u8) -> Option<Self> {
        match base {
            0x01 => Some(Self::X),
            0x09 => Some(Self::Y),
            0x11 => Some(Self::Z),
            _ => None,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Axis::X => "AXIS X",
            Axis::Y => "AXIS Y",
            Axis::Z => "AXIS Z",
        };
        write!(f, "{}", label)
    }
}

/// Offsets of the stage opcode family relative to [`Axis::base`].
pub mod stage_op {
    /// Drive the axis to its limit switch.
    pub const HOME: u8 = 0;
    /// Absolute move in µm.
    pub const GOTO: u8 = 1;
    /// Axis speed.
    pub const SET_SPEED: u8 = 2;
    /// Duration of a timed move.
    pub const SET_TIME: u8 = 3;
    /// Start a timed move.
    pub const GO: u8 = 4;
    /// Driver enable; content 0 enables, 1 disables.
    pub const ENABLE: u8 = 5;
    /// Position query, also the opcode of the reply.
    pub const GET_POSITION: u8 = 7;
}

/// Fixed opcodes of the pipette board and pump controller.
pub mod op {
    /// Selector valve channel switch.
    pub const VALVE_GOTO_CHANNEL: u8 = 0x08;
    /// Pipette-board pump speed.
    pub const PIPETTE_SET_SPEED: u8 = 0x09;
    /// Pipette-board pump start/stop.
    pub const PIPETTE_ROTATE: u8 = 0x0A;
    /// Pressure setpoint.
    pub const SET_PRESSURE: u8 = 0x20;
    /// Flow setpoint.
    pub const SET_FLOW: u8 = 0x21;
    /// Flow query and reply.
    pub const GET_FLOW: u8 = 0x23;
    /// Pressure query and reply.
    pub const GET_PRESSURE: u8 = 0x24;
    /// Start the pneumatic pump.
    pub const START_PUMP: u8 = 0x31;
    /// Stop the pneumatic pump.
    pub const STOP_PUMP: u8 = 0x32;
    /// Solenoid bank bitmask.
    pub const SET_SOLENOID_VALVES: u8 = 0x41;
    /// Controller peristaltic pump speed.
    pub const PERISTALTIC_SET_SPEED: u8 = 0x51;
    /// Controller peristaltic pump start/stop.
    pub const PERISTALTIC_ROTATE: u8 = 0x52;
}

/// Setpoint commands the controller may drop; sent this many times.
pub const SETPOINT_REPEAT: usize = 3;

/// Every command the host can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start or stop a pipette-board peristaltic pump.
    Rotate {
        /// Pump id on the board.
        id: u8,
        /// Start when true, stop otherwise.
        start: bool,
        /// Dispensing direction.
        forward: bool,
    },
    /// Pipette-board peristaltic pump speed in device units.
    SetSpeed {
        /// Pump id on the board.
        id: u8,
        /// Device speed units.
        speed: u16,
    },
    /// Switch selector valve `address` on board `id` to `channel`.
    GotoChannel {
        /// Board id.
        id: u8,
        /// Valve address on the board.
        address: u8,
        /// Channel to open.
        channel: u8,
    },
    /// Home one axis.
    Home {
        /// Target stage.
        device: DeviceCode,
        /// Axis to home.
        axis: Axis,
    },
    /// Absolute move, position in µm.
    Goto {
        /// Target stage.
        device: DeviceCode,
        /// Axis to move.
        axis: Axis,
        /// Target position in µm.
        position_um: u16,
    },
    /// Axis speed in units of 0.12 mm/s.
    SetStageSpeed {
        /// Target stage.
        device: DeviceCode,
        /// Axis to configure.
        axis: Axis,
        /// Speed in 0.12 mm/s units.
        speed: u16,
    },
    /// Timed move duration in ms.
    SetTime {
        /// Target stage.
        device: DeviceCode,
        /// Axis to configure.
        axis: Axis,
        /// Duration in ms.
        time_ms: u16,
    },
    /// Start a timed move.
    Go {
        /// Target stage.
        device: DeviceCode,
        /// Axis to move.
        axis: Axis,
        /// Direction of travel.
        forward: bool,
    },
    /// Enable or disable an axis driver.
    Enable {
        /// Target stage.
        device: DeviceCode,
        /// Axis whose driver switches.
        axis: Axis,
        /// Energise when true.
        enable: bool,
    },
    /// Ask for the current position of an axis.
    GetPosition {
        /// Target stage.
        device: DeviceCode,
        /// Axis to query.
        axis: Axis,
    },
    /// Start the pneumatic pump.
    StartPump {
        /// Device speed units.
        speed: u16,
    },
    /// Stop the pneumatic pump.
    StopPump,
    /// Pressure setpoint, repeated on the wire.
    SetPressure {
        /// Device pressure units.
        pressure: u16,
    },
    /// Flow setpoint, repeated on the wire.
    SetFlow {
        /// Device flow units.
        flow: u16,
    },
    /// Ask for the pressure reading.
    GetPressure,
    /// Ask for the flow reading.
    GetFlow,
    /// Start or stop the controller peristaltic pump.
    PeristalticRotate {
        /// Start when true.
        start: bool,
    },
    /// Controller peristaltic pump speed.
    PeristalticSetSpeed {
        /// Device speed units.
        speed: u16,
    },
    /// One bit per solenoid valve.
    SetSolenoidValves {
        /// Bit `n` opens valve `n`.
        mask: u8,
    },
}

impl Command {
    /// Encode into a wire frame.
    pub fn to_frame(self) -> Frame {
        let pump = DeviceCode::PumpController.as_u8();
        match self {
            Command::Rotate { id, start, forward } => Frame::encode(
                op::PIPETTE_ROTATE,
                id,
                if forward { 0x00 } else { 0x01 },
                if start { 0x01 } else { 0x02 },
            ),
            Command::SetSpeed { id, speed } => {
                Frame::with_content(op::PIPETTE_SET_SPEED, id, speed)
            }
            Command::GotoChannel {
                id,
                address,
                channel,
            } => Frame::encode(op::VALVE_GOTO_CHANNEL, id, channel, address),
            Command::Home { device, axis } => {
                Frame::encode(axis.base() + stage_op::HOME, device.as_u8(), 0x00, 0x00)
            }
            Command::Goto {
                device,
                axis,
                position_um,
            } => Frame::with_content(axis.base() + stage_op::GOTO, device.as_u8(), position_um),
            Command::SetStageSpeed {
                device,
                axis,
                speed,
            } => Frame::with_content(axis.base() + stage_op::SET_SPEED, device.as_u8(), speed),
            Command::SetTime {
                device,
                axis,
                time_ms,
            } => Frame::with_content(axis.base() + stage_op::SET_TIME, device.as_u8(), time_ms),
            Command::Go {
                device,
                axis,
                forward,
            } => Frame::encode(
                axis.base() + stage_op::GO,
                device.as_u8(),
                u8::from(forward),
                0x00,
            ),
            Command::Enable {
                device,
                axis,
                enable,
            } => Frame::encode(
                axis.base() + stage_op::ENABLE,
                device.as_u8(),
                if enable { 0x00 } else { 0x01 },
                0x00,
            ),
            // The firmware expects the GOTO opcode of the axis in the content byte.
            Command::GetPosition { device, axis } => Frame::encode(
                axis.base() + stage_op::GET_POSITION,
                device.as_u8(),
                axis.base() + stage_op::GOTO,
                0x00,
            ),
            Command::StartPump { speed } => Frame::with_content(op::START_PUMP, pump, speed),
            Command::StopPump => Frame::encode(op::STOP_PUMP, pump, 0x00, 0x00),
            Command::SetPressure { pressure } => {
                Frame::with_content(op::SET_PRESSURE, pump, pressure)
            }
            Command::SetFlow { flow } => Frame::with_content(op::SET_FLOW, pump, flow),
            Command::GetPressure => Frame::encode(op::GET_PRESSURE, pump, 0x00, 0x00),
            Command::GetFlow => Frame::encode(op::GET_FLOW, pump, 0x00, 0x00),
            Command::PeristalticRotate { start } => {
                Frame::encode(op::PERISTALTIC_ROTATE, pump, u8::from(start), 0x00)
            }
            Command::PeristalticSetSpeed { speed } => {
                Frame::with_content(op::PERISTALTIC_SET_SPEED, pump, speed)
            }
            Command::SetSolenoidValves { mask } => {
                Frame::encode(op::SET_SOLENOID_VALVES, pump, mask, 0x00)
            }
        }
    }

    /// How many copies of the frame go on the wire.
    pub fn repeat(&self) -> usize {
        match self {
            Command::SetPressure { .. } | Command::SetFlow { .. } => SETPOINT_REPEAT,
            _ => 1,
        }
    }
}

/// A decoded device reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Stage position report.
    Position {
        /// Reporting stage.
        device: DeviceCode,
        /// Reported axis.
        axis: Axis,
        /// Position in µm.
        position_um: u16,
    },
    /// Pressure reading in device units.
    Pressure(u16),
    /// Flow reading in device units.
    Flow(u16),
}

impl Reply {
    /// Classify an inbound frame. Frames that carry no telemetry yield `None`.
    pub fn classify(frame: &Frame) -> Option<Self> {
        let device = DeviceCode::from_u8(frame.device_id())?;
        match device {
            DeviceCode::LowStage | DeviceCode::HighStage => {
                let axis = Axis::from_base(frame.opcode().wrapping_sub(stage_op::GET_POSITION))?;
                Some(Reply::Position {
                    device,
                    axis,
                    position_um: frame.content(),
                })
            }
            DeviceCode::PumpController => match frame.opcode() {
                op::GET_PRESSURE => Some(Reply::Pressure(frame.content())),
                op::GET_FLOW => Some(Reply::Flow(frame.content())),
                _ => None,
            },
            DeviceCode::Pipette => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_opcode_offsets() {
        let goto_y = Command::Goto {
            device: DeviceCode::LowStage,
            axis: Axis::Y,
            position_um: 50_000,
        }
        .to_frame();
        assert_eq!(goto_y.opcode(), 0x0A);
        assert_eq!(goto_y.content(), 50_000);

        let get_z = Command::GetPosition {
            device: DeviceCode::HighStage,
            axis: Axis::Z,
        }
        .to_frame();
        assert_eq!(get_z.opcode(), 0x18);
        assert_eq!(get_z.device_id(), 0x03);
        assert_eq!(get_z.content_high(), 0x12);

        let home_x = Command::Home {
            device: DeviceCode::LowStage,
            axis: Axis::X,
        }
        .to_frame();
        assert_eq!(home_x.opcode(), 0x01);
    }

    #[test]
    fn test_rotate_encoding() {
        let frame = Command::Rotate {
            id: 8,
            start: true,
            forward: false,
        }
        .to_frame();
        assert_eq!(
            (frame.opcode(), frame.device_id(), frame.content_high(), frame.content_low()),
            (0x0A, 8, 0x01, 0x01)
        );

        let stop = Command::Rotate {
            id: 1,
            start: false,
            forward: true,
        }
        .to_frame();
        assert_eq!((stop.content_high(), stop.content_low()), (0x00, 0x02));
    }

    #[test]
    fn test_valve_channel_encoding() {
        let frame = Command::GotoChannel {
            id: 1,
            address: 1,
            channel: 6,
        }
        .to_frame();
        assert_eq!(frame.opcode(), 0x08);
        assert_eq!((frame.content_high(), frame.content_low()), (6, 1));
    }

    #[test]
    fn test_setpoints_repeat() {
        assert_eq!(Command::SetPressure { pressure: 10 }.repeat(), 3);
        assert_eq!(Command::SetFlow { flow: 10 }.repeat(), 3);
        assert_eq!(Command::StopPump.repeat(), 1);
    }

    #[test]
    fn test_classify_position_reply() {
        let frame = Frame::with_content(Axis::Y.base() + stage_op::GET_POSITION, 0x02, 45_500);
        assert_eq!(
            Reply::classify(&frame),
            Some(Reply::Position {
                device: DeviceCode::LowStage,
                axis: Axis::Y,
                position_um: 45_500
            })
        );
    }

    #[test]
    fn test_classify_pump_replies() {
        let pressure = Frame::with_content(op::GET_PRESSURE, 0x04, 300);
        let flow = Frame::with_content(op::GET_FLOW, 0x04, 120);
        let other = Frame::with_content(op::START_PUMP, 0x04, 1);
        assert_eq!(Reply::classify(&pressure), Some(Reply::Pressure(300)));
        assert_eq!(Reply::classify(&flow), Some(Reply::Flow(120)));
        assert_eq!(Reply::classify(&other), None);
    }

    #[test]
    fn test_classify_ignores_unknown_axis_and_device() {
        let bad_axis = Frame::with_content(0x30, 0x02, 1);
        let bad_device = Frame::with_content(0x08, 0x09, 1);
        let pipette = Frame::with_content(0x08, 0x01, 1);
        assert_eq!(Reply::classify(&bad_axis), None);
        assert_eq!(Reply::classify(&bad_device), None);
        assert_eq!(Reply::classify(&pipette), None);
    }
}
