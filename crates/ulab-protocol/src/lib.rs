//! `ulab-protocol`
//!
//! Wire format of the liquid-handling instrument: fixed 8-byte frames with a
//! table-driven CRC-16/MODBUS checksum, the opcode families of each device,
//! and classification of inbound replies.
//!
//! This crate does no I/O. Transmission and timing live in `ulab-hardware`.
//!
//! # Example
//!
//! ```
//! use ulab_protocol::{Axis, Command, DeviceCode, FrameCodec, Reply};
//!
//! let frame = Command::Goto { device: DeviceCode::LowStage, axis: Axis::X, position_um: 4500 }
//!     .to_frame();
//! assert_eq!(frame.as_bytes(), &[0xFE, 0x02, 0x02, 0x11, 0x94, 0x53, 0xA0, 0xFF]);
//!
//! let mut codec = FrameCodec::new();
//! codec.extend(frame.as_ref());
//! let decoded = codec.drain_frames();
//! assert_eq!(decoded, vec![frame]);
//! assert_eq!(Reply::classify(&decoded[0]), None);
//! ```

pub mod codec;
pub mod command;
pub mod crc;
pub mod frame;

pub use codec::{scan, FrameCodec, Scan};
pub use command::{op, stage_op, Axis, Command, DeviceCode, Reply, SETPOINT_REPEAT};
pub use frame::{Frame, FrameError, END, FRAME_LEN, START};

/// Serial line settings of the instrument: 115200 baud, 8N1.
pub const BAUD_RATE: u32 = 115_200;
