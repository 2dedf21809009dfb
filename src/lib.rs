//! # uLab
//!
//! Application crate for the uLab liquid handler. The instrument itself is
//! driven by the workspace crates:
//!
//! - `ulab-protocol`: frame layout, CRC and command encoding
//! - `ulab-core`: errors, cancellation, operator messages and serial helpers
//! - `ulab-hardware`: the [`Ulab`](ulab_hardware::Ulab) engine, its command
//!   queue and the serial transport
//! - `ulab-experiment`: motion and liquid sequences, the operator gate and
//!   protocol files
//!
//! This crate adds what the `ulab` binary needs on top:
//!
//! - [`config`]: Figment-backed configuration
//! - [`logging`]: tracing subscriber setup
//! - [`app`]: session wiring between the port, stdin and a protocol run

pub mod app;
pub mod config;
pub mod logging;
