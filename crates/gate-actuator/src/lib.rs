//! Gate-Actuator: acknowledged control of a physical barrier
//!
//! Drives a barrier controller (typically a microcontroller on a serial
//! port) with short open/close commands and waits for the controller to
//! acknowledge each one before believing the gate moved.
//!
//! ## Key Components
//!
//! - `GateActuator`: serialized command exchange, retry/reconnect, auto-close
//! - `GateChannel` / `ChannelConnector`: transport seam (serial device, TCP bridge)
//! - `CommandProtocol`: line (`OPEN\n`) or single-byte (`1`/`0`) encoding
//! - `fakes::FakeGateHardware`: in-memory controller for tests

mod actuator;
mod channel;
mod error;
pub mod fakes;
mod protocol;

pub use actuator::{ActuatorConfig, GateActuator, GateState, HardwareMessage};
pub use channel::{
    ChannelConnector, GateChannel, LineChannel, LinkConfig, SerialDeviceConnector, TcpConnector,
};
pub use error::{GateError, GateResult, LinkError, LinkResult};
pub use protocol::{acknowledges, Command, CommandKind, CommandProtocol, ControlLine};
