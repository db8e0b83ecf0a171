//! Gatekeeper-Core: camera-driven access control for one gate
//!
//! Ties the vision layer and the actuator together.
//!
//! ## Key Components
//!
//! - `ControlLoop`: frame → perception → plate text → authorization → gate
//! - `PlateAuthorizer`: HTTP registry client and static allow-list, fail-closed
//! - `GatekeeperConfig`: one JSON document for the installation, env overrides
//! - `telemetry` / `obs` / `metrics`: tracing setup, structured events, counters

pub mod authorization;
pub mod config;
pub mod control_loop;
mod error;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod telemetry;

pub use authorization::{
    AuthorizationConfig, AuthorizationResult, HttpRegistryClient, PlateAuthorizer, StaticRegistry,
};
pub use config::{DetectorConfig, GatekeeperConfig, OcrSlotConfig};
pub use control_loop::{CaptureOutcome, ControlLoop, GateCommandResponse, LoopConfig};
pub use error::{GatekeeperError, GatekeeperResult};
pub use telemetry::init_tracing;
