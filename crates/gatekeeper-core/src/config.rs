//! Aggregate configuration.
//!
//! One JSON document describes the whole installation. Every section has
//! defaults matching the reference deployment (webcam, YOLO wrappers,
//! tesseract + EasyOCR, registry on port 5000, controller on `/dev/ttyACM0`).
//! Two environment variables override the site-specific parts:
//!
//! - `GATEKEEPER_REGISTRY_URL`: HTTP registry base URL
//! - `GATEKEEPER_GATE_DEVICE`: serial device path, or `tcp://host:port`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gate_actuator::{ActuatorConfig, GateActuator, LinkConfig};
use plate_vision::{
    BackendSlot, CommandDetector, CommandSpec, EnsembleConfig, FrameSource, FrameSourceConfig,
    PerceptionConfig, PerceptionPipeline, RecognizerConfig, TextExtractionEnsemble,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::authorization::{AuthorizationConfig, PlateAuthorizer};
use crate::control_loop::{ControlLoop, LoopConfig};
use crate::error::{GatekeeperError, GatekeeperResult};

pub const ENV_REGISTRY_URL: &str = "GATEKEEPER_REGISTRY_URL";
pub const ENV_GATE_DEVICE: &str = "GATEKEEPER_GATE_DEVICE";

/// An external detector program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectorConfig {
    pub name: String,
    pub command: CommandSpec,
}

impl DetectorConfig {
    fn yolo(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            command: CommandSpec::new(
                "gatekeeper-yolo",
                vec!["--model".to_string(), model.to_string(), "{input}".to_string()],
            ),
        }
    }
}

/// One ensemble slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OcrSlotConfig {
    pub backend: RecognizerConfig,
    #[serde(default)]
    pub raw_fallback: bool,
}

fn default_secondary_ocr() -> OcrSlotConfig {
    OcrSlotConfig {
        backend: RecognizerConfig::Command {
            name: "easyocr".to_string(),
            command: CommandSpec::new("gatekeeper-easyocr", vec!["{input}".to_string()]),
        },
        raw_fallback: true,
    }
}

/// Whole-installation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatekeeperConfig {
    pub frame_source: FrameSourceConfig,
    pub vehicle_detector: DetectorConfig,
    pub plate_detector: DetectorConfig,
    pub perception: PerceptionConfig,
    pub primary_ocr: OcrSlotConfig,
    pub secondary_ocr: OcrSlotConfig,
    pub ensemble: EnsembleConfig,
    pub authorization: AuthorizationConfig,
    pub link: LinkConfig,
    pub actuator: ActuatorConfig,
    pub control: LoopConfig,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            frame_source: FrameSourceConfig::default(),
            vehicle_detector: DetectorConfig::yolo("vehicle", "yolov8n.pt"),
            plate_detector: DetectorConfig::yolo("plate", "license_plate_detector.pt"),
            perception: PerceptionConfig::default(),
            primary_ocr: OcrSlotConfig {
                backend: RecognizerConfig::default(),
                raw_fallback: false,
            },
            secondary_ocr: default_secondary_ocr(),
            ensemble: EnsembleConfig::default(),
            authorization: AuthorizationConfig::default(),
            link: LinkConfig::default(),
            actuator: ActuatorConfig::default(),
            control: LoopConfig::default(),
        }
    }
}

impl GatekeeperConfig {
    /// Read a JSON config file, apply environment overrides, validate.
    pub fn load(path: &Path) -> GatekeeperResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            GatekeeperError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> GatekeeperResult<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_REGISTRY_URL).filter(|v| !v.trim().is_empty()) {
            self.authorization = AuthorizationConfig::Http {
                base_url: url.trim().to_string(),
            };
        }
        if let Some(device) = lookup(ENV_GATE_DEVICE).filter(|v| !v.trim().is_empty()) {
            self.link = link_from_device(device.trim());
        }
    }

    pub fn validate(&self) -> GatekeeperResult<()> {
        self.control.validate()?;
        self.perception.validate().map_err(GatekeeperError::Config)?;
        self.ensemble.validate()?;
        if self.actuator.max_attempts == 0 {
            return Err(GatekeeperError::Config("actuator.max_attempts must be at least 1".into()));
        }
        for detector in [&self.vehicle_detector, &self.plate_detector] {
            if detector.command.program.trim().is_empty() {
                return Err(GatekeeperError::Config(format!(
                    "detector '{}' has an empty program",
                    detector.name
                )));
            }
        }
        Ok(())
    }

    pub fn build_frame_source(&self) -> Arc<dyn FrameSource> {
        self.frame_source.build()
    }

    pub fn build_perception(&self) -> PerceptionPipeline {
        let vehicle = Arc::new(CommandDetector::new(
            self.vehicle_detector.name.clone(),
            self.vehicle_detector.command.clone(),
        ));
        let plate = Arc::new(CommandDetector::new(
            self.plate_detector.name.clone(),
            self.plate_detector.command.clone(),
        ));
        PerceptionPipeline::new(vehicle, plate, self.perception.clone())
    }

    pub fn build_ensemble(&self) -> GatekeeperResult<TextExtractionEnsemble> {
        let slot = |cfg: &OcrSlotConfig| BackendSlot {
            recognizer: cfg.backend.build(),
            raw_fallback: cfg.raw_fallback,
        };
        Ok(TextExtractionEnsemble::new(
            slot(&self.primary_ocr),
            slot(&self.secondary_ocr),
            self.ensemble.clone(),
        )?)
    }

    pub fn build_authorizer(&self) -> GatekeeperResult<Arc<dyn PlateAuthorizer>> {
        self.authorization.build()
    }

    /// Connect the actuator; an absent controller leaves it degraded, not failed.
    pub async fn build_gate(&self) -> GateActuator {
        GateActuator::connect(self.actuator.clone(), self.link.connector()).await
    }

    pub async fn build_control_loop(&self) -> GatekeeperResult<ControlLoop> {
        Ok(ControlLoop::new(
            self.build_perception(),
            Arc::new(self.build_ensemble()?),
            self.build_authorizer()?,
            self.build_gate().await,
            self.control.clone(),
        ))
    }
}

/// `tcp://host:port` selects the network bridge; anything else is a device path.
fn link_from_device(device: &str) -> LinkConfig {
    match device.strip_prefix("tcp://") {
        Some(addr) => LinkConfig::Tcp {
            addr: addr.to_string(),
            connect_timeout_ms: 2000,
            settle_ms: 0,
        },
        None => LinkConfig::Serial {
            path: PathBuf::from(device),
            settle_ms: 2000,
        },
    }
}
