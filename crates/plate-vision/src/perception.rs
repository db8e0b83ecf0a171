//! Two-stage perception: vehicle presence, then plate localization.

use std::sync::Arc;

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detection::{Detection, ObjectDetector};
use crate::error::VisionResult;
use crate::frame::Frame;

/// COCO car, motorcycle, bus, truck.
pub const DEFAULT_VEHICLE_CLASSES: [u32; 4] = [2, 3, 5, 7];

/// Perception thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerceptionConfig {
    pub vehicle_classes: Vec<u32>,
    pub vehicle_confidence: f32,
    pub plate_confidence: f32,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            vehicle_classes: DEFAULT_VEHICLE_CLASSES.to_vec(),
            vehicle_confidence: 0.5,
            plate_confidence: 0.5,
        }
    }
}

impl PerceptionConfig {
    /// Check thresholds are probabilities and at least one vehicle class is set.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("vehicle_confidence", self.vehicle_confidence),
            ("plate_confidence", self.plate_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} must be within 0..=1, got {value}"));
            }
        }
        if self.vehicle_classes.is_empty() {
            return Err("vehicle_classes must not be empty".to_string());
        }
        Ok(())
    }
}

/// A localized plate region cut out of a frame.
#[derive(Debug, Clone)]
pub struct PlateCandidate {
    pub detection: Detection,
    pub crop: RgbImage,
}

/// Vehicle classifier + plate localizer.
#[derive(Clone)]
pub struct PerceptionPipeline {
    vehicle_detector: Arc<dyn ObjectDetector>,
    plate_detector: Arc<dyn ObjectDetector>,
    config: PerceptionConfig,
}

impl PerceptionPipeline {
    pub fn new(
        vehicle_detector: Arc<dyn ObjectDetector>,
        plate_detector: Arc<dyn ObjectDetector>,
        config: PerceptionConfig,
    ) -> Self {
        Self {
            vehicle_detector,
            plate_detector,
            config,
        }
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.config
    }

    /// Whether any detection is a vehicle strictly above the vehicle threshold.
    pub fn vehicle_present(&self, detections: &[Detection]) -> bool {
        detections.iter().any(|d| {
            self.config.vehicle_classes.contains(&d.class_id)
                && d.confidence > self.config.vehicle_confidence
        })
    }

    /// Plate candidates in detector order; empty when no vehicle is present.
    ///
    /// The plate localizer only runs once a vehicle has been seen.
    pub async fn detect(&self, frame: &Frame) -> VisionResult<Vec<PlateCandidate>> {
        let vehicles = self.vehicle_detector.detect(&frame.image).await?;
        if !self.vehicle_present(&vehicles) {
            debug!(frame = frame.sequence, detections = vehicles.len(), "no vehicle in frame");
            return Ok(Vec::new());
        }

        let (width, height) = frame.dimensions();
        let plates = self.plate_detector.detect(&frame.image).await?;
        let candidates: Vec<PlateCandidate> = plates
            .into_iter()
            .filter(|d| d.confidence >= self.config.plate_confidence)
            .filter_map(|detection| {
                let Some((x, y, w, h)) = detection.bbox.clamp_to(width, height) else {
                    warn!(frame = frame.sequence, bbox = ?detection.bbox, "plate box outside frame; dropped");
                    return None;
                };
                let crop = imageops::crop_imm(&frame.image, x, y, w, h).to_image();
                Some(PlateCandidate { detection, crop })
            })
            .collect();

        debug!(frame = frame.sequence, candidates = candidates.len(), "plate localization finished");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;

    fn det(class_id: u32, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            class_id,
            label: None,
            confidence,
        }
    }

    fn pipeline() -> PerceptionPipeline {
        let none = Arc::new(crate::fakes::ScriptedDetector::new("none", Vec::new()));
        PerceptionPipeline::new(none.clone(), none, PerceptionConfig::default())
    }

    #[test]
    fn test_vehicle_present_requires_class_and_confidence() {
        let p = pipeline();
        assert!(!p.vehicle_present(&[det(2, 0.5)]));
        assert!(p.vehicle_present(&[det(2, 0.51)]));
        assert!(!p.vehicle_present(&[det(2, 0.49)]));
        // person
        assert!(!p.vehicle_present(&[det(0, 0.99)]));
        assert!(p.vehicle_present(&[det(0, 0.99), det(7, 0.8)]));
    }

    #[test]
    fn test_config_validation() {
        assert!(PerceptionConfig::default().validate().is_ok());
        let bad = PerceptionConfig {
            plate_confidence: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
