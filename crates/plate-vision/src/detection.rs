//! Object detections and detector backends.

use async_trait::async_trait;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{run_command, write_temp_png, CommandSpec};
use crate::error::{VisionError, VisionResult};

/// Axis-aligned box in pixel coordinates, `x1,y1` top-left, `x2,y2` bottom-right.
///
/// Serialized as `[x1, y1, x2, y2]`, the layout detector wrappers print.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Integer crop rectangle `(x, y, width, height)` clamped to a
    /// `width`×`height` frame, or `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if !(self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite())
        {
            return None;
        }
        let clamp = |v: f32, max: u32| v.max(0.0).min(max as f32);
        let x1 = clamp(self.x1.min(self.x2).floor(), width) as u32;
        let y1 = clamp(self.y1.min(self.y2).floor(), height) as u32;
        let x2 = clamp(self.x1.max(self.x2).ceil(), width) as u32;
        let y2 = clamp(self.y1.max(self.y2).ceil(), height) as u32;
        let (w, h) = (x2.saturating_sub(x1), y2.saturating_sub(y1));
        (w > 0 && h > 0).then_some((x1, y1, w, h))
    }
}

/// One detector output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub confidence: f32,
}

/// A model that finds objects in a frame.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, image: &RgbImage) -> VisionResult<Vec<Detection>>;

    fn name(&self) -> &str;
}

/// Detector implemented by an external program.
///
/// The frame is written to a temporary PNG whose path is passed to the
/// program; stdout must be a JSON array of
/// `{"bbox": [x1, y1, x2, y2], "class_id": n, "label": "car", "confidence": 0.9}`.
pub struct CommandDetector {
    name: String,
    spec: CommandSpec,
}

impl CommandDetector {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    /// Parse a detector's JSON stdout.
    pub fn parse_output(&self, stdout: &str) -> VisionResult<Vec<Detection>> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed).map_err(|err| VisionError::MalformedOutput {
            backend: self.name.clone(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl ObjectDetector for CommandDetector {
    async fn detect(&self, image: &RgbImage) -> VisionResult<Vec<Detection>> {
        let input = write_temp_png(DynamicImage::ImageRgb8(image.clone())).await?;
        let output = run_command(&self.spec, Some(input.path())).await?;
        let detections = self.parse_output(&output.stdout_text())?;
        debug!(detector = %self.name, count = detections.len(), duration_ms = output.duration_ms, "detector finished");
        Ok(detections)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_inside_frame() {
        let b = BoundingBox::new(10.2, 20.0, 30.7, 40.0);
        assert_eq!(b.clamp_to(100, 100), Some((10, 20, 21, 20)));
    }

    #[test]
    fn test_clamp_to_frame_edges() {
        let b = BoundingBox::new(-5.0, -5.0, 120.0, 50.0);
        assert_eq!(b.clamp_to(100, 80), Some((0, 0, 100, 50)));
    }

    #[test]
    fn test_clamp_outside_frame_is_none() {
        let b = BoundingBox::new(150.0, 10.0, 200.0, 20.0);
        assert_eq!(b.clamp_to(100, 100), None);
        let degenerate = BoundingBox::new(5.0, 5.0, 5.0, 30.0);
        assert_eq!(degenerate.clamp_to(100, 100), None);
    }

    #[test]
    fn test_clamp_swapped_corners() {
        let b = BoundingBox::new(30.0, 40.0, 10.0, 20.0);
        assert_eq!(b.clamp_to(100, 100), Some((10, 20, 20, 20)));
    }

    #[test]
    fn test_parse_detector_output() {
        let detector = CommandDetector::new("yolo", CommandSpec::new("true", vec![]));
        let dets = detector
            .parse_output(
                r#"[{"bbox":[1,2,30,40],"class_id":2,"label":"car","confidence":0.91},
                    {"bbox":[5,5,9,9],"class_id":0,"confidence":0.4}]"#,
            )
            .unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].bbox, BoundingBox::new(1.0, 2.0, 30.0, 40.0));
        assert_eq!(dets[0].label.as_deref(), Some("car"));
        assert_eq!(dets[1].label, None);
    }

    #[test]
    fn test_parse_empty_output_is_no_detections() {
        let detector = CommandDetector::new("yolo", CommandSpec::new("true", vec![]));
        assert!(detector.parse_output("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed_output() {
        let detector = CommandDetector::new("yolo", CommandSpec::new("true", vec![]));
        let err = detector.parse_output("Traceback (most recent call last)").unwrap_err();
        assert!(matches!(err, VisionError::MalformedOutput { .. }));
    }

    #[tokio::test]
    async fn test_command_detector_end_to_end() {
        let spec = CommandSpec::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"test -s "$1" && echo '[{"bbox":[0,0,4,4],"class_id":7,"confidence":0.8}]'"#
                    .to_string(),
                "detector".to_string(),
                "{input}".to_string(),
            ],
        );
        let detector = CommandDetector::new("shell", spec);
        let dets = detector.detect(&RgbImage::new(8, 8)).await.unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 7);
    }
}
