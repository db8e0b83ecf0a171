//! Two-stage perception against scripted detectors.

use std::sync::Arc;

use plate_vision::fakes::{detection, test_image, ScriptedDetector};
use plate_vision::{Frame, PerceptionConfig, PerceptionPipeline, VisionError};

fn frame() -> Frame {
    Frame::new(test_image(200, 100), 0)
}

#[tokio::test]
async fn test_no_vehicle_skips_plate_localizer() {
    // A person (class 0) only.
    let vehicles = Arc::new(ScriptedDetector::new("coco", vec![detection(0, 0.97, [0.0, 0.0, 50.0, 90.0])]));
    let plates = Arc::new(ScriptedDetector::new("plates", vec![detection(0, 0.9, [10.0, 10.0, 60.0, 30.0])]));
    let pipeline = PerceptionPipeline::new(vehicles.clone(), plates.clone(), PerceptionConfig::default());

    let candidates = pipeline.detect(&frame()).await.unwrap();
    assert!(candidates.is_empty());
    assert_eq!(vehicles.calls(), 1);
    assert_eq!(plates.calls(), 0);
}

#[tokio::test]
async fn test_vehicle_below_threshold_counts_as_absent() {
    let vehicles = Arc::new(ScriptedDetector::new("coco", vec![detection(2, 0.3, [0.0, 0.0, 50.0, 50.0])]));
    let plates = Arc::new(ScriptedDetector::new("plates", vec![detection(0, 0.9, [10.0, 10.0, 60.0, 30.0])]));
    let pipeline = PerceptionPipeline::new(vehicles, plates.clone(), PerceptionConfig::default());

    assert!(pipeline.detect(&frame()).await.unwrap().is_empty());
    assert_eq!(plates.calls(), 0);
}

#[tokio::test]
async fn test_vehicle_exactly_at_threshold_counts_as_absent() {
    let vehicles = Arc::new(ScriptedDetector::new("coco", vec![detection(2, 0.5, [0.0, 0.0, 50.0, 50.0])]));
    let plates = Arc::new(ScriptedDetector::new("plates", vec![detection(0, 0.9, [10.0, 10.0, 60.0, 30.0])]));
    let pipeline = PerceptionPipeline::new(vehicles, plates.clone(), PerceptionConfig::default());

    assert!(pipeline.detect(&frame()).await.unwrap().is_empty());
    assert_eq!(plates.calls(), 0);
}

#[tokio::test]
async fn test_plate_crops_are_clamped_filtered_and_ordered() {
    let vehicles = Arc::new(ScriptedDetector::new("coco", vec![detection(2, 0.9, [0.0, 0.0, 200.0, 100.0])]));
    let plates = Arc::new(ScriptedDetector::new(
        "plates",
        vec![
            detection(0, 0.8, [150.0, 60.0, 260.0, 120.0]),
            detection(0, 0.4, [10.0, 10.0, 40.0, 20.0]),
            detection(0, 0.7, [300.0, 10.0, 340.0, 20.0]),
            detection(0, 0.6, [10.0, 10.0, 40.0, 20.0]),
        ],
    ));
    let pipeline = PerceptionPipeline::new(vehicles, plates, PerceptionConfig::default());

    let candidates = pipeline.detect(&frame()).await.unwrap();
    assert_eq!(candidates.len(), 2);
    // Clamped to the right/bottom edges.
    assert_eq!(candidates[0].crop.dimensions(), (50, 40));
    assert_eq!(candidates[1].crop.dimensions(), (30, 10));
    assert!((candidates[1].detection.confidence - 0.6).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_detector_errors_surface() {
    let vehicles = Arc::new(ScriptedDetector::failing("coco"));
    let plates = Arc::new(ScriptedDetector::new("plates", Vec::new()));
    let pipeline = PerceptionPipeline::new(vehicles, plates, PerceptionConfig::default());

    let err = pipeline.detect(&frame()).await.unwrap_err();
    assert!(matches!(err, VisionError::MalformedOutput { .. }));
}

#[tokio::test]
async fn test_custom_vehicle_classes() {
    let config = PerceptionConfig {
        vehicle_classes: vec![1],
        ..Default::default()
    };
    let vehicles = Arc::new(ScriptedDetector::new("coco", vec![detection(1, 0.8, [0.0, 0.0, 10.0, 10.0])]));
    let plates = Arc::new(ScriptedDetector::new("plates", vec![detection(0, 0.9, [0.0, 0.0, 20.0, 10.0])]));
    let pipeline = PerceptionPipeline::new(vehicles, plates, config);

    assert_eq!(pipeline.detect(&frame()).await.unwrap().len(), 1);
}
