//! Scripted detectors, recognizers and frame sources (testing only)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use image::{GrayImage, Rgb, RgbImage};

use crate::detection::{BoundingBox, Detection, ObjectDetector};
use crate::error::{VisionError, VisionResult};
use crate::frame::{Frame, FrameSource};
use crate::ocr::{BackendId, RawText, TextRecognizer};

/// Mid-grey test frame.
pub fn test_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

/// Detection helper for scripting.
pub fn detection(class_id: u32, confidence: f32, bbox: [f32; 4]) -> Detection {
    Detection {
        bbox: BoundingBox::from(bbox),
        class_id,
        label: None,
        confidence,
    }
}

// ---------------------------------------------------------------------------
// ScriptedDetector
// ---------------------------------------------------------------------------

/// Returns the same detections for every frame, or always fails.
pub struct ScriptedDetector {
    name: String,
    detections: Option<Vec<Detection>>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(name: impl Into<String>, detections: Vec<Detection>) -> Self {
        Self {
            name: name.into(),
            detections: Some(detections),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detections: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectDetector for ScriptedDetector {
    async fn detect(&self, _image: &RgbImage) -> VisionResult<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.detections
            .clone()
            .ok_or_else(|| VisionError::MalformedOutput {
                backend: self.name.clone(),
                reason: "scripted failure".to_string(),
            })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// ScriptedRecognizer
// ---------------------------------------------------------------------------

/// One scripted recognizer reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(RawText),
    Nothing,
    Fail,
}

/// Replays replies in order; once exhausted, repeats the last one.
pub struct ScriptedRecognizer {
    id: BackendId,
    replies: Mutex<VecDeque<Reply>>,
    last: Mutex<Reply>,
    calls: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new(id: impl Into<String>, replies: Vec<Reply>) -> Self {
        Self {
            id: BackendId::new(id),
            replies: Mutex::new(replies.into()),
            last: Mutex::new(Reply::Nothing),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answers `text` with `confidence`.
    pub fn always(id: impl Into<String>, text: &str, confidence: Option<f32>) -> Self {
        Self::new(id, vec![Reply::Text(RawText::new(text, confidence))])
    }

    pub fn silent(id: impl Into<String>) -> Self {
        Self::new(id, vec![Reply::Nothing])
    }

    pub fn failing(id: impl Into<String>) -> Self {
        Self::new(id, vec![Reply::Fail])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextRecognizer for ScriptedRecognizer {
    fn id(&self) -> BackendId {
        self.id.clone()
    }

    async fn recognize(&self, _image: &GrayImage) -> VisionResult<Option<RawText>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = {
            let mut last = self.last.lock().unwrap();
            match self.replies.lock().unwrap().pop_front() {
                Some(reply) => {
                    *last = reply.clone();
                    reply
                }
                None => last.clone(),
            }
        };
        match reply {
            Reply::Text(raw) => Ok(Some(raw)),
            Reply::Nothing => Ok(None),
            Reply::Fail => Err(VisionError::Timeout {
                program: self.id.to_string(),
                timeout_ms: 0,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedFrameSource
// ---------------------------------------------------------------------------

/// Yields scripted frames; `None` entries are read failures. Once the script
/// is exhausted every read fails.
pub struct ScriptedFrameSource {
    frames: Mutex<VecDeque<Option<RgbImage>>>,
    sequence: AtomicU64,
    reads: AtomicUsize,
}

impl ScriptedFrameSource {
    pub fn new(frames: Vec<Option<RgbImage>>) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            sequence: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// `count` identical frames.
    pub fn repeat(image: RgbImage, count: usize) -> Self {
        Self::new(vec![Some(image); count])
    }

    pub fn unavailable() -> Self {
        Self::new(Vec::new())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn next_frame(&self) -> VisionResult<Frame> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let next = self.frames.lock().unwrap().pop_front().flatten();
        match next {
            Some(image) => Ok(Frame::new(image, self.sequence.fetch_add(1, Ordering::SeqCst))),
            None => Err(VisionError::FrameUnavailable {
                source_name: self.describe(),
                reason: "no scripted frame".to_string(),
            }),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
