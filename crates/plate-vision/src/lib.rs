//! Plate-Vision: from camera frame to plate text
//!
//! ## Key Components
//!
//! - `FrameSource`: file snapshots, request bytes, ffmpeg/command grabs,
//!   strided reads from recorded video
//! - `PerceptionPipeline`: vehicle classifier gate, then plate localizer and crops
//! - `TextExtractionEnsemble`: preprocessing, two OCR backends, arbitration
//! - `command`: bounded external-program runner used by the command backends
//! - `fakes`: scripted detectors, recognizers and frame sources for tests

pub mod command;
mod detection;
mod ensemble;
mod error;
pub mod fakes;
mod frame;
mod ocr;
mod perception;
pub mod preprocess;
mod video;

pub use command::CommandSpec;
pub use detection::{BoundingBox, CommandDetector, Detection, ObjectDetector};
pub use ensemble::{
    arbitrate, clean_plate_text, BackendSlot, EnsembleConfig, RecognizedText,
    TextExtractionEnsemble,
};
pub use error::{VisionError, VisionResult};
pub use frame::{
    CommandFrameSource, EncodedFrameSource, Frame, FrameSource, FrameSourceConfig,
    ImageFileSource,
};
pub use ocr::{
    BackendId, CommandRecognizer, RawText, RecognizerConfig, TesseractRecognizer,
    TextRecognizer, PLATE_ALPHABET,
};
pub use perception::{PerceptionConfig, PerceptionPipeline, PlateCandidate, DEFAULT_VEHICLE_CLASSES};
pub use preprocess::PreprocessConfig;
pub use video::{parse_frame_rate, VideoFileSource};
