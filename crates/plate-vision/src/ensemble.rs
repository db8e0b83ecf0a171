//! Two-backend plate reading with confidence arbitration.

use std::sync::Arc;

use image::GrayImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{VisionError, VisionResult};
use crate::ocr::{BackendId, RawText, TextRecognizer};
use crate::perception::PlateCandidate;
use crate::preprocess::{preprocess, to_gray, PreprocessConfig};

/// Cleaned, accepted plate text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedText {
    pub text: String,
    pub backend: BackendId,
    pub confidence: Option<f32>,
}

/// Upper-case and keep only alphanumerics.
pub fn clean_plate_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// One backend plus whether it retries on the unprocessed crop.
#[derive(Clone)]
pub struct BackendSlot {
    pub recognizer: Arc<dyn TextRecognizer>,
    pub raw_fallback: bool,
}

impl BackendSlot {
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self {
            recognizer,
            raw_fallback: false,
        }
    }

    pub fn with_raw_fallback(mut self) -> Self {
        self.raw_fallback = true;
        self
    }
}

/// Acceptance rules and preprocessing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnsembleConfig {
    pub min_length: usize,
    /// Regex the cleaned text must match (e.g. `^[A-Z]{2}[0-9]{2}[A-Z]{1,2}[0-9]{4}$`).
    pub plate_pattern: Option<String>,
    pub preprocess: PreprocessConfig,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            min_length: 3,
            plate_pattern: None,
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl EnsembleConfig {
    /// Reject a zero minimum length or a pattern that does not compile.
    pub fn validate(&self) -> VisionResult<()> {
        if self.min_length == 0 {
            return Err(VisionError::InvalidConfig(
                "min_length must be at least 1".to_string(),
            ));
        }
        if let Some(pattern) = &self.plate_pattern {
            Regex::new(pattern)?;
        }
        Ok(())
    }
}

/// Reads plate candidates with a primary and a secondary backend.
pub struct TextExtractionEnsemble {
    primary: BackendSlot,
    secondary: BackendSlot,
    min_length: usize,
    pattern: Option<Regex>,
    preprocess: PreprocessConfig,
}

impl TextExtractionEnsemble {
    pub fn new(primary: BackendSlot, secondary: BackendSlot, config: EnsembleConfig) -> VisionResult<Self> {
        let pattern = config.plate_pattern.as_deref().map(Regex::new).transpose()?;
        Ok(Self {
            primary,
            secondary,
            min_length: config.min_length,
            pattern,
            preprocess: config.preprocess,
        })
    }

    /// Clean `raw` and apply the acceptance rules.
    pub fn accept(&self, raw: RawText, backend: &BackendId) -> Option<RecognizedText> {
        let text = clean_plate_text(&raw.text);
        if text.chars().count() < self.min_length {
            debug!(%backend, raw = %raw.text, "text too short; rejected");
            return None;
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&text) {
                debug!(%backend, text = %text, "text does not match plate pattern; rejected");
                return None;
            }
        }
        Some(RecognizedText {
            text,
            backend: backend.clone(),
            confidence: raw.confidence,
        })
    }

    /// Best usable text for `candidate`.
    ///
    /// `Ok(None)` when the backends ran but nothing passed the acceptance
    /// rules; `Err` only when every backend failed to run or preprocessing
    /// could not finish.
    pub async fn read(&self, candidate: &PlateCandidate) -> VisionResult<Option<RecognizedText>> {
        let crop = candidate.crop.clone();
        let config = self.preprocess.clone();
        let (processed, raw_gray) =
            tokio::task::spawn_blocking(move || (preprocess(&crop, &config), to_gray(&crop)))
                .await
                .map_err(|err| VisionError::Worker(err.to_string()))?;

        let (primary, secondary) = futures::join!(
            self.run_slot(&self.primary, &processed, &raw_gray),
            self.run_slot(&self.secondary, &processed, &raw_gray),
        );

        match (primary, secondary) {
            (Err(a), Err(b)) => Err(VisionError::AllBackendsFailed(vec![a.to_string(), b.to_string()])),
            (a, b) => {
                let winner = arbitrate(a.unwrap_or(None), b.unwrap_or(None));
                if let Some(w) = &winner {
                    debug!(backend = %w.backend, text = %w.text, confidence = ?w.confidence, "ensemble selected text");
                }
                Ok(winner)
            }
        }
    }

    async fn run_slot(
        &self,
        slot: &BackendSlot,
        processed: &GrayImage,
        raw_gray: &GrayImage,
    ) -> VisionResult<Option<RecognizedText>> {
        let id = slot.recognizer.id();
        let mut failure = None;
        match slot.recognizer.recognize(processed).await {
            Ok(Some(raw)) => {
                if let Some(text) = self.accept(raw, &id) {
                    return Ok(Some(text));
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(backend = %id, error = %err, "text backend failed on processed crop");
                failure = Some(err);
            }
        }

        if slot.raw_fallback {
            match slot.recognizer.recognize(raw_gray).await {
                Ok(Some(raw)) => return Ok(self.accept(raw, &id)),
                Ok(None) => return Ok(None),
                Err(err) => {
                    warn!(backend = %id, error = %err, "text backend failed on raw crop");
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

/// Pick between two accepted results; `primary` wins exact ties.
pub fn arbitrate(
    primary: Option<RecognizedText>,
    secondary: Option<RecognizedText>,
) -> Option<RecognizedText> {
    match (primary, secondary) {
        (Some(a), Some(b)) => {
            if let (Some(ca), Some(cb)) = (a.confidence, b.confidence) {
                if ca != cb {
                    return Some(if cb > ca { b } else { a });
                }
            }
            if b.text.chars().count() > a.text.chars().count() {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str, backend: &str, conf: Option<f32>) -> RecognizedText {
        RecognizedText {
            text: s.to_string(),
            backend: BackendId::new(backend),
            confidence: conf,
        }
    }

    #[test]
    fn test_clean_plate_text() {
        assert_eq!(clean_plate_text("ab-12 3."), "AB123");
        assert_eq!(clean_plate_text("  "), "");
        assert_eq!(clean_plate_text("kA 01\tx"), "KA01X");
    }

    #[test]
    fn test_arbitrate_prefers_higher_confidence() {
        let winner = arbitrate(
            Some(text("ABC123", "tesseract", Some(0.6))),
            Some(text("ABC12", "easyocr", Some(0.9))),
        )
        .unwrap();
        assert_eq!(winner.backend.as_str(), "easyocr");
    }

    #[test]
    fn test_arbitrate_falls_back_to_length_without_confidence() {
        let winner = arbitrate(
            Some(text("AB12", "tesseract", Some(0.95))),
            Some(text("AB1234", "easyocr", None)),
        )
        .unwrap();
        assert_eq!(winner.text, "AB1234");
    }

    #[test]
    fn test_arbitrate_equal_confidence_uses_length() {
        let winner = arbitrate(
            Some(text("AB12", "tesseract", Some(0.8))),
            Some(text("AB123", "easyocr", Some(0.8))),
        )
        .unwrap();
        assert_eq!(winner.text, "AB123");
    }

    #[test]
    fn test_arbitrate_exact_tie_keeps_primary() {
        let winner = arbitrate(
            Some(text("AB123", "tesseract", None)),
            Some(text("XY789", "easyocr", None)),
        )
        .unwrap();
        assert_eq!(winner.backend.as_str(), "tesseract");
    }

    #[test]
    fn test_arbitrate_single_side() {
        assert_eq!(
            arbitrate(None, Some(text("AB123", "easyocr", None))).unwrap().text,
            "AB123"
        );
        assert!(arbitrate(None, None).is_none());
    }
}
