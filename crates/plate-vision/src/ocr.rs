//! Text recognition backends.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{run_command, write_temp_png, CommandSpec};
use crate::error::{VisionError, VisionResult};

/// Characters plate readers are allowed to emit.
pub const PLATE_ALPHABET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Stable name of a recognition backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uncleaned backend output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawText {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl RawText {
    pub fn new(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// A text recognition engine.
///
/// `Ok(None)` means the engine ran and found nothing; `Err` means it could
/// not run.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    fn id(&self) -> BackendId;

    async fn recognize(&self, image: &GrayImage) -> VisionResult<Option<RawText>>;
}

// ---------------------------------------------------------------------------
// Tesseract
// ---------------------------------------------------------------------------

fn default_tesseract_program() -> String {
    "tesseract".to_string()
}

fn default_psm() -> u8 {
    7
}

fn default_ocr_timeout_ms() -> u64 {
    5_000
}

/// The `tesseract` CLI in TSV mode, restricted to plate characters.
pub struct TesseractRecognizer {
    spec: CommandSpec,
}

impl TesseractRecognizer {
    /// `psm` 7 treats the crop as a single text line.
    pub fn new(program: impl Into<String>, psm: u8, timeout_ms: u64) -> Self {
        let args = vec![
            "{input}".to_string(),
            "stdout".to_string(),
            "--psm".to_string(),
            psm.to_string(),
            "-c".to_string(),
            format!("tessedit_char_whitelist={PLATE_ALPHABET}"),
            "tsv".to_string(),
        ];
        Self {
            spec: CommandSpec::new(program, args).with_timeout_ms(timeout_ms),
        }
    }

    /// Join recognized words; confidence is the mean word confidence scaled to 0..=1.
    pub fn parse_tsv(tsv: &str) -> Option<RawText> {
        let mut words = Vec::new();
        let mut confidences = Vec::new();
        for line in tsv.lines().skip(1) {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                continue;
            }
            let text = cols[11].trim();
            let Ok(conf) = cols[10].trim().parse::<f32>() else {
                continue;
            };
            if text.is_empty() || conf < 0.0 {
                continue;
            }
            words.push(text.to_string());
            confidences.push(conf);
        }
        if words.is_empty() {
            return None;
        }
        let mean = confidences.iter().sum::<f32>() / confidences.len() as f32;
        Some(RawText::new(words.join(""), Some((mean / 100.0).clamp(0.0, 1.0))))
    }
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self::new(default_tesseract_program(), default_psm(), default_ocr_timeout_ms())
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    fn id(&self) -> BackendId {
        BackendId::new("tesseract")
    }

    async fn recognize(&self, image: &GrayImage) -> VisionResult<Option<RawText>> {
        let input = write_temp_png(DynamicImage::ImageLuma8(image.clone())).await?;
        let output = run_command(&self.spec, Some(input.path())).await?;
        let parsed = Self::parse_tsv(&output.stdout_text());
        debug!(backend = "tesseract", text = ?parsed.as_ref().map(|r| &r.text), "recognized");
        Ok(parsed)
    }
}

// ---------------------------------------------------------------------------
// Generic command backend
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandReply {
    One(RawText),
    Many(Vec<RawText>),
}

/// Any OCR wrapper script (EasyOCR, PaddleOCR, ...) that takes an image path.
///
/// stdout may be `{"text": "...", "confidence": 0.9}`, a JSON list of those
/// (best confidence wins), or plain text with no confidence.
pub struct CommandRecognizer {
    id: BackendId,
    spec: CommandSpec,
}

impl CommandRecognizer {
    pub fn new(id: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            id: BackendId::new(id),
            spec,
        }
    }

    pub fn parse_output(&self, stdout: &str) -> VisionResult<Option<RawText>> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            let first_line = trimmed.lines().next().unwrap_or_default();
            return Ok(Some(RawText::new(first_line.trim(), None)));
        }

        let reply: CommandReply =
            serde_json::from_str(trimmed).map_err(|err| VisionError::MalformedOutput {
                backend: self.id.to_string(),
                reason: err.to_string(),
            })?;
        Ok(match reply {
            CommandReply::One(raw) => Some(raw),
            CommandReply::Many(list) => list.into_iter().max_by(|a, b| {
                let (ca, cb) = (a.confidence.unwrap_or(f32::MIN), b.confidence.unwrap_or(f32::MIN));
                ca.total_cmp(&cb)
            }),
        })
    }
}

#[async_trait]
impl TextRecognizer for CommandRecognizer {
    fn id(&self) -> BackendId {
        self.id.clone()
    }

    async fn recognize(&self, image: &GrayImage) -> VisionResult<Option<RawText>> {
        let input = write_temp_png(DynamicImage::ImageLuma8(image.clone())).await?;
        let output = run_command(&self.spec, Some(input.path())).await?;
        self.parse_output(&output.stdout_text())
    }
}

/// Recognizer selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecognizerConfig {
    Tesseract {
        #[serde(default = "default_tesseract_program")]
        program: String,
        #[serde(default = "default_psm")]
        psm: u8,
        #[serde(default = "default_ocr_timeout_ms")]
        timeout_ms: u64,
    },
    Command {
        name: String,
        command: CommandSpec,
    },
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        RecognizerConfig::Tesseract {
            program: default_tesseract_program(),
            psm: default_psm(),
            timeout_ms: default_ocr_timeout_ms(),
        }
    }
}

impl RecognizerConfig {
    pub fn build(&self) -> Arc<dyn TextRecognizer> {
        match self {
            RecognizerConfig::Tesseract {
                program,
                psm,
                timeout_ms,
            } => Arc::new(TesseractRecognizer::new(program.clone(), *psm, *timeout_ms)),
            RecognizerConfig::Command { name, command } => {
                Arc::new(CommandRecognizer::new(name.clone(), command.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t120\t40\t-1\t
4\t1\t1\t1\t1\t0\t3\t4\t110\t30\t-1\t
5\t1\t1\t1\t1\t1\t3\t4\t50\t30\t90\tABC
5\t1\t1\t1\t1\t2\t60\t4\t50\t30\t80\t123
";

    #[test]
    fn test_parse_tsv_joins_words_and_averages_confidence() {
        let raw = TesseractRecognizer::parse_tsv(TSV).unwrap();
        assert_eq!(raw.text, "ABC123");
        let conf = raw.confidence.unwrap();
        assert!((conf - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_parse_tsv_without_words() {
        let header_only = TSV.lines().take(3).collect::<Vec<_>>().join("\n");
        assert_eq!(TesseractRecognizer::parse_tsv(&header_only), None);
    }

    fn recognizer() -> CommandRecognizer {
        CommandRecognizer::new("easyocr", CommandSpec::new("true", vec![]))
    }

    #[test]
    fn test_command_output_single_object() {
        let raw = recognizer()
            .parse_output(r#"{"text":"ab-123","confidence":0.7}"#)
            .unwrap()
            .unwrap();
        assert_eq!(raw, RawText::new("ab-123", Some(0.7)));
    }

    #[test]
    fn test_command_output_list_takes_best_confidence() {
        let raw = recognizer()
            .parse_output(r#"[{"text":"A8C","confidence":0.4},{"text":"ABC123","confidence":0.92},{"text":"X"}]"#)
            .unwrap()
            .unwrap();
        assert_eq!(raw.text, "ABC123");
    }

    #[test]
    fn test_command_output_plain_text() {
        let raw = recognizer().parse_output("KA01AB1234\n").unwrap().unwrap();
        assert_eq!(raw, RawText::new("KA01AB1234", None));
    }

    #[test]
    fn test_command_output_empty_list_and_blank() {
        assert_eq!(recognizer().parse_output("[]").unwrap(), None);
        assert_eq!(recognizer().parse_output("   ").unwrap(), None);
    }

    #[test]
    fn test_command_output_broken_json() {
        let err = recognizer().parse_output("{\"text\": ").unwrap_err();
        assert!(matches!(err, VisionError::MalformedOutput { .. }));
    }

    #[tokio::test]
    async fn test_command_recognizer_runs_wrapper() {
        let spec = CommandSpec::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"test -s "$1" && echo '{"text":"XYZ789","confidence":0.66}'"#.to_string(),
                "ocr".to_string(),
            ],
        );
        let rec = CommandRecognizer::new("wrapper", spec);
        let raw = rec.recognize(&GrayImage::new(6, 4)).await.unwrap().unwrap();
        assert_eq!(raw.text, "XYZ789");
        assert_eq!(rec.id().as_str(), "wrapper");
    }

    #[test]
    fn test_recognizer_config_default_is_tesseract() {
        assert_eq!(RecognizerConfig::default().build().id().as_str(), "tesseract");
    }
}
