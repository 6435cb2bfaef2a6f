//! OCR engine interface.
//!
//! An engine is a black box: it knows how to report whether it is installed,
//! what it can do, and how to turn a file into a [`RawResult`]. Everything
//! else (validation, admission, timeouts, bookkeeping) happens outside.

use std::{collections::BTreeSet, sync::Arc};

use thiserror::Error;

use crate::{
    cpu_limit::CpuLimiter,
    hocr,
    params::{ConfigSchema, EngineConfig},
    prelude::*,
    registry::Platform,
};

pub mod easyocr;
pub mod pdftotext;
pub mod tesseract;

/// Static facts about an engine. Immutable once registered.
#[derive(Clone, Debug)]
pub struct EngineDescriptor {
    /// Unique engine name, used to select it in requests.
    pub name: &'static str,

    /// The OS this engine is restricted to, if any.
    pub platform_requirement: Option<Platform>,

    /// Can this engine run on a GPU?
    pub supports_gpu: bool,

    /// The parameters this engine accepts.
    pub config_schema: &'static ConfigSchema,
}

/// What an engine reports about itself when probed.
#[derive(Clone, Debug, Default)]
pub struct ProbedCapabilities {
    /// Engine version, if it can tell us.
    pub version: Option<String>,

    /// Engine-native language codes.
    pub languages: BTreeSet<String>,
}

/// One line of recognized text.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawLine {
    /// The text of the line.
    pub text: String,

    /// Where the line is on the page, in pixels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,

    /// Recognition confidence, from 0 to 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// One page of recognized text.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RawPage {
    /// Page size in pixels, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<(u32, u32)>,

    /// Lines in reading order.
    pub lines: Vec<RawLine>,
}

/// An engine's native output, before conversion to the standard format.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RawResult {
    pub pages: Vec<RawPage>,
}

/// A pixel bounding box.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct BBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl BBox {
    /// The smallest box containing both `self` and `other`.
    pub fn union(self, other: BBox) -> BBox {
        BBox {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }
}

/// Errors raised by [`OcrEngine::process`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was available when the job was accepted, but is not now.
    #[error("engine is no longer available: {0}")]
    Unavailable(String),

    /// The engine ran and failed, or produced output we could not read.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Static facts about this engine.
    fn descriptor(&self) -> &EngineDescriptor;

    /// Is the engine installed? Called once at startup.
    async fn is_installed(&self) -> Result<bool>;

    /// Probe version and languages. Called once at startup, and only if
    /// [`OcrEngine::is_installed`] returned `true`.
    async fn capabilities(&self) -> Result<ProbedCapabilities>;

    /// OCR a file. May take a long time.
    async fn process(
        &self,
        input: &Path,
        config: &EngineConfig,
    ) -> Result<RawResult, EngineError>;

    /// Convert native output to hOCR. Must be pure.
    fn to_standard_format(&self, raw: &RawResult) -> String {
        hocr::render(raw)
    }
}

/// Our built-in engines.
pub fn default_engines(cpu_limiter: CpuLimiter) -> Vec<Arc<dyn OcrEngine>> {
    vec![
        Arc::new(tesseract::TesseractEngine::new(cpu_limiter.clone())),
        Arc::new(easyocr::EasyOcrEngine::new()),
        Arc::new(pdftotext::PdfToTextEngine::new(cpu_limiter)),
    ]
}

/// Reject inputs whose extension doesn't match one of `mime_prefixes`.
pub(crate) fn check_input_type(
    engine: &str,
    input: &Path,
    mime_prefixes: &[&str],
) -> Result<()> {
    let mime = mime_guess::from_path(input).first_or_octet_stream();
    if mime_prefixes
        .iter()
        .any(|prefix| mime.essence_str().starts_with(prefix))
    {
        Ok(())
    } else {
        Err(anyhow!(
            "{engine} cannot read {:?} (detected type {})",
            input,
            mime.essence_str()
        ))
    }
}
