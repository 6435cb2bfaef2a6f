//! OCR engine wrapping the EasyOCR Python library.
//!
//! We run a small inline script with the configured Python interpreter, and
//! read JSON back from its standard output. This is the only built-in engine
//! which can use a GPU.

use std::{collections::BTreeSet, ffi::OsString};

use schemars::JsonSchema;
use tokio::process::Command;

use crate::{
    async_utils::{run_engine_command, run_probe_command},
    params::{ConfigSchema, EngineConfig, FieldKind, FieldSpec, MAX_LANGUAGES},
    prelude::*,
};

use super::{
    BBox, EngineDescriptor, EngineError, OcrEngine, ProbedCapabilities, RawLine,
    RawPage, RawResult, check_input_type,
};

/// Our engine name.
pub const NAME: &str = "easyocr";

/// Parameters accepted by `easyocr`.
pub static CONFIG_SCHEMA: ConfigSchema = ConfigSchema {
    fields: &[
        FieldSpec {
            name: "languages",
            kind: FieldKind::Languages { max: MAX_LANGUAGES },
        },
        FieldSpec {
            name: "gpu",
            kind: FieldKind::Bool,
        },
        FieldSpec {
            name: "text_threshold",
            kind: FieldKind::Number { min: 0.0, max: 1.0 },
        },
        FieldSpec {
            name: "low_text",
            kind: FieldKind::Number { min: 0.0, max: 1.0 },
        },
        FieldSpec {
            name: "link_threshold",
            kind: FieldKind::Number { min: 0.0, max: 1.0 },
        },
        FieldSpec {
            name: "decoder",
            kind: FieldKind::Choice(&["greedy", "beamsearch", "wordbeamsearch"]),
        },
    ],
    build: build_config,
};

fn build_config(value: Value) -> serde_json::Result<EngineConfig> {
    Ok(EngineConfig::EasyOcr(serde_json::from_value(value)?))
}

/// How EasyOCR decodes recognized characters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decoder {
    #[default]
    Greedy,
    Beamsearch,
    Wordbeamsearch,
}

/// EasyOCR parameters.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EasyOcrConfig {
    /// EasyOCR language codes, such as `en` or `ch_sim`. At most 5.
    #[serde(default = "default_languages")]
    #[schemars(length(min = 1, max = 5))]
    pub languages: Vec<String>,

    /// Run on a GPU. GPU jobs wait for an admission slot.
    #[serde(default = "default_true")]
    pub gpu: bool,

    /// Text confidence threshold.
    #[serde(default = "default_text_threshold")]
    #[schemars(range(min = 0.0, max = 1.0))]
    pub text_threshold: f64,

    /// Text low-bound score.
    #[serde(default = "default_low_text")]
    #[schemars(range(min = 0.0, max = 1.0))]
    pub low_text: f64,

    /// Link confidence threshold.
    #[serde(default = "default_link_threshold")]
    #[schemars(range(min = 0.0, max = 1.0))]
    pub link_threshold: f64,

    #[serde(default)]
    pub decoder: Decoder,
}

fn default_languages() -> Vec<String> {
    vec!["en".to_owned()]
}

fn default_true() -> bool {
    true
}

fn default_text_threshold() -> f64 {
    0.7
}

fn default_low_text() -> f64 {
    0.4
}

fn default_link_threshold() -> f64 {
    0.4
}

impl Default for EasyOcrConfig {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            gpu: default_true(),
            text_threshold: default_text_threshold(),
            low_text: default_low_text(),
            link_threshold: default_link_threshold(),
            decoder: Decoder::default(),
        }
    }
}

/// Prints `{"version": ..., "languages": [...]}`.
const PROBE_SCRIPT: &str = r#"
import json, sys
import easyocr
from easyocr.config import all_lang_list
json.dump({"version": getattr(easyocr, "__version__", None), "languages": sorted(all_lang_list)}, sys.stdout)
"#;

/// Reads a JSON job from argv, prints a JSON list of detections.
const OCR_SCRIPT: &str = r#"
import json, sys
import easyocr
job = json.loads(sys.argv[1])
reader = easyocr.Reader(job["languages"], gpu=job["gpu"], verbose=False)
found = reader.readtext(
    job["input"],
    decoder=job["decoder"],
    text_threshold=job["text_threshold"],
    low_text=job["low_text"],
    link_threshold=job["link_threshold"],
)
out = []
for box, text, conf in found:
    xs = [float(p[0]) for p in box]
    ys = [float(p[1]) for p in box]
    out.append({"text": text, "bbox": [min(xs), min(ys), max(xs), max(ys)], "confidence": float(conf)})
json.dump(out, sys.stdout)
"#;

/// Output of [`PROBE_SCRIPT`].
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    version: Option<String>,
    languages: BTreeSet<String>,
}

/// One detection printed by [`OCR_SCRIPT`].
#[derive(Debug, Deserialize)]
struct Detection {
    text: String,
    bbox: [f64; 4],
    confidence: f64,
}

/// OCR engine wrapping EasyOCR.
pub struct EasyOcrEngine {
    descriptor: EngineDescriptor,
    python: OsString,
}

impl EasyOcrEngine {
    /// Create a new EasyOCR engine. Set `EASYOCR_PYTHON` to choose the Python
    /// interpreter which has `easyocr` installed.
    pub fn new() -> Self {
        Self {
            descriptor: EngineDescriptor {
                name: NAME,
                platform_requirement: None,
                supports_gpu: true,
                config_schema: &CONFIG_SCHEMA,
            },
            python: std::env::var_os("EASYOCR_PYTHON")
                .unwrap_or_else(|| OsString::from("python3")),
        }
    }
}

impl Default for EasyOcrEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for EasyOcrEngine {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn is_installed(&self) -> Result<bool> {
        let output = Command::new(&self.python)
            .arg("-c")
            .arg("import easyocr")
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) => {
                if !output.status.success() {
                    debug!(
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "easyocr is not importable"
                    );
                }
                Ok(output.status.success())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context("cannot run python for easyocr"),
        }
    }

    async fn capabilities(&self) -> Result<ProbedCapabilities> {
        let output = run_probe_command(
            NAME,
            Command::new(&self.python).arg("-c").arg(PROBE_SCRIPT),
        )
        .await?;
        let probe = serde_json::from_slice::<ProbeOutput>(&output.stdout)
            .context("cannot parse easyocr probe output")?;
        Ok(ProbedCapabilities {
            version: probe.version,
            languages: probe.languages,
        })
    }

    #[instrument(level = "debug", skip_all, fields(input = %input.display()))]
    async fn process(
        &self,
        input: &Path,
        config: &EngineConfig,
    ) -> Result<RawResult, EngineError> {
        let EngineConfig::EasyOcr(config) = config else {
            return Err(anyhow!("easyocr was given parameters for another engine").into());
        };
        check_input_type(NAME, input, &["image/"])?;

        let job = json!({
            "input": input.to_string_lossy(),
            "languages": config.languages,
            "gpu": config.gpu,
            "decoder": config.decoder,
            "text_threshold": config.text_threshold,
            "low_text": config.low_text,
            "link_threshold": config.link_threshold,
        });
        let output = run_engine_command(
            NAME,
            Command::new(&self.python)
                .arg("-c")
                .arg(OCR_SCRIPT)
                .arg(job.to_string()),
        )
        .await?;
        Ok(parse_output(&output.stdout)?)
    }
}

/// Convert the script's detections to a single page of lines.
fn parse_output(stdout: &[u8]) -> Result<RawResult> {
    let detections = serde_json::from_slice::<Vec<Detection>>(stdout)
        .context("cannot parse easyocr output")?;
    let lines = detections
        .into_iter()
        .map(|d| RawLine {
            text: d.text,
            bbox: Some(BBox {
                left: to_pixel(d.bbox[0]),
                top: to_pixel(d.bbox[1]),
                right: to_pixel(d.bbox[2]),
                bottom: to_pixel(d.bbox[3]),
            }),
            confidence: Some((d.confidence * 100.0) as f32),
        })
        .collect();
    Ok(RawResult {
        pages: vec![RawPage { size: None, lines }],
    })
}

fn to_pixel(coord: f64) -> u32 {
    coord.round().max(0.0) as u32
}
