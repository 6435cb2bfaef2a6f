//! OCR engine wrapping the `tesseract` CLI tool.

use std::{collections::BTreeSet, ffi::OsString, sync::LazyLock};

use regex::Regex;
use schemars::JsonSchema;
use tokio::process::Command;

use crate::{
    async_utils::{run_engine_command, run_probe_command},
    cpu_limit::CpuLimiter,
    params::{ConfigSchema, EngineConfig, FieldKind, FieldSpec, MAX_LANGUAGES},
    prelude::*,
};

use super::{
    BBox, EngineDescriptor, EngineError, OcrEngine, ProbedCapabilities, RawLine,
    RawPage, RawResult, check_input_type,
};

/// Our engine name.
pub const NAME: &str = "tesseract";

/// Parameters accepted by `tesseract`.
pub static CONFIG_SCHEMA: ConfigSchema = ConfigSchema {
    fields: &[
        FieldSpec {
            name: "lang",
            kind: FieldKind::Languages { max: MAX_LANGUAGES },
        },
        FieldSpec {
            name: "psm",
            kind: FieldKind::Integer { min: 0, max: 13 },
        },
        FieldSpec {
            name: "oem",
            kind: FieldKind::Integer { min: 0, max: 3 },
        },
        FieldSpec {
            name: "dpi",
            kind: FieldKind::Integer { min: 70, max: 2400 },
        },
    ],
    build: build_config,
};

fn build_config(value: Value) -> serde_json::Result<EngineConfig> {
    Ok(EngineConfig::Tesseract(serde_json::from_value(value)?))
}

/// Tesseract parameters.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TesseractConfig {
    /// Tesseract language codes, such as `eng` or `fra`. At most 5.
    #[serde(default = "default_lang")]
    #[schemars(length(min = 1, max = 5))]
    pub lang: Vec<String>,

    /// Page segmentation mode, 0 to 13.
    #[serde(default = "default_psm")]
    #[schemars(range(min = 0, max = 13))]
    pub psm: u8,

    /// OCR engine mode, 0 to 3.
    #[serde(default = "default_oem")]
    #[schemars(range(min = 0, max = 3))]
    pub oem: u8,

    /// Input resolution, if the image doesn't say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 70, max = 2400))]
    pub dpi: Option<u32>,
}

fn default_lang() -> Vec<String> {
    vec!["eng".to_owned()]
}

fn default_psm() -> u8 {
    3
}

fn default_oem() -> u8 {
    3
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            lang: default_lang(),
            psm: default_psm(),
            oem: default_oem(),
            dpi: None,
        }
    }
}

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractEngine {
    descriptor: EngineDescriptor,
    executable: OsString,
    cpu_limiter: CpuLimiter,
}

impl TesseractEngine {
    /// Create a new `tesseract` engine. Set `TESSERACT_PATH` to override the
    /// executable.
    pub fn new(cpu_limiter: CpuLimiter) -> Self {
        Self {
            descriptor: EngineDescriptor {
                name: NAME,
                platform_requirement: None,
                supports_gpu: false,
                config_schema: &CONFIG_SCHEMA,
            },
            executable: std::env::var_os("TESSERACT_PATH")
                .unwrap_or_else(|| OsString::from("tesseract")),
            cpu_limiter,
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn is_installed(&self) -> Result<bool> {
        let output = Command::new(&self.executable)
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) => Ok(output.status.success()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context("cannot run tesseract"),
        }
    }

    async fn capabilities(&self) -> Result<ProbedCapabilities> {
        let version_output =
            run_probe_command(NAME, Command::new(&self.executable).arg("--version"))
                .await?;
        // Older versions print their version to stderr.
        let version = parse_version(&String::from_utf8_lossy(&version_output.stdout))
            .or_else(|| parse_version(&String::from_utf8_lossy(&version_output.stderr)));

        let langs_output =
            run_probe_command(NAME, Command::new(&self.executable).arg("--list-langs"))
                .await?;
        let languages = parse_language_list(&String::from_utf8_lossy(&langs_output.stdout));
        Ok(ProbedCapabilities { version, languages })
    }

    #[instrument(level = "debug", skip_all, fields(input = %input.display()))]
    async fn process(
        &self,
        input: &Path,
        config: &EngineConfig,
    ) -> Result<RawResult, EngineError> {
        let EngineConfig::Tesseract(config) = config else {
            return Err(anyhow!("tesseract was given parameters for another engine").into());
        };
        check_input_type(NAME, input, &["image/"])?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg(input)
            .arg("stdout")
            .arg("-l")
            .arg(config.lang.join("+"))
            .arg("--psm")
            .arg(config.psm.to_string())
            .arg("--oem")
            .arg(config.oem.to_string());
        if let Some(dpi) = config.dpi {
            cmd.arg("--dpi").arg(dpi.to_string());
        }
        cmd.arg("tsv");

        let cmd = &mut cmd;
        let output = self
            .cpu_limiter
            .run(move || run_engine_command(NAME, cmd))
            .await??;
        let tsv = String::from_utf8(output.stdout).context("tesseract output is not UTF-8")?;
        Ok(parse_tsv(&tsv)?)
    }
}

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^tesseract\s+v?(\S+)").expect("failed to compile regex")
});

/// Extract the version from `tesseract --version`.
fn parse_version(output: &str) -> Option<String> {
    VERSION_REGEX
        .captures(output)
        .map(|caps| caps[1].to_owned())
}

/// Parse `tesseract --list-langs`. The first line is a header. `osd` is
/// orientation detection, not a language.
fn parse_language_list(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|code| !code.is_empty() && *code != "osd")
        .map(str::to_owned)
        .collect()
}

/// Where a word belongs: page, block, paragraph, line.
type LineKey = (u32, u32, u32, u32);

/// A line being assembled from words.
struct LineBuilder {
    key: LineKey,
    words: Vec<String>,
    bbox: BBox,
    confidences: Vec<f32>,
}

impl LineBuilder {
    fn finish(self) -> RawLine {
        let confidence = if self.confidences.is_empty() {
            None
        } else {
            Some(self.confidences.iter().sum::<f32>() / self.confidences.len() as f32)
        };
        RawLine {
            text: self.words.join(" "),
            bbox: Some(self.bbox),
            confidence,
        }
    }
}

/// Parse tesseract's TSV output into lines.
///
/// Columns are `level page_num block_num par_num line_num word_num left top
/// width height conf text`. Level 1 rows describe pages and level 5 rows
/// describe words. Everything in between is implied by the numbering.
pub(crate) fn parse_tsv(tsv: &str) -> Result<RawResult> {
    let mut pages: Vec<RawPage> = vec![];
    let mut current: Option<LineBuilder> = None;

    for (idx, row) in tsv.lines().enumerate() {
        if idx == 0 && row.starts_with("level") {
            continue;
        }
        if row.trim().is_empty() {
            continue;
        }
        let cols = row.splitn(12, '\t').collect::<Vec<_>>();
        if cols.len() < 11 {
            return Err(anyhow!("malformed tesseract TSV row {}: {row:?}", idx + 1));
        }
        let num = |i: usize| -> Result<u32> {
            cols[i]
                .parse::<u32>()
                .with_context(|| format!("bad number in tesseract TSV row {}", idx + 1))
        };
        let level = num(0)?;
        let (left, top, width, height) = (num(6)?, num(7)?, num(8)?, num(9)?);

        match level {
            1 => {
                if let Some(line) = current.take() {
                    push_line(&mut pages, line);
                }
                pages.push(RawPage {
                    size: Some((width, height)),
                    lines: vec![],
                });
            }
            5 => {
                let text = cols.get(11).map(|t| t.trim()).unwrap_or_default();
                if text.is_empty() {
                    continue;
                }
                let key = (num(1)?, num(2)?, num(3)?, num(4)?);
                let bbox = BBox {
                    left,
                    top,
                    right: left.saturating_add(width),
                    bottom: top.saturating_add(height),
                };
                let conf = cols[10]
                    .trim()
                    .parse::<f32>()
                    .ok()
                    .filter(|conf| *conf >= 0.0);

                match &mut current {
                    Some(line) if line.key == key => {
                        line.words.push(text.to_owned());
                        line.bbox = line.bbox.union(bbox);
                        line.confidences.extend(conf);
                    }
                    _ => {
                        if let Some(line) = current.take() {
                            push_line(&mut pages, line);
                        }
                        current = Some(LineBuilder {
                            key,
                            words: vec![text.to_owned()],
                            bbox,
                            confidences: conf.into_iter().collect(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(line) = current.take() {
        push_line(&mut pages, line);
    }
    Ok(RawResult { pages })
}

fn push_line(pages: &mut Vec<RawPage>, line: LineBuilder) {
    if pages.is_empty() {
        pages.push(RawPage::default());
    }
    if let Some(page) = pages.last_mut() {
        page.lines.push(line.finish());
    }
}
