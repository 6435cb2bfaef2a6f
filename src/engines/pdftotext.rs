//! An "OCR" engine that calls `pdftotext`.

use std::{ffi::OsString, sync::LazyLock};

use regex::Regex;
use schemars::JsonSchema;
use tokio::process::Command;

use crate::{
    async_utils::{run_engine_command, run_probe_command},
    cpu_limit::CpuLimiter,
    params::{ConfigSchema, EngineConfig, FieldKind, FieldSpec},
    prelude::*,
};

use super::{
    EngineDescriptor, EngineError, OcrEngine, ProbedCapabilities, RawLine, RawPage,
    RawResult, check_input_type,
};

/// Our engine name.
pub const NAME: &str = "pdftotext";

/// Parameters accepted by `pdftotext`.
pub static CONFIG_SCHEMA: ConfigSchema = ConfigSchema {
    fields: &[
        FieldSpec {
            name: "layout",
            kind: FieldKind::Bool,
        },
        FieldSpec {
            name: "first_page",
            kind: FieldKind::Integer {
                min: 1,
                max: u32::MAX as i64,
            },
        },
        FieldSpec {
            name: "last_page",
            kind: FieldKind::Integer {
                min: 1,
                max: u32::MAX as i64,
            },
        },
    ],
    build: build_config,
};

fn build_config(value: Value) -> serde_json::Result<EngineConfig> {
    Ok(EngineConfig::PdfToText(serde_json::from_value(value)?))
}

/// `pdftotext` parameters.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PdfToTextConfig {
    /// Keep the physical layout of the text.
    #[serde(default = "default_layout")]
    pub layout: bool,

    /// First page to convert, counting from 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub first_page: Option<u32>,

    /// Last page to convert. Must not be before `first_page`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub last_page: Option<u32>,
}

fn default_layout() -> bool {
    true
}

impl Default for PdfToTextConfig {
    fn default() -> Self {
        Self {
            layout: default_layout(),
            first_page: None,
            last_page: None,
        }
    }
}

/// "OCR" engine wrapping the `pdftotext` CLI tool from `poppler-utils`.
///
/// This will miss any "non-searchable" text in a PDF, but sometimes you just
/// want cheap and fast. It has no languages, and no bounding boxes.
pub struct PdfToTextEngine {
    descriptor: EngineDescriptor,
    executable: OsString,
    cpu_limiter: CpuLimiter,
}

impl PdfToTextEngine {
    /// Create a new `pdftotext` engine. Set `PDFTOTEXT_PATH` to override the
    /// executable.
    pub fn new(cpu_limiter: CpuLimiter) -> Self {
        Self {
            descriptor: EngineDescriptor {
                name: NAME,
                platform_requirement: None,
                supports_gpu: false,
                config_schema: &CONFIG_SCHEMA,
            },
            executable: std::env::var_os("PDFTOTEXT_PATH")
                .unwrap_or_else(|| OsString::from("pdftotext")),
            cpu_limiter,
        }
    }
}

#[async_trait]
impl OcrEngine for PdfToTextEngine {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn is_installed(&self) -> Result<bool> {
        let output = Command::new(&self.executable)
            .arg("-v")
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) => Ok(output.status.success()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context("cannot run pdftotext"),
        }
    }

    async fn capabilities(&self) -> Result<ProbedCapabilities> {
        let output =
            run_probe_command(NAME, Command::new(&self.executable).arg("-v")).await?;
        // Poppler prints its version banner to stderr.
        let version = parse_version(&String::from_utf8_lossy(&output.stderr))
            .or_else(|| parse_version(&String::from_utf8_lossy(&output.stdout)));
        Ok(ProbedCapabilities {
            version,
            languages: Default::default(),
        })
    }

    #[instrument(level = "debug", skip_all, fields(input = %input.display()))]
    async fn process(
        &self,
        input: &Path,
        config: &EngineConfig,
    ) -> Result<RawResult, EngineError> {
        let EngineConfig::PdfToText(config) = config else {
            return Err(anyhow!("pdftotext was given parameters for another engine").into());
        };
        // Fail all non-PDF files immediately.
        check_input_type(NAME, input, &["application/pdf"])?;

        let mut cmd = Command::new(&self.executable);
        if config.layout {
            cmd.arg("-layout");
        }
        if let Some(first_page) = config.first_page {
            cmd.arg("-f").arg(first_page.to_string());
        }
        if let Some(last_page) = config.last_page {
            cmd.arg("-l").arg(last_page.to_string());
        }
        cmd.arg("-enc").arg("UTF-8").arg(input).arg("-");

        let cmd = &mut cmd;
        let output = self
            .cpu_limiter
            .run(move || run_engine_command(NAME, cmd))
            .await??;
        let text =
            String::from_utf8(output.stdout).context("pdftotext output is not UTF-8")?;
        Ok(parse_text(&text))
    }
}

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"pdftotext version (\S+)").expect("failed to compile regex")
});

fn parse_version(output: &str) -> Option<String> {
    VERSION_REGEX
        .captures(output)
        .map(|caps| caps[1].to_owned())
}

/// Split `pdftotext` output into pages (separated by form feeds) and
/// non-blank lines.
fn parse_text(text: &str) -> RawResult {
    let mut pages = text.split('\x0c').collect::<Vec<_>>();
    // Output ends with a form feed after the last page.
    if pages.last().is_some_and(|page| page.trim().is_empty()) {
        pages.pop();
    }
    let pages = pages
        .into_iter()
        .map(|page| RawPage {
            size: None,
            lines: page
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.trim().is_empty())
                .map(|line| RawLine {
                    text: line.to_owned(),
                    bbox: None,
                    confidence: None,
                })
                .collect(),
        })
        .collect();
    RawResult { pages }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_splits_pages() {
        let result = parse_text("Title\n\n  indented   \n\x0cPage two\n\x0c");
        assert_eq!(result.pages.len(), 2);
        let texts = |page: &RawPage| {
            page.lines
                .iter()
                .map(|l| l.text.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(texts(&result.pages[0]), ["Title", "  indented"]);
        assert_eq!(texts(&result.pages[1]), ["Page two"]);
    }

    #[test]
    fn test_blank_pages_in_the_middle_are_kept() {
        let result = parse_text("one\n\x0c\x0cthree\n\x0c");
        assert_eq!(result.pages.len(), 3);
        assert!(result.pages[1].lines.is_empty());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("pdftotext version 22.02.0\nCopyright 2005-2022").as_deref(),
            Some("22.02.0")
        );
    }

    #[tokio::test]
    async fn test_rejects_non_pdf_input() {
        let engine = PdfToTextEngine::new(CpuLimiter::new(1));
        let err = engine
            .process(
                Path::new("scan.png"),
                &EngineConfig::PdfToText(PdfToTextConfig::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Failed(_)), "{err:?}");
    }
}
