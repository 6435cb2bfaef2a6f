//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use ocr_dispatch::{
    async_utils::io::create_writer,
    engines::{easyocr, pdftotext, tesseract},
    prelude::*,
};
use schemars::{schema::RootSchema, schema_for};
use tokio::io::AsyncWriteExt as _;

/// Engines whose parameters we can describe.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SchemaEngine {
    Tesseract,
    #[value(name = "easyocr")]
    EasyOcr,
    #[value(name = "pdftotext")]
    PdfToText,
}

impl SchemaEngine {
    fn schema(self) -> RootSchema {
        match self {
            SchemaEngine::Tesseract => schema_for!(tesseract::TesseractConfig),
            SchemaEngine::EasyOcr => schema_for!(easyocr::EasyOcrConfig),
            SchemaEngine::PdfToText => schema_for!(pdftotext::PdfToTextConfig),
        }
    }
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The engine whose `--param` values to describe.
    #[clap(value_enum, value_name = "ENGINE")]
    pub engine: SchemaEngine,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all, fields(engine = ?opts.engine))]
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let mut schema =
        serde_json::to_string_pretty(&opts.engine.schema()).context("failed to serialize schema")?;
    schema.push('\n');

    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    wtr.write_all(schema.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}
