//! Run documents through pluggable OCR engines, with GPU admission control and
//! time-bounded job tracking.
//!
//! The usual entry point is [`Orchestrator`]:
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use ocr_dispatch::{Orchestrator, ServiceConfig, SubmitRequest};
//!
//! let orchestrator = Orchestrator::with_default_engines(ServiceConfig::default()).await?;
//! let receipt = orchestrator.submit(SubmitRequest {
//!     engine: Some("tesseract".to_owned()),
//!     params: Default::default(),
//!     path: "scan.png".into(),
//! })?;
//! let view = orchestrator
//!     .await_result(receipt.job_id, std::time::Duration::from_secs(60))
//!     .await?;
//! println!("{}", view.status);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod async_utils;
pub mod config;
pub mod cpu_limit;
pub mod engines;
pub mod error;
pub mod hocr;
pub mod jobs;
pub mod orchestrator;
pub mod params;
pub mod prelude;
pub mod registry;
mod toml_utils;

pub use self::{
    config::ServiceConfig,
    jobs::{JobId, JobStatus, JobView},
    orchestrator::{Orchestrator, SubmitReceipt, SubmitRequest},
};
