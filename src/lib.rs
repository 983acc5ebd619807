//! Storage E2E - end-to-end scenario runner for a multi-cloud object storage
//! management API
//!
//! Drives an S3-compatible, an Azure-Blob-compatible and a GCS-compatible
//! backend through the management API in a fixed order: profile, bucket,
//! bucket policy, staged upload, commit job and download.

pub mod config;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod multipart;
pub mod policy;
pub mod readiness;
pub mod retry;
pub mod scenario;
pub mod transport;

pub use config::{Config, LogFormat};
pub use errors::{E2eError, HttpFailure, Result};
pub use scenario::{run_all, ScenarioConfig, ScenarioReport, ScenarioRunner};
pub use transport::ApiClient;
