//! Bucket access policy scenarios
//!
//! All providers share one endpoint family:
//! - `GET /buckets/{bucket}/policy` returns `{bucket, exists, policy?}`
//! - `POST /buckets/{bucket}/policy/validate` performs static checks
//! - `PUT /buckets/{bucket}/policy` applies `{policy}`
//! - `DELETE /buckets/{bucket}/policy` resets (S3, Azure) or is rejected (GCS)
//!
//! The documents themselves differ per provider, so each adapter owns its
//! payload builder and comparator. [`PolicyAdapter`] selects one by provider.

mod azure;
mod gcs;
mod s3;

use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{E2eError, Result};
use crate::retry::RetryPolicy;
use crate::scenario::ProviderKind;
use crate::transport::ApiClient;

pub use azure::{AzureContainerPolicy, PublicAccess, StoredAccessPolicy, STORED_POLICY_ID};
pub use gcs::{IamPolicy, DELETE_UNSUPPORTED_CODE, PUBLIC_READ_ROLE};
pub use s3::{S3PolicyDocument, S3Statement};

/// Common envelope returned by `GET /buckets/{bucket}/policy`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PolicyEnvelope {
    pub bucket: String,
    pub exists: bool,
    #[serde(default)]
    pub policy: Option<Value>,
}

/// Static validation result
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationReport {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Result of a policy scenario that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Every step ran and verified
    Verified,
    /// A best-effort step failed and the rest was skipped
    Skipped { stage: &'static str, reason: String },
}

/// Provider-specific bucket policy scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAdapter {
    /// S3 bucket policy document
    S3,
    /// Azure container ACL (public access + stored access policies)
    Azure,
    /// GCS IAM policy; `strict` turns skips into failures
    Gcs { strict: bool },
}

impl PolicyAdapter {
    pub fn for_provider(provider: ProviderKind, gcs_strict: bool) -> Self {
        match provider {
            ProviderKind::AwsS3 | ProviderKind::S3Compatible | ProviderKind::OciS3Compat => {
                PolicyAdapter::S3
            }
            ProviderKind::AzureBlob => PolicyAdapter::Azure,
            ProviderKind::GcpGcs => PolicyAdapter::Gcs { strict: gcs_strict },
        }
    }

    /// Log label used for the retry wrapper
    pub fn label(&self) -> &'static str {
        match self {
            PolicyAdapter::S3 | PolicyAdapter::Gcs { .. } => "Bucket policy",
            PolicyAdapter::Azure => "Container policy",
        }
    }

    /// Attempts reflect how stable each emulator's policy surface is
    pub fn retry_policy(&self) -> RetryPolicy {
        let attempts = match self {
            PolicyAdapter::S3 | PolicyAdapter::Azure => 6,
            PolicyAdapter::Gcs { .. } => 3,
        };
        RetryPolicy::new(attempts, Duration::from_millis(800))
    }

    /// Run the full inspect/validate/apply/verify/reset sequence
    pub async fn exercise(
        &self,
        api: &ApiClient,
        profile_id: &str,
        bucket: &str,
    ) -> Result<PolicyOutcome> {
        let endpoint = PolicyEndpoint {
            api,
            profile_id,
            bucket,
        };
        match self {
            PolicyAdapter::S3 => s3::exercise(&endpoint).await,
            PolicyAdapter::Azure => azure::exercise(&endpoint).await,
            PolicyAdapter::Gcs { strict } => gcs::exercise(&endpoint, *strict).await,
        }
    }
}

/// Request body for validate and apply
#[derive(Serialize)]
struct PolicyBody<'a, P> {
    policy: &'a P,
}

/// The four policy operations for one bucket, scoped to a profile
pub(crate) struct PolicyEndpoint<'a> {
    api: &'a ApiClient,
    profile_id: &'a str,
    bucket: &'a str,
}

impl<'a> PolicyEndpoint<'a> {
    fn path(&self) -> String {
        format!("/buckets/{}/policy", self.bucket)
    }

    pub(crate) fn bucket(&self) -> &str {
        self.bucket
    }

    /// `GET` the envelope; a malformed envelope is a protocol violation
    pub(crate) async fn inspect(&self) -> Result<PolicyEnvelope> {
        let raw: Value = self
            .api
            .request_json(Method::GET, &self.path(), Some(self.profile_id), None)
            .await?;
        let envelope: PolicyEnvelope = serde_json::from_value(raw.clone()).map_err(|e| {
            E2eError::Protocol(format!("malformed bucket policy response ({}): {}", e, raw))
        })?;
        if envelope.bucket != self.bucket {
            return Err(E2eError::Protocol(format!(
                "policy response names bucket {:?}, expected {:?}: {}",
                envelope.bucket, self.bucket, raw
            )));
        }
        Ok(envelope)
    }

    /// Static validation; `{ok: false}` is an assertion failure
    pub(crate) async fn validate<P: Serialize>(&self, policy: &P) -> Result<ValidationReport> {
        let path = format!("{}/validate", self.path());
        let report: ValidationReport = self
            .api
            .send_json(Method::POST, &path, Some(self.profile_id), &PolicyBody { policy })
            .await?;
        debug!(
            bucket = self.bucket,
            provider = report.provider.as_deref(),
            ok = ?report.ok,
            "Policy validation report"
        );
        for warning in &report.warnings {
            warn!(bucket = self.bucket, warning = %warning, "Policy validation warning");
        }
        if report.ok == Some(false) {
            return Err(E2eError::Assertion(format!(
                "static validation failed for bucket {}: {}",
                self.bucket,
                report.errors.join("; ")
            )));
        }
        Ok(report)
    }

    pub(crate) async fn apply<P: Serialize>(&self, policy: &P) -> Result<()> {
        let _: Value = self
            .api
            .send_json(Method::PUT, &self.path(), Some(self.profile_id), &PolicyBody { policy })
            .await?;
        Ok(())
    }

    pub(crate) async fn delete(&self) -> Result<()> {
        let _: Value = self
            .api
            .request_json(Method::DELETE, &self.path(), Some(self.profile_id), None)
            .await?;
        Ok(())
    }

    pub(crate) fn step(&self, scope: &str, step: &str) {
        info!(bucket = self.bucket, "{}: {}", scope, step);
    }
}

/// Decode the `policy` member of an envelope into a provider document
pub(crate) fn decode_policy<T: serde::de::DeserializeOwned>(
    envelope: &PolicyEnvelope,
    what: &str,
) -> Result<Option<T>> {
    match &envelope.policy {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
            E2eError::Protocol(format!("malformed {} ({}): {}", what, e, value))
        }),
    }
}
