//! Provider scenarios
//!
//! A scenario drives one storage backend through the whole API surface:
//! profile, connectivity test, bucket, policy, staged upload, commit job and
//! download. Scenarios run strictly one after another and each one is
//! all-or-nothing.

use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, info_span, warn, Instrument};

use crate::config::Config;
use crate::errors::{E2eError, Result};
use crate::jobs::JobPoller;
use crate::metrics::SCENARIOS;
use crate::multipart;
use crate::policy::{PolicyAdapter, PolicyOutcome};
use crate::readiness::wait_for_server;
use crate::retry::{retry, unsettled, RetryPolicy};
use crate::transport::{ApiClient, ApiRequest, ACCEPT_JSON};

/// Key and file name of the object every scenario uploads
pub const HELLO_KEY: &str = "hello.txt";

/// Profile provider identifiers used by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    AwsS3,
    S3Compatible,
    OciS3Compat,
    AzureBlob,
    GcpGcs,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::AwsS3 => "aws_s3",
            ProviderKind::S3Compatible => "s3_compatible",
            ProviderKind::OciS3Compat => "oci_s3_compat",
            ProviderKind::AzureBlob => "azure_blob",
            ProviderKind::GcpGcs => "gcp_gcs",
        }
    }
}

/// Connection settings for the S3 family of providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Profile {
    pub name: String,
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub preserve_leading_slash: bool,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureProfile {
    pub name: String,
    pub account_name: String,
    pub account_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub use_emulator: bool,
    #[serde(default)]
    pub preserve_leading_slash: bool,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_number: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub preserve_leading_slash: bool,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
}

/// Body of `POST /profiles`, discriminated by `provider`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProfileRequest {
    AwsS3(S3Profile),
    S3Compatible(S3Profile),
    OciS3Compat(S3Profile),
    AzureBlob(AzureProfile),
    GcpGcs(GcsProfile),
}

impl ProfileRequest {
    pub fn provider(&self) -> ProviderKind {
        match self {
            ProfileRequest::AwsS3(_) => ProviderKind::AwsS3,
            ProfileRequest::S3Compatible(_) => ProviderKind::S3Compatible,
            ProfileRequest::OciS3Compat(_) => ProviderKind::OciS3Compat,
            ProfileRequest::AzureBlob(_) => ProviderKind::AzureBlob,
            ProfileRequest::GcpGcs(_) => ProviderKind::GcpGcs,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProfileRequest::AwsS3(p) | ProfileRequest::S3Compatible(p) | ProfileRequest::OciS3Compat(p) => {
                &p.name
            }
            ProfileRequest::AzureBlob(p) => &p.name,
            ProfileRequest::GcpGcs(p) => &p.name,
        }
    }
}

/// One provider scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub bucket: String,
    /// Where the backend is expected to live, for log output only
    #[serde(default)]
    pub endpoint_note: String,
    pub profile: ProfileRequest,
}

/// Well-known Azurite development account key (devstoreaccount1)
const AZURITE_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// MinIO, Azurite and fake-gcs-server as wired up by the E2E compose stack
pub fn default_scenarios() -> Vec<ScenarioConfig> {
    vec![
        ScenarioConfig {
            name: "minio".to_string(),
            bucket: "e2e-minio".to_string(),
            endpoint_note: "minio:9000".to_string(),
            profile: ProfileRequest::S3Compatible(S3Profile {
                name: "e2e-minio".to_string(),
                endpoint: "http://minio:9000".to_string(),
                region: "us-east-1".to_string(),
                access_key_id: "minioadmin".to_string(),
                secret_access_key: "minioadmin".to_string(),
                force_path_style: true,
                preserve_leading_slash: false,
                tls_insecure_skip_verify: false,
            }),
        },
        ScenarioConfig {
            name: "azurite".to_string(),
            bucket: "e2e-azurite".to_string(),
            endpoint_note: "azurite:10000".to_string(),
            profile: ProfileRequest::AzureBlob(AzureProfile {
                name: "e2e-azurite".to_string(),
                account_name: "devstoreaccount1".to_string(),
                account_key: AZURITE_ACCOUNT_KEY.to_string(),
                endpoint: Some("http://azurite:10000/devstoreaccount1".to_string()),
                use_emulator: true,
                preserve_leading_slash: false,
                tls_insecure_skip_verify: false,
            }),
        },
        ScenarioConfig {
            name: "fake-gcs".to_string(),
            bucket: "e2e-fake-gcs".to_string(),
            endpoint_note: "fake-gcs-server:4443".to_string(),
            profile: ProfileRequest::GcpGcs(GcsProfile {
                name: "e2e-fake-gcs".to_string(),
                // Bucket listing needs a project number; the emulator accepts any value.
                project_number: Some("1234567890".to_string()),
                anonymous: true,
                endpoint: Some("http://fake-gcs-server:4443".to_string()),
                preserve_leading_slash: false,
                tls_insecure_skip_verify: false,
            }),
        },
    ]
}

/// Retry budgets for the stages that wait on a backend to converge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageRetries {
    pub profile_test: RetryPolicy,
    pub ensure_bucket: RetryPolicy,
}

impl Default for StageRetries {
    fn default() -> Self {
        Self {
            profile_test: RetryPolicy::new(15, Duration::from_secs(1)),
            ensure_bucket: RetryPolicy::new(10, Duration::from_millis(800)),
        }
    }
}

/// What a passed scenario left behind
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    pub name: String,
    pub profile_id: String,
    pub upload_id: String,
    pub job_id: String,
    pub policy: PolicyOutcome,
}

#[derive(Debug, Deserialize)]
struct CreatedProfile {
    id: String,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileTestResponse {
    ok: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<Value>,
}

#[derive(Debug, Serialize)]
struct CreateBucketRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct BucketSummary {
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateUploadRequest<'a> {
    bucket: &'a str,
    prefix: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedUpload {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedJob {
    job_id: String,
}

/// Scenario runner bound to one API client and configuration
pub struct ScenarioRunner<'a> {
    api: &'a ApiClient,
    gcs_strict: bool,
    poller: JobPoller,
    retries: StageRetries,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(api: &'a ApiClient, config: &Config) -> Self {
        Self {
            api,
            gcs_strict: config.gcs_strict,
            poller: JobPoller::new(config.poll_interval(), config.job_timeout()),
            retries: StageRetries::default(),
        }
    }

    /// Override the per-stage retry budgets
    pub fn with_retries(mut self, retries: StageRetries) -> Self {
        self.retries = retries;
        self
    }

    /// Run one scenario end to end
    pub async fn run(&self, scenario: &ScenarioConfig) -> Result<ScenarioReport> {
        let span = info_span!("scenario", name = %scenario.name);
        let result = self.run_steps(scenario).instrument(span).await;

        let outcome = match &result {
            Ok(report) if matches!(report.policy, PolicyOutcome::Skipped { .. }) => "passed_with_skip",
            Ok(_) => "passed",
            Err(_) => "failed",
        };
        SCENARIOS
            .with_label_values(&[scenario.name.as_str(), outcome])
            .inc();
        result
    }

    async fn run_steps(&self, scenario: &ScenarioConfig) -> Result<ScenarioReport> {
        let api = self.api;
        let name = scenario.name.as_str();
        let bucket = scenario.bucket.as_str();
        let provider = scenario.profile.provider();

        info!("=== Scenario: {} ===", name);
        info!(endpoint = %scenario.endpoint_note, "Profile endpoint hint");

        let profile: CreatedProfile = api
            .send_json(Method::POST, "/profiles", None, &scenario.profile)
            .await?;
        let profile_id = profile.id.as_str();
        info!(
            profile_id,
            profile_name = scenario.profile.name(),
            provider = profile.provider.as_deref().unwrap_or(provider.as_str()),
            "Created profile"
        );

        self.test_profile(name, profile_id).await?;
        info!("Profile test OK");

        let ensure_label = format!("Ensure bucket ({})", name);
        retry(&ensure_label, &self.retries.ensure_bucket, move || async move {
            ensure_bucket(api, profile_id, bucket).await
        })
        .await?;
        info!(bucket, "Bucket OK");

        let adapter = PolicyAdapter::for_provider(provider, self.gcs_strict);
        let policy_label = format!("{} ({})", adapter.label(), name);
        let policy = retry(&policy_label, &adapter.retry_policy(), move || async move {
            adapter.exercise(api, profile_id, bucket).await
        })
        .await?;
        if let PolicyOutcome::Skipped { stage, reason } = &policy {
            warn!(stage, reason = %reason, "Policy scenario skipped");
        }

        let upload: CreatedUpload = api
            .send_json(
                Method::POST,
                "/uploads",
                Some(profile_id),
                &CreateUploadRequest { bucket, prefix: "" },
            )
            .await?;
        info!(upload_id = %upload.upload_id, "Created upload session");

        let content = format!("hello from {}\n", name).into_bytes();
        self.stage_file(&upload.upload_id, profile_id, HELLO_KEY, &content)
            .await?;
        info!("Uploaded file to staging");

        let commit_path = format!("/uploads/{}/commit", upload.upload_id);
        let job: CreatedJob = api
            .send_json(Method::POST, &commit_path, Some(profile_id), &Map::new())
            .await?;
        info!(job_id = %job.job_id, "Commit started");
        self.poller.wait(api, &job.job_id, profile_id).await?;
        info!("Commit job succeeded");

        let downloaded = download(api, profile_id, bucket, HELLO_KEY).await?;
        if downloaded.as_ref() != content.as_slice() {
            return Err(E2eError::Assertion(format!(
                "downloaded content mismatch: expected={:?} got={:?}",
                String::from_utf8_lossy(&content),
                String::from_utf8_lossy(&downloaded)
            )));
        }
        info!("Download OK");

        Ok(ScenarioReport {
            name: name.to_string(),
            profile_id: profile.id.clone(),
            upload_id: upload.upload_id,
            job_id: job.job_id,
            policy,
        })
    }

    /// Retry the connectivity test until the backend reports `ok: true`
    async fn test_profile(&self, name: &str, profile_id: &str) -> Result<()> {
        let api = self.api;
        let path = format!("/profiles/{}/test", profile_id);
        let path = path.as_str();
        let label = format!("Profile test ({})", name);

        retry(&label, &self.retries.profile_test, move || async move {
            let test: ProfileTestResponse =
                api.request_json(Method::POST, path, None, None).await?;
            if test.ok {
                Ok(())
            } else {
                Err(unsettled(format!(
                    "profile test failed: {} {}",
                    test.message.as_deref().unwrap_or("no message"),
                    test.details.map(|d| d.to_string()).unwrap_or_default()
                )))
            }
        })
        .await
    }

    async fn stage_file(
        &self,
        upload_id: &str,
        profile_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<()> {
        let encoded = multipart::encode_files(&[(filename, content)]);
        let path = format!("/uploads/{}/files", upload_id);
        let content_type = encoded.content_type();
        self.api
            .send(
                ApiRequest::new(Method::POST, &path)
                    .profile(Some(profile_id))
                    .raw(encoded.body, content_type)
                    .accept(ACCEPT_JSON),
            )
            .await?;
        Ok(())
    }
}

/// Create the bucket if needed, then require it in the listing
async fn ensure_bucket(api: &ApiClient, profile_id: &str, bucket: &str) -> Result<()> {
    let created: Result<Value> = api
        .send_json(
            Method::POST,
            "/buckets",
            Some(profile_id),
            &CreateBucketRequest { name: bucket },
        )
        .await;
    match created {
        Ok(_) => {}
        Err(E2eError::Http(failure)) if failure.status == 409 => {
            info!(bucket, "Bucket already exists");
        }
        Err(err) => return Err(err),
    }

    let buckets: Vec<BucketSummary> = api
        .request_json(Method::GET, "/buckets", Some(profile_id), None)
        .await?;
    if buckets.iter().any(|b| b.name == bucket) {
        return Ok(());
    }
    let names: Vec<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
    Err(unsettled(format!(
        "bucket not found after create: expected={} got={:?}",
        bucket, names
    )))
}

async fn download(
    api: &ApiClient,
    profile_id: &str,
    bucket: &str,
    key: &str,
) -> Result<bytes::Bytes> {
    let encoded_key: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
    let path = format!("/buckets/{}/objects/download?key={}", bucket, encoded_key);
    api.request_bytes(Method::GET, &path, Some(profile_id)).await
}

/// Wait for the API, then run every configured scenario in order.
///
/// Stops at the first failing scenario.
pub async fn run_all(config: &Config) -> Result<Vec<ScenarioReport>> {
    let api = ApiClient::from_config(config)?;
    wait_for_server(&api, config.readiness_timeout(), config.poll_interval()).await?;

    let runner = ScenarioRunner::new(&api, config);
    let mut reports = Vec::with_capacity(config.scenarios.len());
    for scenario in &config.scenarios {
        reports.push(runner.run(scenario).await?);
    }
    info!(count = reports.len(), "All E2E scenarios passed");
    Ok(reports)
}
