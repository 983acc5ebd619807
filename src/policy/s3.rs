//! S3 bucket policy scenario
//!
//! Applies a single public-read statement, then checks that the envelope
//! reports `exists=true` after PUT and `exists=false` after DELETE.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{PolicyEndpoint, PolicyOutcome};
use crate::errors::Result;
use crate::retry::unsettled;

const SCOPE: &str = "Bucket policy";

/// IAM-style bucket policy document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statements: Vec<S3Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct S3Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: String,
    /// `"*"` or an object such as `{"AWS": [...]}`
    pub principal: Value,
    pub action: Vec<String>,
    pub resource: Vec<String>,
}

impl S3PolicyDocument {
    /// Anonymous `s3:GetObject` on every object in `bucket`
    pub fn public_read(bucket: &str) -> Self {
        Self {
            version: "2012-10-17".to_string(),
            statements: vec![S3Statement {
                sid: Some("PublicReadGetObject".to_string()),
                effect: "Allow".to_string(),
                principal: Value::String("*".to_string()),
                action: vec!["s3:GetObject".to_string()],
                resource: vec![format!("arn:aws:s3:::{}/*", bucket)],
            }],
        }
    }
}

pub(super) async fn exercise(endpoint: &PolicyEndpoint<'_>) -> Result<PolicyOutcome> {
    endpoint.step(SCOPE, "GET (initial)");
    let initial = endpoint.inspect().await?;
    debug!(exists = initial.exists, "Initial bucket policy state");

    let document = S3PolicyDocument::public_read(endpoint.bucket());

    endpoint.step(SCOPE, "VALIDATE (static)");
    endpoint.validate(&document).await?;

    endpoint.step(SCOPE, "PUT");
    endpoint.apply(&document).await?;

    endpoint.step(SCOPE, "GET (after put)");
    let after_put = endpoint.inspect().await?;
    if !after_put.exists {
        return Err(unsettled(format!(
            "policy should exist after PUT on {}",
            endpoint.bucket()
        )));
    }

    endpoint.step(SCOPE, "DELETE");
    endpoint.delete().await?;

    endpoint.step(SCOPE, "GET (after delete)");
    let after_delete = endpoint.inspect().await?;
    if after_delete.exists {
        return Err(unsettled(format!(
            "policy should not exist after DELETE on {}",
            endpoint.bucket()
        )));
    }

    endpoint.step(SCOPE, "OK");
    Ok(PolicyOutcome::Verified)
}
