//! In-process fake of the storage management API.
//!
//! Keeps just enough state to walk a scenario end to end and lets a test
//! inject the failures the runner has to cope with.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use storage_e2e::Config;

pub const TOKEN: &str = "test-token";

/// Knobs for failure injection
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// `/meta` answers 503 this many times before succeeding
    pub meta_unavailable: u32,
    /// `/meta` never succeeds
    pub meta_down: bool,
    /// Profile tests report `ok: false` this many times
    pub profile_test_warmup: u32,
    /// Buckets that already exist before the run
    pub existing_buckets: Vec<String>,
    /// The GCS policy endpoints answer 501
    pub gcs_iam_unavailable: bool,
    /// GCS policy DELETE succeeds instead of being rejected
    pub gcs_delete_allowed: bool,
    /// Error code used when rejecting GCS policy DELETE
    pub gcs_delete_code: Option<String>,
    /// S3 policy DELETE answers 204 but keeps the policy
    pub s3_policy_sticky: bool,
    /// Azure container ACL DELETE answers 204 but changes nothing
    pub azure_reset_noop: bool,
    /// Azure container ACL PUT stores the document without its stored policies
    pub azure_drop_stored_policies: bool,
    /// Commit jobs end `failed` with this error
    pub job_error: Option<String>,
    /// Serve different bytes than were uploaded
    pub corrupt_downloads: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub faults: Faults,
    next_id: u64,
    /// profile id -> provider
    pub profiles: HashMap<String, String>,
    pub profile_tests: u32,
    pub buckets: Vec<String>,
    /// bucket -> policy document
    pub policies: HashMap<String, Value>,
    /// upload id -> (bucket, staged files)
    uploads: HashMap<String, (String, BTreeMap<String, Bytes>)>,
    /// job id -> polls so far
    jobs: HashMap<String, u32>,
    pub job_log_requests: u32,
    /// (bucket, key) -> bytes
    pub objects: HashMap<(String, String), Bytes>,
    pub requests: Vec<String>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

pub type SharedState = Arc<Mutex<FakeState>>;

/// A running fake API
pub struct FakeApi {
    pub addr: SocketAddr,
    pub state: SharedState,
    _handle: JoinHandle<()>,
    _shutdown_tx: oneshot::Sender<()>,
}

impl FakeApi {
    pub async fn start() -> Self {
        Self::start_with(Faults::default()).await
    }

    pub async fn start_with(faults: Faults) -> Self {
        let state = Arc::new(Mutex::new(FakeState {
            buckets: faults.existing_buckets.clone(),
            faults,
            ..FakeState::default()
        }));

        let app = Router::new()
            .route("/meta", get(meta))
            .route("/profiles", post(create_profile))
            .route("/profiles/:id/test", post(test_profile))
            .route("/buckets", get(list_buckets).post(create_bucket))
            .route(
                "/buckets/:bucket/policy",
                get(get_policy).put(put_policy).delete(delete_policy),
            )
            .route("/buckets/:bucket/policy/validate", post(validate_policy))
            .route("/buckets/:bucket/objects/download", get(download))
            .route("/uploads", post(create_upload))
            .route("/uploads/:id/files", post(stage_files))
            .route("/uploads/:id/commit", post(commit_upload))
            .route("/jobs/:id", get(get_job))
            .route("/jobs/:id/logs", get(job_logs))
            .with_state(state.clone());

        // Bind to a random available port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            state,
            _handle: handle,
            _shutdown_tx: shutdown_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Runner configuration pointed at this server with short waits
    pub fn config(&self) -> Config {
        Config {
            base_url: self.base_url(),
            api_token: TOKEN.to_string(),
            readiness_timeout_secs: 5,
            job_timeout_secs: 5,
            poll_interval_ms: 10,
            ..Config::default()
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = json!({
        "error": {
            "code": code,
            "message": message,
            "normalizedError": {"code": "unknown", "retryable": false}
        }
    });
    (status, [("x-request-id", "req-fake")], Json(body)).into_response()
}

/// Token check plus request log; returns the profile id header when present
fn admit(state: &SharedState, headers: &HeaderMap, line: String) -> Result<Option<String>, Response> {
    state.lock().unwrap().requests.push(line);
    if headers.get("x-api-token").and_then(|v| v.to_str().ok()) != Some(TOKEN) {
        return Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized", "bad token"));
    }
    Ok(headers
        .get("x-profile-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string))
}

fn provider_of(state: &FakeState, profile_id: &Option<String>) -> Option<String> {
    profile_id
        .as_ref()
        .and_then(|id| state.profiles.get(id))
        .cloned()
}

async fn meta(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = admit(&state, &headers, "GET /meta".into()) {
        return resp;
    }
    let mut st = state.lock().unwrap();
    if st.faults.meta_down {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "starting", "not ready");
    }
    if st.faults.meta_unavailable > 0 {
        st.faults.meta_unavailable -= 1;
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "starting", "not ready");
    }
    Json(json!({"version": "0.0.0-test", "apiTokenEnabled": true})).into_response()
}

async fn create_profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, "POST /profiles".into()) {
        return resp;
    }
    let provider = body["provider"].as_str().unwrap_or("s3_compatible").to_string();
    let mut st = state.lock().unwrap();
    let id = st.next_id("profile");
    st.profiles.insert(id.clone(), provider.clone());
    (
        StatusCode::CREATED,
        Json(json!({"id": id, "name": body["name"], "provider": provider})),
    )
        .into_response()
}

async fn test_profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, format!("POST /profiles/{}/test", id)) {
        return resp;
    }
    let mut st = state.lock().unwrap();
    st.profile_tests += 1;
    if !st.profiles.contains_key(&id) {
        return error_response(StatusCode::NOT_FOUND, "not_found", "profile not found");
    }
    if st.faults.profile_test_warmup > 0 {
        st.faults.profile_test_warmup -= 1;
        return Json(json!({"ok": false, "message": "backend warming up"})).into_response();
    }
    Json(json!({"ok": true, "message": "ok"})).into_response()
}

async fn create_bucket(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, "POST /buckets".into()) {
        return resp;
    }
    let name = body["name"].as_str().unwrap_or_default().to_string();
    let mut st = state.lock().unwrap();
    if st.buckets.contains(&name) {
        return error_response(StatusCode::CONFLICT, "bucket_already_exists", "exists");
    }
    st.buckets.push(name.clone());
    (StatusCode::CREATED, Json(json!({"name": name}))).into_response()
}

async fn list_buckets(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = admit(&state, &headers, "GET /buckets".into()) {
        return resp;
    }
    let st = state.lock().unwrap();
    let buckets: Vec<Value> = st
        .buckets
        .iter()
        .map(|name| json!({"name": name, "createdAt": "2024-01-01T00:00:00Z"}))
        .collect();
    Json(Value::Array(buckets)).into_response()
}

fn default_policy(provider: &str) -> Option<Value> {
    match provider {
        "azure_blob" => Some(json!({"publicAccess": "private", "storedAccessPolicies": []})),
        "gcp_gcs" => Some(json!({"version": 1, "etag": "CAE=", "bindings": [
            {"role": "roles/storage.legacyBucketOwner", "members": ["projectOwner:1234567890"]}
        ]})),
        _ => None,
    }
}

fn policy_envelope(st: &FakeState, provider: &str, bucket: &str) -> Value {
    let policy = st
        .policies
        .get(bucket)
        .cloned()
        .or_else(|| default_policy(provider));
    let exists = match provider {
        "azure_blob" => policy
            .as_ref()
            .map(|p| {
                p["publicAccess"] != "private"
                    || p["storedAccessPolicies"].as_array().is_some_and(|a| !a.is_empty())
            })
            .unwrap_or(false),
        _ => policy.is_some(),
    };
    json!({"bucket": bucket, "exists": exists, "policy": policy})
}

fn gcs_unavailable(st: &FakeState, provider: &str) -> bool {
    provider == "gcp_gcs" && st.faults.gcs_iam_unavailable
}

async fn get_policy(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
) -> Response {
    let profile = match admit(&state, &headers, format!("GET /buckets/{}/policy", bucket)) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let st = state.lock().unwrap();
    let provider = provider_of(&st, &profile).unwrap_or_default();
    if gcs_unavailable(&st, &provider) {
        return error_response(StatusCode::NOT_IMPLEMENTED, "not_implemented", "no IAM");
    }
    Json(policy_envelope(&st, &provider, &bucket)).into_response()
}

async fn put_policy(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let profile = match admit(&state, &headers, format!("PUT /buckets/{}/policy", bucket)) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let mut st = state.lock().unwrap();
    let provider = provider_of(&st, &profile).unwrap_or_default();
    if gcs_unavailable(&st, &provider) {
        return error_response(StatusCode::NOT_IMPLEMENTED, "not_implemented", "no IAM");
    }
    let mut policy = body["policy"].clone();
    if provider == "azure_blob" && st.faults.azure_drop_stored_policies {
        policy["storedAccessPolicies"] = json!([]);
    }
    st.policies.insert(bucket, policy);
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_policy(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
) -> Response {
    let profile = match admit(&state, &headers, format!("DELETE /buckets/{}/policy", bucket)) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let mut st = state.lock().unwrap();
    let provider = provider_of(&st, &profile).unwrap_or_default();
    if provider == "gcp_gcs" && !st.faults.gcs_delete_allowed {
        let code = st
            .faults
            .gcs_delete_code
            .clone()
            .unwrap_or_else(|| "bucket_policy_delete_unsupported".to_string());
        return error_response(StatusCode::BAD_REQUEST, &code, "delete is not supported");
    }
    let keep = match provider.as_str() {
        "azure_blob" => st.faults.azure_reset_noop,
        _ => st.faults.s3_policy_sticky,
    };
    if !keep {
        st.policies.remove(&bucket);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn validate_policy(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let profile = match admit(
        &state,
        &headers,
        format!("POST /buckets/{}/policy/validate", bucket),
    ) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let st = state.lock().unwrap();
    let provider = provider_of(&st, &profile).unwrap_or_default();
    if gcs_unavailable(&st, &provider) {
        return error_response(StatusCode::NOT_IMPLEMENTED, "not_implemented", "no IAM");
    }
    let ok = body.get("policy").is_some_and(Value::is_object);
    Json(json!({"ok": ok, "provider": provider, "errors": [], "warnings": []})).into_response()
}

async fn create_upload(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, "POST /uploads".into()) {
        return resp;
    }
    let bucket = body["bucket"].as_str().unwrap_or_default().to_string();
    let mut st = state.lock().unwrap();
    let id = st.next_id("upload");
    st.uploads.insert(id.clone(), (bucket, BTreeMap::new()));
    (
        StatusCode::CREATED,
        Json(json!({"uploadId": id, "mode": "staging", "expiresAt": "2099-01-01T00:00:00Z"})),
    )
        .into_response()
}

async fn stage_files(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    if let Err(resp) = admit(&state, &headers, format!("POST /uploads/{}/files", id)) {
        return resp;
    }
    let mut staged = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("files") {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", "unexpected field");
        }
        let name = field.file_name().unwrap_or("unnamed").to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid_request", "bad part"),
        };
        staged.push((name, bytes));
    }

    let mut st = state.lock().unwrap();
    let Some((_, files)) = st.uploads.get_mut(&id) else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "upload not found");
    };
    files.extend(staged);
    StatusCode::NO_CONTENT.into_response()
}

async fn commit_upload(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, format!("POST /uploads/{}/commit", id)) {
        return resp;
    }
    let mut st = state.lock().unwrap();
    let Some((bucket, files)) = st.uploads.remove(&id) else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "upload not found");
    };
    for (key, bytes) in files {
        st.objects.insert((bucket.clone(), key), bytes);
    }
    let job_id = st.next_id("job");
    st.jobs.insert(job_id.clone(), 0);
    (StatusCode::CREATED, Json(json!({"jobId": job_id}))).into_response()
}

async fn get_job(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, format!("GET /jobs/{}", id)) {
        return resp;
    }
    let mut st = state.lock().unwrap();
    let job_error = st.faults.job_error.clone();
    let Some(polls) = st.jobs.get_mut(&id) else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "job not found");
    };
    *polls += 1;
    let (status, error) = match *polls {
        1 => ("queued", None),
        2 => ("running", None),
        _ => match job_error {
            Some(err) => ("failed", Some(err)),
            None => ("succeeded", None),
        },
    };
    Json(json!({
        "id": id,
        "type": "transfer_sync_staging_to_bucket",
        "status": status,
        "error": error,
    }))
    .into_response()
}

async fn job_logs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, format!("GET /jobs/{}/logs", id)) {
        return resp;
    }
    state.lock().unwrap().job_log_requests += 1;
    let tail = query.get("tailBytes").cloned().unwrap_or_default();
    format!("copy failed: access denied\n(tailBytes={})\n", tail).into_response()
}

async fn download(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(
        &state,
        &headers,
        format!("GET /buckets/{}/objects/download", bucket),
    ) {
        return resp;
    }
    let key = query.get("key").cloned().unwrap_or_default();
    let st = state.lock().unwrap();
    match st.objects.get(&(bucket, key)) {
        Some(bytes) if st.faults.corrupt_downloads => {
            let mut corrupted = bytes.to_vec();
            corrupted.push(b'!');
            corrupted.into_response()
        }
        Some(bytes) => bytes.clone().into_response(),
        None => error_response(StatusCode::NOT_FOUND, "not_found", "object not found"),
    }
}

/// Short waits for driving a scenario without real backoff delays
pub fn fast_retries() -> storage_e2e::scenario::StageRetries {
    use storage_e2e::retry::RetryPolicy;
    storage_e2e::scenario::StageRetries {
        profile_test: RetryPolicy::new(15, Duration::from_millis(5)),
        ensure_bucket: RetryPolicy::new(10, Duration::from_millis(5)),
    }
}
