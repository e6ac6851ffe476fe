//! REST API client for the remote script executor.
//!
//! Wraps the executor's HTTP endpoints (script submission, task status,
//! cancellation) using [`reqwest`]. Every request is bounded by the
//! client-wide request timeout, which is independent of how long the
//! engine is willing to wait for a job overall.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use testbench_core::job::{JobResult, JobSpec, FAILURE_EXIT_CODE};

/// Submission endpoint, relative to the executor base URL.
pub const EXECUTE_PATH: &str = "/server/script/execute";

/// Status endpoint prefix; the task id is appended.
pub const STATUS_PATH: &str = "/server/script/status";

/// Cancellation endpoint prefix; the task id is appended.
pub const CANCEL_PATH: &str = "/server/script/cancel";

/// HTTP client for one executor deployment.
pub struct ExecutorApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the executor REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The executor returned a non-2xx status code.
    #[error("Executor API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of a submission request.
#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    script_name: &'a str,
    host_name: &'a str,
    device_id: &'a str,
    parameters: WireParameters<'a>,
}

/// Parameters as the executor expects them. The tracker's timing profile
/// stays local.
#[derive(Debug, Serialize)]
struct WireParameters<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    userinterface_name: Option<&'a str>,
    args: &'a [String],
    env: &'a BTreeMap<String, String>,
}

impl<'a> ExecuteRequest<'a> {
    fn from_spec(spec: &'a JobSpec) -> Self {
        Self {
            script_name: &spec.script_name,
            host_name: &spec.target_host,
            device_id: &spec.target_device,
            parameters: WireParameters {
                userinterface_name: spec.parameters.userinterface_name.as_deref(),
                args: &spec.parameters.args,
                env: &spec.parameters.env,
            },
        }
    }
}

/// Output of a finished script run as reported by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawOutput {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub report_url: Option<String>,
    /// Executor-measured run time, when the executor reports one.
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    /// Rejection message, e.g. when the target device is locked.
    #[serde(default)]
    pub error: Option<String>,
}

impl RawOutput {
    /// Convert into a [`JobResult`], falling back to the locally measured
    /// elapsed time when the executor did not report one.
    ///
    /// A failure always carries a readable `stderr` and a nonzero exit
    /// code, even when the executor only sent an `error` message.
    pub fn into_job_result(self, elapsed_ms: u64) -> JobResult {
        let (mut stderr, mut exit_code) = (self.stderr, self.exit_code);
        if !self.success {
            if stderr.is_empty() {
                stderr = self
                    .error
                    .unwrap_or_else(|| "executor reported failure without output".to_string());
            }
            if exit_code == 0 {
                exit_code = FAILURE_EXIT_CODE;
            }
        }

        JobResult::from_output(
            self.success,
            self.stdout,
            stderr,
            exit_code,
            self.report_url,
            self.execution_time_ms.unwrap_or(elapsed_ms),
        )
    }
}

/// Response of the submission endpoint: either an async task handle or,
/// when the executor ran the script inline, its final output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    Task { task_id: String },
    Finished(RawOutput),
}

/// Response of the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusResponse {
    /// `"started"`, `"completed"` or `"failed"`; anything else is treated
    /// as still running.
    pub status: String,
    #[serde(default)]
    pub result: Option<RawOutput>,
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl ExecutorApi {
    /// Create a new API client with a per-request timeout.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:6109`.
    pub fn new(api_url: String, request_timeout: Duration) -> Result<Self, ExecutorApiError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base HTTP URL this client talks to.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a script for execution.
    ///
    /// Sends `POST /server/script/execute`. Returns a task id for async
    /// runs, or the final output when the executor ran the script inline.
    pub async fn execute(&self, spec: &JobSpec) -> Result<SubmitResponse, ExecutorApiError> {
        let response = self
            .client
            .post(format!("{}{EXECUTE_PATH}", self.api_url))
            .json(&ExecuteRequest::from_spec(spec))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the status of a submitted task.
    ///
    /// Sends `GET /server/script/status/{task_id}`.
    pub async fn status(&self, task_id: &str) -> Result<StatusResponse, ExecutorApiError> {
        let response = self
            .client
            .get(format!("{}{STATUS_PATH}/{task_id}", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Ask the executor to stop a task.
    ///
    /// Sends `POST /server/script/cancel/{task_id}`. Best-effort: the
    /// remote process may keep running after this returns.
    pub async fn cancel(&self, task_id: &str) -> Result<(), ExecutorApiError> {
        let response = self
            .client
            .post(format!("{}{CANCEL_PATH}/{task_id}", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ExecutorApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ExecutorApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ExecutorApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExecutorApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ExecutorApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use testbench_core::job::{FailureKind, JobParameters, PollProfileKind};

    use super::*;

    #[test]
    fn submit_response_task() {
        let parsed: SubmitResponse =
            serde_json::from_str(r#"{"task_id": "abc-123", "message": "queued"}"#).unwrap();
        assert_matches!(parsed, SubmitResponse::Task { task_id } if task_id == "abc-123");
    }

    #[test]
    fn submit_response_inline_result() {
        let parsed: SubmitResponse = serde_json::from_str(
            r#"{"success": true, "stdout": "SCRIPT_SUCCESS:true", "stderr": "", "exit_code": 0}"#,
        )
        .unwrap();
        assert_matches!(parsed, SubmitResponse::Finished(out) if out.success && out.exit_code == 0);
    }

    #[test]
    fn status_response_shapes() {
        let started: StatusResponse = serde_json::from_str(r#"{"status": "started"}"#).unwrap();
        assert_eq!(started.status, "started");
        assert!(started.result.is_none());

        let failed: StatusResponse =
            serde_json::from_str(r#"{"status": "failed", "error": "device busy"}"#).unwrap();
        assert_eq!(failed.error.as_deref(), Some("device busy"));
    }

    #[test]
    fn raw_output_conversion_prefers_executor_timing() {
        let out = RawOutput {
            success: true,
            stdout: "SCRIPT_SUCCESS:false".into(),
            execution_time_ms: Some(42),
            ..Default::default()
        };
        let result = out.into_job_result(1000);
        assert!(result.success);
        assert_eq!(result.script_success, Some(false));
        assert_eq!(result.execution_time_ms, 42);
    }

    #[test]
    fn raw_output_nonzero_exit_is_failure() {
        let out = RawOutput {
            success: true,
            exit_code: 2,
            ..Default::default()
        };
        let result = out.into_job_result(7);
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::ExecutorReported));
        assert_eq!(result.execution_time_ms, 7);
    }

    #[test]
    fn inline_rejection_keeps_executor_message() {
        let parsed: SubmitResponse = serde_json::from_str(
            r#"{"success": false, "error": "Device device1 is locked by another session"}"#,
        )
        .unwrap();
        let out = assert_matches!(parsed, SubmitResponse::Finished(out) => out);

        let result = out.into_job_result(3);
        assert!(!result.success);
        assert!(result.stderr.contains("locked"), "stderr: {}", result.stderr);
        assert_eq!(result.exit_code, FAILURE_EXIT_CODE);
        assert_eq!(result.failure, Some(FailureKind::ExecutorReported));
    }

    #[test]
    fn failed_output_keeps_script_stderr_and_exit_code() {
        let out = RawOutput {
            success: false,
            stderr: "assertion failed".into(),
            exit_code: 4,
            error: Some("ignored".into()),
            ..Default::default()
        };
        let result = out.into_job_result(0);
        assert_eq!(result.stderr, "assertion failed");
        assert_eq!(result.exit_code, 4);
    }

    #[test]
    fn request_body_omits_local_profile() {
        let spec = JobSpec::new("j1", "goto.py", "pi-1", "device2").with_parameters(JobParameters {
            userinterface_name: Some("horizon_android_mobile".into()),
            args: vec!["live".into()],
            env: BTreeMap::new(),
            profile: PollProfileKind::Short,
        });
        let body = serde_json::to_value(ExecuteRequest::from_spec(&spec)).unwrap();
        assert_eq!(body["script_name"], "goto.py");
        assert_eq!(body["host_name"], "pi-1");
        assert_eq!(body["device_id"], "device2");
        assert_eq!(body["parameters"]["args"][0], "live");
        assert!(body["parameters"].get("profile").is_none());
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let api = ExecutorApi::with_client(reqwest::Client::new(), "http://host:6109/".into());
        assert_eq!(api.api_url(), "http://host:6109");
    }
}
