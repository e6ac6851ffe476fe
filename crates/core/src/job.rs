//! Job specifications, lifecycle states, and results.
//!
//! A [`JobSpec`] describes one remote script run. The engine drives it
//! through [`JobState`] and always ends with exactly one [`JobResult`].
//! Every expected failure mode (submission error, executor-reported
//! failure, timeout, cancellation) is a `JobResult` with `success == false`
//! and a [`FailureKind`] code, never an `Err`.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::JobId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Prefix of the stdout line a script prints to report its own verdict,
/// e.g. `SCRIPT_SUCCESS:true`.
pub const SUCCESS_MARKER: &str = "SCRIPT_SUCCESS:";

/// Exit code reported for every locally synthesized failure.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// `stderr` of a job whose poll loop exceeded its max wait.
pub const TIMED_OUT_MESSAGE: &str = "execution timed out";

/// `stderr` of a job that stopped being tracked because of cancellation.
pub const CANCELLED_MESSAGE: &str = "execution cancelled";

/// Maximum length of a script name.
const MAX_SCRIPT_NAME_LEN: usize = 256;

/// Maximum number of positional script arguments.
const MAX_ARGS: usize = 64;

// ---------------------------------------------------------------------------
// Job specification
// ---------------------------------------------------------------------------

/// Which timing profile the job tracker applies to a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollProfileKind {
    /// Long-running test scripts (default 10 s interval, 2 h max wait).
    #[default]
    LongRunning,
    /// Short confirmatory scripts (default 2 s interval, 5 min max wait).
    Short,
}

/// Typed parameters forwarded to the remote executor with a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    /// Navigation interface the script should load, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinterface_name: Option<String>,
    /// Positional arguments appended to the script invocation.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the script process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Tracker timing profile. Local only, never sent to the executor.
    #[serde(default)]
    pub profile: PollProfileKind,
}

/// Immutable description of one script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub script_name: String,
    pub target_host: String,
    pub target_device: String,
    #[serde(default)]
    pub parameters: JobParameters,
}

impl JobSpec {
    /// Build a spec with default parameters.
    pub fn new(
        id: impl Into<JobId>,
        script_name: impl Into<String>,
        target_host: impl Into<String>,
        target_device: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            script_name: script_name.into(),
            target_host: target_host.into(),
            target_device: target_device.into(),
            parameters: JobParameters::default(),
        }
    }

    /// Replace the parameters of this spec.
    pub fn with_parameters(mut self, parameters: JobParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a single tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submission requested, no task id received yet.
    Pending,
    /// The executor accepted the job and is running it.
    Started,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    /// Whether no further transition can happen from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Human-readable label for display.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Started => "Started",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::TimedOut => "Timed Out",
        }
    }
}

/// Why a job did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport or HTTP failure before a task existed.
    Submission,
    /// The remote script ran and failed, or the executor reported failure.
    ExecutorReported,
    /// The tracker's max wait elapsed before a terminal state was observed.
    Timeout,
    /// The caller stopped waiting for the job.
    Cancelled,
    /// The local task tracking the job died before producing a result.
    Internal,
}

impl FailureKind {
    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            Self::Submission => "SUBMISSION_ERROR",
            Self::ExecutorReported => "EXECUTOR_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Process-level success. Always `false` when `exit_code != 0`.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
    /// The script's own verdict from its success marker. May disagree
    /// with `success`; it is reported as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_success: Option<bool>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl JobResult {
    /// Result built from output the executor returned for a finished run.
    ///
    /// `success` is cleared when the exit code is non-zero, and
    /// `script_success` is read from the stdout marker.
    pub fn from_output(
        success: bool,
        stdout: String,
        stderr: String,
        exit_code: i32,
        report_url: Option<String>,
        execution_time_ms: u64,
    ) -> Self {
        let success = success && exit_code == 0;
        let script_success = extract_script_success(&stdout);
        Self {
            success,
            stdout,
            stderr,
            exit_code,
            report_url,
            script_success,
            execution_time_ms,
            failure: (!success).then_some(FailureKind::ExecutorReported),
        }
    }

    /// Locally synthesized failure with exit code 1 and empty stdout.
    pub fn failed(kind: FailureKind, stderr: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: FAILURE_EXIT_CODE,
            report_url: None,
            script_success: None,
            execution_time_ms,
            failure: Some(kind),
        }
    }

    pub fn timed_out(execution_time_ms: u64) -> Self {
        Self::failed(FailureKind::Timeout, TIMED_OUT_MESSAGE, execution_time_ms)
    }

    pub fn cancelled(execution_time_ms: u64) -> Self {
        Self::failed(FailureKind::Cancelled, CANCELLED_MESSAGE, execution_time_ms)
    }

    /// Terminal [`JobState`] this result corresponds to.
    pub fn terminal_state(&self) -> JobState {
        match self.failure {
            Some(FailureKind::Timeout) => JobState::TimedOut,
            _ if self.success => JobState::Completed,
            _ => JobState::Failed,
        }
    }
}

/// Extract the script's own verdict from its stdout.
///
/// Looks for lines of the form `SCRIPT_SUCCESS:<true|false>`; the last
/// well-formed marker wins. Returns `None` when no marker is present.
pub fn extract_script_success(stdout: &str) -> Option<bool> {
    stdout.lines().rev().find_map(|line| {
        let value = line.trim().strip_prefix(SUCCESS_MARKER)?.trim();
        if value.eq_ignore_ascii_case("true") {
            Some(true)
        } else if value.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate one job spec before anything is sent to the executor.
///
/// Rules:
/// - `id`, `script_name`, `target_host`, `target_device` must be non-empty.
/// - `script_name` must not exceed `MAX_SCRIPT_NAME_LEN` characters and may
///   only contain alphanumeric, `-`, `_`, `.` or `/` characters.
/// - At most `MAX_ARGS` arguments, none empty.
/// - Environment keys must be non-empty and must not contain `=`.
pub fn validate_job_spec(spec: &JobSpec) -> Result<(), CoreError> {
    for (field, value) in [
        ("id", &spec.id),
        ("script_name", &spec.script_name),
        ("target_host", &spec.target_host),
        ("target_device", &spec.target_device),
    ] {
        if value.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Job field '{field}' must not be empty"
            )));
        }
    }

    if spec.script_name.len() > MAX_SCRIPT_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Script name must not exceed {MAX_SCRIPT_NAME_LEN} characters"
        )));
    }
    if !spec
        .script_name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(CoreError::Validation(format!(
            "Script name '{}' contains invalid characters",
            spec.script_name
        )));
    }

    let params = &spec.parameters;
    if params.args.len() > MAX_ARGS {
        return Err(CoreError::Validation(format!(
            "A job may have at most {MAX_ARGS} arguments"
        )));
    }
    if let Some(i) = params.args.iter().position(|a| a.is_empty()) {
        return Err(CoreError::Validation(format!(
            "Argument at index {i} must not be empty"
        )));
    }
    for key in params.env.keys() {
        if key.is_empty() || key.contains('=') {
            return Err(CoreError::Validation(format!(
                "Invalid environment variable name: \"{key}\""
            )));
        }
    }

    Ok(())
}

/// Validate every spec of a batch and require unique ids.
pub fn validate_batch(specs: &[JobSpec]) -> Result<(), CoreError> {
    let mut seen = HashSet::with_capacity(specs.len());
    for spec in specs {
        validate_job_spec(spec)?;
        if !seen.insert(spec.id.as_str()) {
            return Err(CoreError::Validation(format!(
                "Duplicate job id in batch: \"{}\"",
                spec.id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn spec(id: &str) -> JobSpec {
        JobSpec::new(id, "validation.py", "host-1", "device-1")
    }

    #[test]
    fn marker_true_and_false() {
        assert_eq!(extract_script_success("SCRIPT_SUCCESS:true"), Some(true));
        assert_eq!(extract_script_success("SCRIPT_SUCCESS:False\n"), Some(false));
    }

    #[test]
    fn marker_last_one_wins() {
        let out = "step 1\nSCRIPT_SUCCESS:true\nretrying\n  SCRIPT_SUCCESS: false  \n";
        assert_eq!(extract_script_success(out), Some(false));
    }

    #[test]
    fn marker_absent_or_malformed() {
        assert_eq!(extract_script_success("all good\n"), None);
        assert_eq!(extract_script_success("SCRIPT_SUCCESS:maybe"), None);
    }

    #[test]
    fn nonzero_exit_forces_failure() {
        let result = JobResult::from_output(
            true,
            "SCRIPT_SUCCESS:true".into(),
            String::new(),
            3,
            None,
            10,
        );
        assert!(!result.success);
        // The script's verdict is surfaced untouched.
        assert_eq!(result.script_success, Some(true));
        assert_eq!(result.failure, Some(FailureKind::ExecutorReported));
        assert_eq!(result.terminal_state(), JobState::Failed);
    }

    #[test]
    fn clean_output_is_completed() {
        let result = JobResult::from_output(true, "ok".into(), String::new(), 0, None, 5);
        assert!(result.success);
        assert!(result.failure.is_none());
        assert_eq!(result.terminal_state(), JobState::Completed);
    }

    #[test]
    fn timeout_shape() {
        let result = JobResult::timed_out(7_200_000);
        assert!(!result.success);
        assert_eq!(result.exit_code, FAILURE_EXIT_CODE);
        assert_eq!(result.stderr, TIMED_OUT_MESSAGE);
        assert_eq!(result.terminal_state(), JobState::TimedOut);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Started.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::TimedOut.is_terminal());
    }

    #[test]
    fn valid_spec_passes() {
        let mut s = spec("a");
        s.parameters.args = vec!["--max-iteration".into(), "3".into()];
        s.parameters.env.insert("LOG_LEVEL".into(), "debug".into());
        assert!(validate_job_spec(&s).is_ok());
    }

    #[test]
    fn empty_fields_rejected() {
        let mut s = spec("a");
        s.target_device = "  ".into();
        assert_matches!(
            validate_job_spec(&s),
            Err(CoreError::Validation(msg)) if msg.contains("target_device")
        );
    }

    #[test]
    fn script_name_characters() {
        let mut s = spec("a");
        s.script_name = "rm -rf".into();
        assert_matches!(validate_job_spec(&s), Err(CoreError::Validation(_)));
        s.script_name = "suite/goto_live.py".into();
        assert!(validate_job_spec(&s).is_ok());
    }

    #[test]
    fn bad_env_key_rejected() {
        let mut s = spec("a");
        s.parameters.env.insert("A=B".into(), "x".into());
        assert_matches!(validate_job_spec(&s), Err(CoreError::Validation(_)));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let batch = vec![spec("a"), spec("b"), spec("a")];
        assert_matches!(
            validate_batch(&batch),
            Err(CoreError::Validation(msg)) if msg.contains("\"a\"")
        );
    }

    #[test]
    fn parameters_deserialize_with_defaults() {
        let s: JobSpec = serde_json::from_value(serde_json::json!({
            "id": "j1",
            "script_name": "zap.py",
            "target_host": "pi-2",
            "target_device": "device1"
        }))
        .expect("spec should deserialize");
        assert_eq!(s.parameters, JobParameters::default());
        assert_eq!(s.parameters.profile, PollProfileKind::LongRunning);
    }
}
