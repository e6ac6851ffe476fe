mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use common::{failure_output, job, success_output, tracker_config, MockExecutor, Outcome, Script};
use testbench_core::job::{FailureKind, JobParameters, JobResult, JobState, PollProfileKind};
use testbench_engine::config::{PollProfile, TrackerConfig};
use testbench_engine::tracker::JobTracker;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn tracker(executor: &Arc<MockExecutor>, max_wait_secs: u64) -> JobTracker {
    JobTracker::new(executor.clone(), tracker_config(max_wait_secs))
}

#[tokio::test(start_paused = true)]
async fn completion_callback_fires_exactly_once() {
    let executor = MockExecutor::new();
    executor.script(
        "j1",
        Script::Task {
            polls: 2,
            outcome: Outcome::Completed(success_output()),
        },
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let result = tracker(&executor, 60)
        .start(
            &job("j1"),
            &CancellationToken::new(),
            Some(Box::new(move |r: &JobResult| {
                assert!(r.success);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await;

    assert!(result.success);
    assert_eq!(result.script_success, Some(true));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.poll_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn submission_error_resolves_without_polling() {
    let executor = MockExecutor::new();
    executor.script("j1", Script::SubmitError);

    let result = tracker(&executor, 60)
        .start(&job("j1"), &CancellationToken::new(), None)
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.failure, Some(FailureKind::Submission));
    assert!(result.stderr.contains("host unreachable"));
    assert_eq!(executor.poll_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn inline_result_is_used_directly() {
    let executor = MockExecutor::new();
    let mut output = success_output();
    output.stdout = "step 1 ok\nSCRIPT_SUCCESS:false\n".into();
    executor.script("j1", Script::Inline(output));

    let result = tracker(&executor, 60)
        .start(&job("j1"), &CancellationToken::new(), None)
        .await;

    assert!(result.success);
    assert_eq!(result.script_success, Some(false));
    assert_eq!(executor.poll_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn executor_reported_failure() {
    let executor = MockExecutor::new();
    executor.script(
        "j1",
        Script::Task {
            polls: 0,
            outcome: Outcome::Failed("adb device offline".into()),
        },
    );

    let result = tracker(&executor, 60)
        .start(&job("j1"), &CancellationToken::new(), None)
        .await;

    assert_eq!(result.failure, Some(FailureKind::ExecutorReported));
    assert_eq!(result.stderr, "adb device offline");
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.terminal_state(), JobState::Failed);
}

#[tokio::test(start_paused = true)]
async fn nonzero_exit_forces_failure() {
    let executor = MockExecutor::new();
    let mut output = failure_output(3);
    output.success = true;
    executor.script(
        "j1",
        Script::Task {
            polls: 1,
            outcome: Outcome::Completed(output),
        },
    );

    let result = tracker(&executor, 60)
        .start(&job("j1"), &CancellationToken::new(), None)
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.failure, Some(FailureKind::ExecutorReported));
}

#[tokio::test(start_paused = true)]
async fn times_out_after_max_wait() {
    let executor = MockExecutor::new();
    executor.script("j1", Script::Hang);
    let started = Instant::now();

    let result = tracker(&executor, 2)
        .start(&job("j1"), &CancellationToken::new(), None)
        .await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "resolved early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "resolved late: {elapsed:?}");
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert_eq!(result.stderr, "execution timed out");
    assert_eq!(result.terminal_state(), JobState::TimedOut);
    assert_eq!(executor.poll_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn last_poll_lands_on_max_wait() {
    let executor = MockExecutor::new();
    executor.script("j1", Script::Hang);
    let profile = PollProfile {
        poll_interval: Duration::from_secs(10),
        max_wait: Duration::from_secs(15),
    };
    let config = TrackerConfig {
        long_running: profile,
        short: profile,
    };
    let started = Instant::now();

    let result = JobTracker::new(executor.clone(), config)
        .start(&job("j1"), &CancellationToken::new(), None)
        .await;

    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(executor.poll_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn poll_errors_are_retried_until_max_wait() {
    let executor = MockExecutor::new();
    executor.script("j1", Script::Vanish);

    let result = tracker(&executor, 4)
        .start(&job("j1"), &CancellationToken::new(), None)
        .await;

    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert_eq!(executor.poll_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn cancellation_sends_remote_cancel() {
    let executor = MockExecutor::new();
    executor.script("j1", Script::Hang);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3500)).await;
        trigger.cancel();
    });

    let result = tracker(&executor, 60).start(&job("j1"), &cancel, None).await;

    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    assert_eq!(result.stderr, "execution cancelled");
    assert_eq!(executor.cancelled(), vec!["j1".to_string()]);
    assert_eq!(executor.poll_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn already_cancelled_job_is_never_submitted() {
    let executor = MockExecutor::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = tracker(&executor, 60).start(&job("j1"), &cancel, None).await;

    assert_matches!(result.failure, Some(FailureKind::Cancelled));
    assert!(executor.submitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn observer_sees_pending_then_started() {
    let executor = MockExecutor::new();
    let states = Mutex::new(Vec::new());
    let observer = |state: JobState| states.lock().unwrap().push(state);

    tracker(&executor, 60)
        .start_observed(&job("j1"), &CancellationToken::new(), Some(&observer), None)
        .await;

    assert_eq!(*states.lock().unwrap(), vec![JobState::Pending, JobState::Started]);
}

#[tokio::test(start_paused = true)]
async fn short_profile_uses_its_own_timing() {
    let executor = MockExecutor::new();
    executor.script("quick", Script::Hang);
    let config = TrackerConfig {
        long_running: PollProfile {
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(100),
        },
        short: PollProfile {
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(3),
        },
    };
    let spec = job("quick").with_parameters(JobParameters {
        profile: PollProfileKind::Short,
        ..Default::default()
    });
    let started = Instant::now();

    let result = JobTracker::new(executor.clone(), config)
        .start(&spec, &CancellationToken::new(), None)
        .await;

    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(4));
}
