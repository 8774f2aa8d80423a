use slurmgate_runner::clients::{
    Clients, JobClient, JobOutput, RemoteJobClient, SimulatedJobClient,
};
use slurmgate_runner::clock::{RetryPolicy, VirtualClock};
use slurmgate_runner::config::{PollingConfig, RunnerConfig};
use slurmgate_runner::interrupt::Cancellation;
use slurmgate_runner::monitor::Monitor;
use slurmgate_runner::pipeline::{Pipeline, RunOutcome};
use slurmgate_runner::session::fake::FakeSession;
use slurmgate_runner::session::CommandOutput;
use slurmgate_runner::state::JobState;
use std::sync::Arc;
use std::time::Duration;

fn script(text: &'static str) -> impl Fn(&str) -> Result<String, String> {
    move |_: &str| Ok(text.to_string())
}

#[test]
fn test_simulated_job_end_to_end() {
    let clock = VirtualClock::shared();
    let client = Clients::load(&RunnerConfig::simulated(), clock.clone()).unwrap();
    let monitor = Monitor::new(&PollingConfig::default(), clock.clone());
    let generator = script("#!/bin/bash\npython3 -c 'print(6 * 7)'\n");

    let outcome = Pipeline::new(&generator, &client, &monitor).run(
        "answer",
        |_| true,
        &Cancellation::new(),
    );

    assert_eq!(
        outcome,
        RunOutcome::Finished {
            job: "1000".to_string(),
            state: JobState::Completed,
            output: Some(JobOutput::Ready("Result: 42 (Mock Output)".to_string())),
        }
    );
    // polled at 0s, 2s, 4s and 6s
    assert_eq!(clock.elapsed(), Duration::from_secs(6));
}

#[test]
fn test_simulated_ids_are_client_local() {
    let clock = VirtualClock::shared();
    let first = SimulatedJobClient::new(clock.clone());
    let second = SimulatedJobClient::new(clock);

    let job = first.submit("echo hi").unwrap();

    assert_eq!(first.poll_status(&job), JobState::Pending);
    assert_eq!(second.poll_status(&job), JobState::Unknown);
}

#[test]
fn test_remote_job_end_to_end() {
    let session = Arc::new(
        FakeSession::new()
            .respond("sbatch", CommandOutput::ok("Submitted batch job 4242\n"))
            .respond_sequence(
                "squeue",
                vec![
                    CommandOutput::ok("PENDING\n"),
                    CommandOutput::ok("RUNNING\n"),
                    CommandOutput::ok(""),
                ],
            )
            .respond("sacct", CommandOutput::ok("COMPLETED\n")),
    );
    session.put_file("result-4242.txt", "Hello from node01! The sum of 50 + 50 is 100\n");
    let clock = VirtualClock::shared();
    let client = RemoteJobClient::new(session.clone(), RetryPolicy::default(), clock.clone());
    let monitor = Monitor::new(&PollingConfig::default(), clock);
    let generator =
        script("#!/bin/bash\n#SBATCH --output=result-%j.txt\npython3 -c 'print(50 + 50)'\n");

    let outcome =
        Pipeline::new(&generator, &client, &monitor).run("add", |_| true, &Cancellation::new());

    match outcome {
        RunOutcome::Finished {
            job,
            state: JobState::Completed,
            output: Some(JobOutput::Ready(output)),
        } => {
            assert_eq!(job, "4242");
            assert!(output.contains("100"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_failed_jobs_skip_output_retrieval() {
    let session = Arc::new(
        FakeSession::new()
            .respond("sbatch", CommandOutput::ok("Submitted batch job 5\n"))
            .respond("squeue", CommandOutput::ok("FAILED\n")),
    );
    let clock = VirtualClock::shared();
    let client = RemoteJobClient::new(session.clone(), RetryPolicy::default(), clock.clone());
    let monitor = Monitor::new(&PollingConfig::default(), clock);
    let generator = script("exit 1");

    let outcome =
        Pipeline::new(&generator, &client, &monitor).run("fail", |_| true, &Cancellation::new());

    assert_eq!(
        outcome,
        RunOutcome::Finished {
            job: "5".to_string(),
            state: JobState::Failed,
            output: None,
        }
    );
    assert!(session.reads().is_empty());
}

#[test]
fn test_rejected_submission_is_reported() {
    let session = Arc::new(FakeSession::new().respond(
        "sbatch",
        CommandOutput::failed(1, "sbatch: error: Batch job submission failed"),
    ));
    let clock = VirtualClock::shared();
    let client = RemoteJobClient::new(session, RetryPolicy::default(), clock.clone());
    let monitor = Monitor::new(&PollingConfig::default(), clock);
    let generator = script("echo hi");

    let outcome =
        Pipeline::new(&generator, &client, &monitor).run("x", |_| true, &Cancellation::new());

    assert!(matches!(
        outcome,
        RunOutcome::SubmissionFailed(ref reason) if reason.contains("Batch job submission failed")
    ));
}

#[test]
fn test_interrupt_at_prompt_issues_no_sbatch() {
    let session = Arc::new(
        FakeSession::new().respond("sbatch", CommandOutput::ok("Submitted batch job 8\n")),
    );
    let clock = VirtualClock::shared();
    let client = RemoteJobClient::new(session.clone(), RetryPolicy::default(), clock.clone());
    let monitor = Monitor::new(&PollingConfig::default(), clock);
    let generator = script("echo hi");
    let cancel = Cancellation::new();
    let interrupt = cancel.clone();

    let outcome = Pipeline::new(&generator, &client, &monitor).run(
        "x",
        |_| {
            interrupt.cancel();
            true
        },
        &cancel,
    );

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(session.commands().is_empty());
    assert!(client.registry().is_empty());
}
