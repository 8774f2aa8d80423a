use slurmgate_runner::clients::{
    ClientError, JobClient, JobOutput, RemoteJobClient, SubmissionError,
};
use slurmgate_runner::clock::{RetryPolicy, VirtualClock};
use slurmgate_runner::protocol::ParseError;
use slurmgate_runner::session::fake::FakeSession;
use slurmgate_runner::session::CommandOutput;
use slurmgate_runner::state::JobState;
use std::sync::Arc;
use std::time::Duration;

const SCRIPT: &str = "#!/bin/bash\n#SBATCH --job-name=t\necho hi\n";

type FakeClient = RemoteJobClient<Arc<FakeSession>>;

/// Client over a fake session that accepts every submission as job 12345
fn setup(session: FakeSession) -> (Arc<FakeSession>, Arc<VirtualClock>, FakeClient) {
    let session = Arc::new(
        session.respond("sbatch", CommandOutput::ok("Submitted batch job 12345\n")),
    );
    let clock = VirtualClock::shared();
    let client = RemoteJobClient::new(session.clone(), RetryPolicy::default(), clock.clone());

    (session, clock, client)
}

fn count(session: &FakeSession, prefix: &str) -> usize {
    session
        .commands()
        .iter()
        .filter(|command| command.starts_with(prefix))
        .count()
}

#[test]
fn test_submit_uploads_script_and_parses_id() {
    let (session, _, client) = setup(FakeSession::new());

    let job = client.submit(SCRIPT).unwrap();

    assert_eq!(job, "12345");
    let commands = session.commands();
    assert_eq!(commands.len(), 1);
    let script_name = commands[0]
        .strip_prefix("sbatch '")
        .and_then(|rest| rest.strip_suffix('\''))
        .unwrap();
    assert!(script_name.starts_with("job_") && script_name.ends_with(".sh"));
    assert_eq!(session.file(script_name), Some(SCRIPT.as_bytes().to_vec()));
}

#[test]
fn test_rejected_submission_carries_stderr() {
    let session = Arc::new(
        FakeSession::new().respond(
            "sbatch",
            CommandOutput::failed(1, "sbatch: error: invalid partition"),
        ),
    );
    let client = RemoteJobClient::new(session, RetryPolicy::default(), VirtualClock::shared());

    match client.submit(SCRIPT) {
        Err(ClientError::Submission(SubmissionError::Rejected { status, stderr })) => {
            assert_eq!(status, Some(1));
            assert!(stderr.contains("invalid partition"));
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(client.registry().is_empty());
}

#[test]
fn test_unparseable_submission_response() {
    let session = Arc::new(FakeSession::new().respond("sbatch", CommandOutput::ok("\n")));
    let client = RemoteJobClient::new(session, RetryPolicy::default(), VirtualClock::shared());

    assert!(matches!(
        client.submit(SCRIPT),
        Err(ClientError::Submission(SubmissionError::Unparseable {
            source: ParseError::Empty,
            ..
        }))
    ));
}

#[test]
fn test_failed_upload_skips_sbatch() {
    let (session, _, client) = setup(FakeSession::new().fail_writes("disk quota exceeded"));

    assert!(matches!(
        client.submit(SCRIPT),
        Err(ClientError::Submission(SubmissionError::Upload { .. }))
    ));
    assert!(session.commands().is_empty());
}

#[test]
fn test_reused_id_is_rejected() {
    let (_, _, client) = setup(FakeSession::new());

    client.submit(SCRIPT).unwrap();

    assert!(matches!(
        client.submit(SCRIPT),
        Err(ClientError::Submission(SubmissionError::DuplicateId(ref id))) if id == "12345"
    ));
}

#[test]
fn test_empty_script_is_not_uploaded() {
    let (session, _, client) = setup(FakeSession::new());

    assert!(matches!(
        client.submit(""),
        Err(ClientError::Submission(SubmissionError::EmptyScript))
    ));
    assert!(session.commands().is_empty());
}

#[test]
fn test_queue_then_accounting() {
    let (session, _, client) = setup(
        FakeSession::new()
            .respond_sequence(
                "squeue",
                vec![
                    CommandOutput::ok("PENDING\n"),
                    CommandOutput::ok("RUNNING\n"),
                    CommandOutput::ok(""),
                ],
            )
            .respond("sacct", CommandOutput::ok("COMPLETED\nCOMPLETED\n")),
    );
    let job = client.submit(SCRIPT).unwrap();

    assert_eq!(client.poll_status(&job), JobState::Pending);
    assert_eq!(client.poll_status(&job), JobState::Running);
    assert_eq!(count(&session, "sacct"), 0);
    assert_eq!(client.poll_status(&job), JobState::Completed);
    assert_eq!(count(&session, "sacct"), 1);

    // terminal states are served from the cache
    let issued = session.commands().len();
    assert_eq!(client.poll_status(&job), JobState::Completed);
    assert_eq!(session.commands().len(), issued);
}

#[test]
fn test_failed_queue_query_falls_through_to_accounting() {
    let (_, _, client) = setup(
        FakeSession::new()
            .respond(
                "squeue",
                CommandOutput::failed(1, "slurm_load_jobs error: Invalid job id specified"),
            )
            .respond("sacct", CommandOutput::ok("    FAILED \n")),
    );
    let job = client.submit(SCRIPT).unwrap();

    assert_eq!(client.poll_status(&job), JobState::Failed);
}

#[test]
fn test_job_missing_everywhere_is_assumed_completed() {
    let (_, _, client) = setup(
        FakeSession::new()
            .respond("squeue", CommandOutput::ok(""))
            .respond("sacct", CommandOutput::ok("")),
    );
    let job = client.submit(SCRIPT).unwrap();

    assert_eq!(client.poll_status(&job), JobState::Completed);
}

#[test]
fn test_states_never_move_backwards() {
    let (_, _, client) = setup(FakeSession::new().respond_sequence(
        "squeue",
        vec![
            CommandOutput::ok("RUNNING\n"),
            CommandOutput::ok("PENDING\n"),
            CommandOutput::ok("RUNNING\n"),
        ],
    ));
    let job = client.submit(SCRIPT).unwrap();

    assert_eq!(client.poll_status(&job), JobState::Running);
    assert_eq!(client.poll_status(&job), JobState::Running);
    assert_eq!(client.poll_status(&job), JobState::Running);
}

#[test]
fn test_unknown_id_issues_no_commands() {
    let (session, _, client) = setup(FakeSession::new());

    assert_eq!(client.poll_status("999"), JobState::Unknown);
    assert!(matches!(client.fetch_output("999"), JobOutput::Error(_)));
    assert!(session.commands().is_empty());
    assert!(session.reads().is_empty());
}

#[test]
fn test_lost_session_keeps_last_state() {
    let (session, _, client) =
        setup(FakeSession::new().respond("squeue", CommandOutput::ok("RUNNING\n")));
    let job = client.submit(SCRIPT).unwrap();
    assert_eq!(client.poll_status(&job), JobState::Running);

    session.disconnect();

    assert_eq!(client.poll_status(&job), JobState::Running);
}

#[test]
fn test_missing_output_is_bounded() {
    let (_, clock, client) = setup(FakeSession::new());
    let job = client.submit(SCRIPT).unwrap();

    let output = client.fetch_output(&job);

    assert_eq!(
        output,
        JobOutput::NotYetAvailable {
            file: "slurm-12345.out".to_string(),
            attempts: 10
        }
    );
    let text = output.into_text();
    assert!(text.contains("slurm-12345.out"));
    assert!(text.contains("not found"));
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(3); 9]);
}

#[test]
fn test_output_appears_late_on_custom_path() {
    let (session, clock, client) = setup(FakeSession::new());
    let job = client
        .submit("#!/bin/bash\n#SBATCH --output=custom-%j.log\necho 42\n")
        .unwrap();
    // both read paths count as an access, the file shows up on the second attempt's cat
    session.put_file_delayed("custom-12345.log", "42\n", 3);

    assert_eq!(client.fetch_output(&job), JobOutput::Ready("42\n".to_string()));
    assert_eq!(clock.sleeps().len(), 1);
}

#[test]
fn test_output_is_memoized() {
    let (session, _, client) = setup(FakeSession::new());
    let job = client.submit(SCRIPT).unwrap();
    session.put_file("slurm-12345.out", "first\n");

    assert_eq!(client.fetch_output(&job), JobOutput::Ready("first\n".to_string()));
    session.put_file("slurm-12345.out", "second\n");
    let reads = session.reads().len();

    assert_eq!(client.fetch_output(&job), JobOutput::Ready("first\n".to_string()));
    assert_eq!(session.reads().len(), reads);
}

#[test]
fn test_disconnect_aborts_output_retrieval() {
    let (session, clock, client) = setup(FakeSession::new());
    let job = client.submit(SCRIPT).unwrap();
    session.disconnect();

    let output = client.fetch_output(&job);

    assert!(matches!(output, JobOutput::Error(ref reason) if reason.contains("Connection lost")));
    assert!(clock.sleeps().is_empty());
}

#[test]
fn test_work_dir_applies_to_upload_submit_and_output() {
    let session = Arc::new(
        FakeSession::new().respond(
            "cd '/scratch/run' && sbatch",
            CommandOutput::ok("Submitted batch job 7\n"),
        ),
    );
    let client = RemoteJobClient::new(
        session.clone(),
        RetryPolicy::new(1, Duration::from_secs(1)),
        VirtualClock::shared(),
    )
    .with_work_dir(Some("/scratch/run".to_string()));

    let job = client.submit(SCRIPT).unwrap();
    session.put_file("/scratch/run/slurm-7.out", "ok\n");

    assert_eq!(job, "7");
    assert!(session.commands()[0].starts_with("cd '/scratch/run' && sbatch 'job_"));
    assert_eq!(client.fetch_output(&job), JobOutput::Ready("ok\n".to_string()));
}
