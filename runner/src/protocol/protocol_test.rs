use super::*;

#[test]
pub fn submission_id_is_last_token() {
    assert_eq!(
        parse_submission("Submitted batch job 123456\n"),
        Ok("123456".to_string())
    );
    assert_eq!(
        parse_submission("\n  Submitted batch job 77\nsbatch: warning: partition default used"),
        Ok("77".to_string())
    );
}

#[test]
pub fn submission_parse_failures() {
    assert_eq!(parse_submission(""), Err(ParseError::Empty));
    assert_eq!(parse_submission(" \n\t\n"), Err(ParseError::Empty));
    assert_eq!(
        parse_submission("sbatch: error: invalid partition 'gpu'"),
        Err(ParseError::InvalidId("'gpu'".to_string()))
    );
}

#[test]
pub fn queue_state_tokens() {
    assert_eq!(parse_queue_state("RUNNING\n"), Some("RUNNING"));
    assert_eq!(parse_queue_state("  PENDING  \n"), Some("PENDING"));
    assert_eq!(parse_queue_state(""), None);
}

#[test]
pub fn accounting_state_takes_first_line_first_word() {
    let sacct = "CANCELLED by 1000 \n CANCELLED \n COMPLETED \n";
    assert_eq!(parse_accounting_state(sacct), Some("CANCELLED"));
    assert_eq!(parse_accounting_state("\n\n"), None);
}

#[test]
pub fn quoting() {
    assert_eq!(shell_quote("plain.sh"), "'plain.sh'");
    assert_eq!(shell_quote("it's.sh"), "'it'\\''s.sh'");
    assert_eq!(shell_quote(""), "''");
}

#[test]
pub fn commands() {
    assert_eq!(submit_command("job_1.sh", None), "sbatch 'job_1.sh'");
    assert_eq!(
        submit_command("job_1.sh", Some("/scratch/me")),
        "cd '/scratch/me' && sbatch 'job_1.sh'"
    );
    assert_eq!(queue_command("42"), "squeue -j '42' -h -o %T");
    assert_eq!(accounting_command("42"), "sacct -j '42' -n -o State");
    assert_eq!(cat_command("~/slurm-42.out"), "cat ~/slurm-42.out");
}
