use clap::{ArgAction, Parser, Subcommand};
use slurmgate_runner::{
    clients::{Clients, JobOutput},
    clock::{SharedClock, SystemClock},
    config::{RemoteConfig, RunnerConfig},
    interrupt::{install_interrupt_handler, Cancellation},
    monitor::Monitor,
    pipeline::{Pipeline, RunOutcome, ScriptFile},
    script::ExtractedScript,
    state::JobState,
};
use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// exit status after ^C, as a shell would report it
const INTERRUPTED: u8 = 130;

const DEMO_SCRIPT: &str = r#"#!/bin/bash
#SBATCH --job-name=test_add
#SBATCH --output=slurm-%j.out
#SBATCH --time=00:01:00

python3 -c "import socket; print(f'Hello from {socket.gethostname()}! The sum of 50 + 50 is {50+50}')"
"#;

#[derive(Parser, Debug)]
#[command(author, version, about = "Submit batch scripts to Slurm and follow them to completion")]
struct Cli {
    /// YAML runner config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// use the in-memory client instead of a cluster
    #[arg(long, global = true)]
    simulate: bool,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    user: Option<String>,
    /// more output, repeat for more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a script (or a markdown response containing one) and wait for its output
    Run {
        script: PathBuf,
        /// submit without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Submit a small job adding two numbers and check its output
    Demo,
    /// Validate a config file
    Check {
        #[arg(value_name = "CONFIG")]
        file: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "slurmgate=info,slurmgate_runner=info",
            1 => "slurmgate=debug,slurmgate_runner=debug",
            _ => "slurmgate=trace,slurmgate_runner=trace",
        })
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Config file (if any) with the command line applied on top, `None` if it is unusable
fn build_config(cli: &Cli) -> Option<RunnerConfig> {
    let mut config = match cli.config {
        Some(ref path) => match RunnerConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                error!(error = %error, path = ?path, "Failed to load config");
                return None;
            }
        },
        None => RunnerConfig::default(),
    };

    if cli.simulate {
        config.client.name = "simulated".to_string();
    }

    if cli.host.is_some() || cli.user.is_some() {
        let remote = config
            .remote
            .get_or_insert_with(|| RemoteConfig::new("", ""));
        if let Some(ref host) = cli.host {
            remote.host = host.clone();
        }
        if let Some(ref user) = cli.user {
            remote.user = user.clone();
        }
    }

    if config.preflight_checks() {
        error!("Config contains errors, see above");
        return None;
    }

    Some(config)
}

fn check(path: &Path) -> ExitCode {
    let mut config = match RunnerConfig::load(path) {
        Ok(config) => config,
        Err(error) => {
            error!(error = %error, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if config.preflight_checks() {
        ExitCode::FAILURE
    } else {
        info!(client = config.client.name.as_str(), "Config is valid");
        ExitCode::SUCCESS
    }
}

fn confirm_on_terminal(generated: &ExtractedScript) -> bool {
    if let Some(ref reasoning) = generated.reasoning {
        println!("Reasoning: {reasoning}\n");
    }
    println!("{}\n", generated.script);
    print!("Submit this job? [y/N] ");
    let _ = io::stdout().flush();

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
        Err(error) => {
            warn!(error = %error, "Failed to read answer, not submitting");
            false
        }
    }
}

fn cancellation() -> Cancellation {
    install_interrupt_handler().unwrap_or_else(|error| {
        warn!(error = %error, "Failed to install interrupt handler, ^C will terminate");
        Cancellation::new()
    })
}

fn report(outcome: &RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::NoScript => {
            error!("No script to submit");
            ExitCode::FAILURE
        }
        RunOutcome::Declined => ExitCode::SUCCESS,
        RunOutcome::Cancelled => {
            println!("Interrupted, no job was submitted");
            ExitCode::from(INTERRUPTED)
        }
        RunOutcome::SubmissionFailed(reason) => {
            error!("Submission failed: {reason}");
            ExitCode::FAILURE
        }
        RunOutcome::Interrupted { job, last } => {
            println!("Stopped monitoring job {job} (last state {last}), it keeps running");
            ExitCode::from(INTERRUPTED)
        }
        RunOutcome::Abandoned { job, reason } => {
            error!(job = job.as_str(), "{reason}");
            ExitCode::FAILURE
        }
        RunOutcome::Finished { job, state, output } => {
            println!("Job {job} finished: {state}");
            if let Some(output) = output {
                println!("--- output ---\n{output}");
            }

            match (state, output) {
                (JobState::Completed, Some(output)) if output.is_ready() => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(config: &RunnerConfig, script: &Path, yes: bool) -> ExitCode {
    let clock: SharedClock = Arc::new(SystemClock);
    let client = match Clients::load(config, clock.clone()) {
        Ok(client) => client,
        Err(error) => {
            error!(error = %error, "Failed to set up job client");
            return ExitCode::FAILURE;
        }
    };

    let monitor = Monitor::new(&config.polling, clock);
    let generator = ScriptFile::new(script);
    let cancel = cancellation();

    let outcome = Pipeline::new(&generator, &client, &monitor).run(
        &script.display().to_string(),
        |generated| yes || confirm_on_terminal(generated),
        &cancel,
    );

    report(&outcome)
}

fn demo(config: &RunnerConfig) -> ExitCode {
    let clock: SharedClock = Arc::new(SystemClock);
    let client = match Clients::load(config, clock.clone()) {
        Ok(client) => client,
        Err(error) => {
            error!(error = %error, "Failed to set up job client");
            return ExitCode::FAILURE;
        }
    };
    let simulated = matches!(client, Clients::Simulated(_));

    let monitor = Monitor::new(&config.polling, clock);
    let generator = |_: &str| Ok::<_, String>(DEMO_SCRIPT.to_string());
    let cancel = cancellation();

    let outcome =
        Pipeline::new(&generator, &client, &monitor).run("add two numbers", |_| true, &cancel);

    match outcome {
        RunOutcome::Finished {
            state: JobState::Completed,
            output: Some(JobOutput::Ready(ref output)),
            ..
        } => {
            println!("{output}");

            if output.contains("100") {
                println!("Calculated 50 + 50 = 100");
                ExitCode::SUCCESS
            } else if simulated {
                println!("Simulated client, canned output");
                ExitCode::SUCCESS
            } else {
                warn!("Output does not contain the expected sum");
                ExitCode::FAILURE
            }
        }
        ref other => report(other),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Command::Check { ref file } = cli.command {
        return check(file);
    }

    let Some(config) = build_config(&cli) else {
        return ExitCode::FAILURE;
    };

    match cli.command {
        Command::Run { ref script, yes } => run(&config, script, yes),
        Command::Demo => demo(&config),
        Command::Check { .. } => ExitCode::SUCCESS,
    }
}
