use clap::Parser;

use crate::environment::Environment;
use crate::experiment::Experiment;

/// Options shared by every experiment script built on gridstep.
#[derive(Parser, Debug)]
pub struct RootOptions {
    /// Steps to run, by name or 1-based position. No selection lists the
    /// available steps.
    pub steps: Vec<String>,

    /// Run all steps of the experiment.
    #[arg(long, conflicts_with = "steps")]
    pub all: bool,

    /// Check the status of all tracked cluster jobs.
    #[arg(long)]
    pub status: bool,

    /// Cancel tracked cluster jobs that are still active.
    #[arg(long)]
    pub cancel: bool,

    /// Answer every confirmation with yes.
    #[arg(long)]
    pub yes: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Dispatches a parsed command line against an experiment: status and
/// cancel queries first, otherwise the selected steps are handed to the
/// environment in ordinal order.
pub fn run_experiment(
    exp: &Experiment,
    env: &mut dyn Environment,
    opts: &RootOptions,
) -> crate::Result<()> {
    if opts.status {
        let any_running = env.check_cluster_status(exp, true)?;
        if any_running {
            println!("\nThere are still active cluster jobs.");
        }
        return Ok(());
    }
    if opts.cancel {
        return env.remove_cluster_jobs(exp, !opts.yes);
    }

    let selected = if opts.all {
        exp.steps().iter().collect()
    } else {
        exp.select_steps(&opts.steps)?
    };
    if selected.is_empty() {
        print_step_list(exp);
        return Ok(());
    }
    env.run_steps(exp, &selected)
}

fn print_step_list(exp: &Experiment) {
    println!("Steps of experiment {}:", exp.name());
    for step in exp.steps() {
        println!("{:2} {:<24} [{}]", step.ordinal(), step.name(), step.kind().as_str());
    }
}
