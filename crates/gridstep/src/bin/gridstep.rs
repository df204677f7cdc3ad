use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use gridstep::common::cli::{run_experiment, RootOptions};
use gridstep::common::prompt::{Confirmer, PresetConfirmer, StdinConfirmer};
use gridstep::common::setup::setup_logging;
use gridstep::environment::grid::condor::CondorBackend;
use gridstep::environment::grid::slurm::SlurmBackend;
use gridstep::environment::grid::GridEnvironment;
use gridstep::environment::local::LocalEnvironment;
use gridstep::environment::Environment;
use gridstep::experiment::{Experiment, StepKind};
use gridstep::Error;

const NUM_RUNS: usize = 20;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum EnvKind {
    Local,
    Slurm,
    Condor,
}

/// Demo experiment: twenty trivial runs plus build and evaluate steps.
#[derive(Parser)]
#[command(name = "gridstep", version = gridstep::GRIDSTEP_VERSION)]
struct Opts {
    #[command(flatten)]
    common: RootOptions,

    /// Where the steps are executed.
    #[arg(long, value_enum, default_value_t = EnvKind::Local)]
    env: EnvKind,

    /// Group runs into batches (condor only).
    #[arg(long)]
    batch: bool,
}

fn build_experiment() -> gridstep::Result<Experiment> {
    let mut exp = Experiment::new("demo", PathBuf::from("data/demo-exp"))?;
    exp.set_num_runs(NUM_RUNS);

    exp.add_step("build", StepKind::Build, |exp| {
        for run in 1..=exp.num_runs() {
            let run_dir = exp.path().join("runs").join(format!("{run:05}"));
            std::fs::create_dir_all(&run_dir)?;
            let script = format!("#!/bin/sh\necho \"run {run} ok\" > properties\n");
            let path = run_dir.join("run");
            std::fs::write(&path, script)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
            }
        }
        log::info!("Built {} runs in {}", exp.num_runs(), exp.path().display());
        Ok(())
    })?;

    exp.add_step("start", StepKind::Run, |exp| {
        for run in 1..=exp.num_runs() {
            let run_dir = exp.path().join("runs").join(format!("{run:05}"));
            let status = std::process::Command::new("./run")
                .current_dir(&run_dir)
                .status()
                .map_err(|e| Error::ToolFailure(format!("cannot start run {run}: {e}")))?;
            if !status.success() {
                return Err(Error::ToolFailure(format!(
                    "run {run} exited with {status}"
                )));
            }
        }
        Ok(())
    })?;

    exp.add_step("evaluate", StepKind::Other, |exp| {
        std::fs::create_dir_all(exp.eval_dir())?;
        let mut finished = 0;
        for run in 1..=exp.num_runs() {
            let properties = exp
                .path()
                .join("runs")
                .join(format!("{run:05}"))
                .join("properties");
            if properties.is_file() {
                finished += 1;
            }
        }
        let summary = format!("finished runs: {finished}/{}\n", exp.num_runs());
        std::fs::write(exp.eval_dir().join("summary"), summary)?;
        log::info!("{finished}/{} runs produced properties", exp.num_runs());
        Ok(())
    })?;

    Ok(exp)
}

fn build_environment(opts: &Opts) -> gridstep::Result<Box<dyn Environment>> {
    let confirmer: Box<dyn Confirmer> = if opts.common.yes {
        Box::new(PresetConfirmer::new(true))
    } else {
        Box::new(StdinConfirmer)
    };
    Ok(match opts.env {
        EnvKind::Local => Box::new(LocalEnvironment::new(None)?),
        EnvKind::Slurm => Box::new(GridEnvironment::new(
            Box::new(SlurmBackend::new()?),
            confirmer,
        )),
        EnvKind::Condor => Box::new(GridEnvironment::new(
            Box::new(CondorBackend::new(opts.batch)?),
            confirmer,
        )),
    })
}

fn run(opts: &Opts) -> gridstep::Result<()> {
    let exp = build_experiment()?;
    let mut env = build_environment(opts)?;
    run_experiment(&exp, env.as_mut(), &opts.common)
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    setup_logging(opts.common.verbose);
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::UserAbort) => {
            eprintln!("Aborted");
            ExitCode::from(3)
        }
        Err(error) => {
            log::error!("{error}");
            ExitCode::FAILURE
        }
    }
}
