pub mod backend;
pub mod condor;
pub mod registry;
pub mod slurm;
pub mod template;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::common::fsutils::remove_path;
use crate::common::prompt::Confirmer;
use crate::environment::grid::backend::{GridBackend, JobPlan, SubmissionPlan, SubmitKind};
use crate::environment::grid::registry::{JobCategory, JobRecord, JobRegistry};
use crate::environment::{task_order, validate_step_selection, Environment};
use crate::experiment::{Experiment, Step};
use crate::Error;

/// Runs scheduler CLI commands. Injected so the submission and polling
/// logic can be exercised without a cluster.
pub trait CommandRunner {
    /// Runs `args` in `workdir` and returns captured output; stderr is
    /// merged into the result since scheduler CLIs report through both
    /// streams. A non-zero exit is a `ToolFailure`.
    fn run(&mut self, args: &[String], workdir: &Path) -> crate::Result<String>;
}

/// Spawns the real scheduler CLI, blocking until it returns.
#[derive(Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, args: &[String], workdir: &Path) -> crate::Result<String> {
        log::debug!("Running command `{}`", args.join(" "));
        let output = Command::new(&args[0])
            .args(&args[1..])
            .current_dir(workdir)
            .output()
            .map_err(|e| Error::ToolFailure(format!("{} start failed: {e}", args[0])))?;
        if !output.status.success() {
            return Err(Error::ToolFailure(format!(
                "{} failed\nExit code: {}\nStderr: {}\nStdout: {}",
                args[0],
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
                String::from_utf8_lossy(&output.stdout).trim()
            )));
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

/// Turns an ordered list of steps into a chain (or graph) of scheduler
/// jobs, with the submitted ids tracked in the job registry.
///
/// If the run-step is not among the selected steps, the steps are run
/// locally instead: step jobs themselves re-invoke the experiment script
/// on a node, and nothing may submit from within the grid.
pub struct GridEnvironment {
    backend: Box<dyn GridBackend>,
    confirmer: Box<dyn Confirmer>,
    runner: Box<dyn CommandRunner>,
    pub randomize_task_order: bool,
}

impl GridEnvironment {
    pub fn new(backend: Box<dyn GridBackend>, confirmer: Box<dyn Confirmer>) -> Self {
        GridEnvironment {
            backend,
            confirmer,
            runner: Box::new(SystemRunner),
            randomize_task_order: true,
        }
    }

    pub fn with_runner(mut self, runner: Box<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    fn registry(&self, exp: &Experiment) -> JobRegistry {
        JobRegistry::new(&exp.job_dir_path())
    }

    /// Prepares `<experiment-path>-grid-steps` for a submission attempt.
    /// Every destructive branch is gated behind a confirmation; declining
    /// aborts the whole submission with no partial state change.
    fn prepare_job_dir(&mut self, exp: &Experiment, steps: &[&Step]) -> crate::Result<PathBuf> {
        let job_dir = exp.job_dir_path();

        if job_dir.exists() {
            if self.poll_jobs(exp, false)? {
                self.confirmer.confirm_or_abort(
                    "You have submitted jobs for this experiment that are currently running. \
                     Do you want to cancel them in order to proceed?",
                )?;
                self.cancel_jobs(exp, false)?;
            }
            let categories = self.registry(exp).submitted_categories()?;
            let primary_submitted = categories
                .iter()
                .any(|c| matches!(c, JobCategory::Main | JobCategory::Dag));
            if steps.iter().any(|s| s.is_run_step()) && primary_submitted {
                // Stale job files reference old dependency chains and are
                // unsafe to resubmit blindly.
                self.confirmer.confirm_or_abort(
                    "You are about to submit the main experiment step and the grid-steps \
                     directory is not empty.\nConfirm that you want to delete the grid-steps \
                     and submit the experiment (again)?",
                )?;
                remove_path(&job_dir)?;
            }
        }

        // A fresh build overwrites the experiment directory.
        if steps.iter().any(|s| s.is_build_step()) {
            exp.remove_experiment_dir()?;
        }

        if exp.eval_dir().exists()
            && self.confirmer.answer_yes(&format!(
                "The evaluation directory \"{}\" already exists. Do you want to remove it?",
                exp.eval_dir().display()
            ))
        {
            remove_path(exp.eval_dir())?;
        }

        std::fs::create_dir_all(&job_dir)?;
        Ok(job_dir)
    }

    fn write_job_files(&self, job_dir: &Path, plan: &JobPlan) -> crate::Result<()> {
        for file in &plan.files {
            let path = job_dir.join(&file.name);
            std::fs::write(&path, &file.content)?;
            if file.executable {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(())
    }

    fn submit(
        &mut self,
        registry: &JobRegistry,
        job_dir: &Path,
        kind: SubmitKind,
        submit_file: &str,
        record_name: &str,
        category: JobCategory,
        dependency: Option<&str>,
    ) -> crate::Result<String> {
        let command = self.backend.submit_command(kind, submit_file, dependency)?;
        log::info!("Executing {}", command.join(" "));
        let output = self.runner.run(&command, job_dir)?;
        log::info!("Output: {}", output.trim());
        let cluster_id = self.backend.parse_submit_output(kind, &output)?;
        registry.append(&JobRecord::new(
            cluster_id.clone(),
            record_name.to_string(),
            category,
        ))?;
        Ok(cluster_id)
    }

    fn execute_plan(&mut self, exp: &Experiment, plan: &SubmissionPlan) -> crate::Result<()> {
        let job_dir = exp.job_dir_path();
        let registry = self.registry(exp);

        for dir in self.backend.side_dirs() {
            std::fs::create_dir_all(job_dir.join(dir))?;
        }
        for job in plan.job_plans() {
            self.write_job_files(&job_dir, job)?;
        }

        match plan {
            SubmissionPlan::Chain(jobs) => {
                let mut previous_id: Option<String> = None;
                for job in jobs {
                    let cluster_id = self.submit(
                        &registry,
                        &job_dir,
                        SubmitKind::Job,
                        &job.submit_file,
                        &job.job_name,
                        job.category,
                        previous_id.as_deref(),
                    )?;
                    previous_id = Some(cluster_id);
                }
            }
            SubmissionPlan::Dag { graph, name, .. } => {
                let graph_path = job_dir.join(&graph.name);
                std::fs::write(&graph_path, &graph.content)?;
                self.submit(
                    &registry,
                    &job_dir,
                    SubmitKind::Dag,
                    &graph.name,
                    name,
                    JobCategory::Dag,
                    None,
                )?;
            }
        }
        Ok(())
    }

    fn poll_jobs(&mut self, exp: &Experiment, printout: bool) -> crate::Result<bool> {
        let entries = self.registry(exp).read_all()?;
        if entries.is_empty() {
            if printout {
                println!("There are no tracked cluster jobs.");
            }
            return Ok(false);
        }
        let job_dir = exp.job_dir_path();
        let mut any_running = false;
        for entry in &entries {
            if printout {
                println!(
                    "\nChecking status for job {} submitted on {} (cluster id: {})",
                    entry.job_name, entry.submitted_at, entry.cluster_id
                );
            }
            let command = self.backend.status_command(&entry.cluster_id);
            let output = self.runner.run(&command, &job_dir)?;
            if self.backend.job_active(&output)? {
                if printout {
                    println!("\nYour job is not completed yet. Details:\n\n{output}");
                }
                any_running = true;
            } else if printout {
                println!("\nCompleted!");
            }
        }
        Ok(any_running)
    }

    /// Best-effort cancellation: entries stay in the registry as history;
    /// the next poll reflects scheduler truth.
    fn cancel_jobs(&mut self, exp: &Experiment, confirm_each: bool) -> crate::Result<()> {
        let entries = self.registry(exp).read_all()?;
        if entries.is_empty() {
            println!("There are no tracked cluster jobs.");
            return Ok(());
        }
        let job_dir = exp.job_dir_path();
        for entry in &entries {
            let status = self
                .runner
                .run(&self.backend.status_command(&entry.cluster_id), &job_dir)?;
            if !self.backend.job_active(&status)? {
                continue;
            }
            if confirm_each
                && !self.confirmer.answer_yes(&format!(
                    "Are you sure you want to remove job {} (cluster id: {}, submitted: {})?",
                    entry.job_name, entry.cluster_id, entry.submitted_at
                ))
            {
                continue;
            }
            let output = self
                .runner
                .run(&self.backend.cancel_command(&entry.cluster_id), &job_dir)?;
            log::info!("Cancelled {}: {}", entry.cluster_id, output.trim());
        }
        Ok(())
    }
}

impl Environment for GridEnvironment {
    fn run_steps(&mut self, exp: &Experiment, steps: &[&Step]) -> crate::Result<()> {
        validate_step_selection(steps)?;

        if !steps.iter().any(|s| s.is_run_step()) {
            log::info!("The run step is not selected; running the selected steps locally.");
            for step in steps {
                log::info!("Running step {:02}-{}", step.ordinal(), step.name());
                step.execute(exp)?;
            }
            return Ok(());
        }

        // Jobs cannot be submitted from within the grid, so everything is
        // submitted at once with dependencies; job files are never
        // rewritten after submission.
        let order = task_order(exp.num_runs(), self.randomize_task_order);
        let plan = self.backend.plan(exp, steps, &order)?;
        self.prepare_job_dir(exp, steps)?;
        self.execute_plan(exp, &plan)
    }

    fn check_cluster_status(&mut self, exp: &Experiment, printout: bool) -> crate::Result<bool> {
        self.poll_jobs(exp, printout)
    }

    fn remove_cluster_jobs(&mut self, exp: &Experiment, confirm_each: bool) -> crate::Result<()> {
        self.cancel_jobs(exp, confirm_each)
    }
}

pub fn within_slurm_job() -> bool {
    std::env::var_os("SLURM_JOB_ID").is_some()
}

pub fn within_condor_job() -> bool {
    std::env::var("BATCH_SYSTEM").map(|v| v == "HTCondor").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::common::prompt::CannedConfirmer;
    use crate::environment::grid::slurm::SlurmBackend;
    use crate::experiment::StepKind;

    const SQUEUE_HEADER: &str =
        "             JOBID PARTITION     NAME     USER ST       TIME  NODES NODELIST(REASON)\n";

    /// Replays scripted command outputs and records every invocation.
    struct ScriptedRunner {
        outputs: VecDeque<String>,
        invocations: Rc<RefCell<Vec<Vec<String>>>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<&str>) -> (Self, Rc<RefCell<Vec<Vec<String>>>>) {
            let invocations = Rc::new(RefCell::new(Vec::new()));
            (
                ScriptedRunner {
                    outputs: outputs.into_iter().map(String::from).collect(),
                    invocations: Rc::clone(&invocations),
                },
                invocations,
            )
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&mut self, args: &[String], _workdir: &Path) -> crate::Result<String> {
            self.invocations.borrow_mut().push(args.to_vec());
            match self.outputs.pop_front() {
                Some(output) => Ok(output),
                None => panic!("no scripted output left for command: {args:?}"),
            }
        }
    }

    fn noop(_: &Experiment) -> crate::Result<()> {
        Ok(())
    }

    fn experiment(dir: &Path) -> Experiment {
        let mut exp = Experiment::new("demo", dir.join("demo")).unwrap();
        exp.set_num_runs(4);
        exp.add_step("build", StepKind::Build, noop).unwrap();
        exp.add_step("start", StepKind::Run, noop).unwrap();
        exp.add_step("evaluate", StepKind::Other, noop).unwrap();
        exp
    }

    fn environment(answers: Vec<bool>, outputs: Vec<&str>) -> GridEnvironment {
        let (runner, _) = ScriptedRunner::new(outputs);
        let mut env = GridEnvironment::new(
            Box::new(SlurmBackend::new().unwrap()),
            Box::new(CannedConfirmer::new(answers)),
        )
        .with_runner(Box::new(runner));
        env.randomize_task_order = false;
        env
    }

    #[test]
    fn submits_three_chained_jobs_and_tracks_them() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        let steps: Vec<_> = exp.steps().iter().collect();

        let (runner, invocations) = ScriptedRunner::new(vec![
            "Submitted batch job 100\n",
            "Submitted batch job 101\n",
            "Submitted batch job 102\n",
        ]);
        let mut env = GridEnvironment::new(
            Box::new(SlurmBackend::new().unwrap()),
            Box::new(CannedConfirmer::new(vec![])),
        )
        .with_runner(Box::new(runner));
        env.randomize_task_order = false;

        env.run_steps(&exp, &steps).unwrap();

        let invocations = invocations.borrow();
        assert_eq!(invocations.len(), 3);
        assert!(invocations[1].contains(&"afterany:100".to_string()));
        assert!(invocations[2].contains(&"afterany:101".to_string()));

        let records = JobRegistry::new(&exp.job_dir_path()).read_all().unwrap();
        let categories: Vec<_> = records.iter().map(|r| r.category).collect();
        assert_eq!(
            categories,
            vec![JobCategory::Other, JobCategory::Main, JobCategory::Other]
        );
        assert_eq!(records[1].cluster_id, "101");

        // One rendered description per step, next to the registry.
        for name in ["demo-01-build", "demo-02-start", "demo-03-evaluate"] {
            assert!(exp.job_dir_path().join(name).is_file());
        }
    }

    #[test]
    fn declined_main_resubmission_leaves_everything_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        let steps: Vec<_> = exp.steps().iter().collect();

        let job_dir = exp.job_dir_path();
        std::fs::create_dir_all(&job_dir).unwrap();
        let registry = JobRegistry::new(&job_dir);
        registry
            .append(&JobRecord::new(
                "555".into(),
                "demo-02-start".into(),
                JobCategory::Main,
            ))
            .unwrap();
        std::fs::write(job_dir.join("demo-02-start"), "old job file").unwrap();

        // Status poll reports the job gone; the main-category gate then
        // prompts and the answer is "no".
        let mut env = environment(vec![false], vec![SQUEUE_HEADER]);
        let result = env.run_steps(&exp, &steps);
        assert!(matches!(result, Err(Error::UserAbort)));

        assert!(job_dir.join("demo-02-start").is_file());
        assert_eq!(registry.read_all().unwrap().len(), 1);
    }

    #[test]
    fn running_jobs_must_be_cancelled_before_resubmission() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        let steps: Vec<_> = exp.steps().iter().collect();

        let job_dir = exp.job_dir_path();
        std::fs::create_dir_all(&job_dir).unwrap();
        JobRegistry::new(&job_dir)
            .append(&JobRecord::new(
                "555".into(),
                "demo-02-start".into(),
                JobCategory::Main,
            ))
            .unwrap();

        let active = format!("{SQUEUE_HEADER}   555 normal demo-02- user R 1:00 1 node01\n");
        // Declining the cancel prompt aborts the whole submission.
        let mut env = environment(vec![false], vec![active.as_str()]);
        assert!(matches!(env.run_steps(&exp, &steps), Err(Error::UserAbort)));
    }

    #[test]
    fn non_run_selections_execute_locally_without_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        let steps = exp.select_steps(&["evaluate".into()]).unwrap();

        let mut env = environment(vec![], vec![]);
        env.run_steps(&exp, &steps).unwrap();
        assert!(!exp.job_dir_path().exists());
    }

    #[test]
    fn poll_aggregates_any_running() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        let job_dir = exp.job_dir_path();
        std::fs::create_dir_all(&job_dir).unwrap();
        let registry = JobRegistry::new(&job_dir);
        for id in ["1", "2"] {
            registry
                .append(&JobRecord::new(
                    id.into(),
                    format!("demo-{id}"),
                    JobCategory::Other,
                ))
                .unwrap();
        }

        let active = format!("{SQUEUE_HEADER}     2 normal demo-2 user R 0:10 1 node01\n");
        let mut env = environment(vec![], vec![SQUEUE_HEADER, active.as_str()]);
        assert!(env.check_cluster_status(&exp, false).unwrap());

        let mut env = environment(vec![], vec![SQUEUE_HEADER, SQUEUE_HEADER]);
        assert!(!env.check_cluster_status(&exp, false).unwrap());
    }

    #[test]
    fn cancel_keeps_registry_entries() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        let job_dir = exp.job_dir_path();
        std::fs::create_dir_all(&job_dir).unwrap();
        let registry = JobRegistry::new(&job_dir);
        registry
            .append(&JobRecord::new(
                "77".into(),
                "demo-02-start".into(),
                JobCategory::Main,
            ))
            .unwrap();

        let active = format!("{SQUEUE_HEADER}    77 normal demo-02- user R 0:10 1 node01\n");
        let mut env = environment(vec![true], vec![active.as_str(), ""]);
        env.remove_cluster_jobs(&exp, true).unwrap();
        assert_eq!(registry.read_all().unwrap().len(), 1);
    }
}
