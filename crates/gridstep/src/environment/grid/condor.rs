use std::path::PathBuf;

use anyhow::Context;

use crate::common::error::{config_error, protocol_error};
use crate::common::fsutils::get_current_dir;
use crate::environment::grid::backend::{
    GridBackend, JobFile, JobPlan, SubmissionPlan, SubmitKind,
};
use crate::environment::grid::registry::JobCategory;
use crate::environment::grid::template::{fill_template, params};
use crate::experiment::{Experiment, Step};

const JOB_LOG_DIR: &str = "condor-job-logs";

const SUBMIT_TEMPLATE: &str = r##"universe = docker
docker_image = {dockerimage}
getenv = {getenv}
executable = {executable}
{arguments}
output = {logdir}/{name}.$(Cluster).$(Process).out
error = {logdir}/{name}.$(Cluster).$(Process).err
log = {logdir}/{name}.$(Cluster).log
request_cpus = {cpus}
request_gpus = {gpus}
request_memory = {memory}
{requirements}
{transfer}
{mail}

queue {jobs}
"##;

const RUN_JOB_BODY_TEMPLATE: &str = r##"#!/bin/bash
TASK_ORDER=({task_order})
RUN_ID=${{TASK_ORDER[$1]}}
RUN_DIR="$(printf '{exp_path}/runs/%05d' "$RUN_ID")"
cd "$RUN_DIR" && exec ./run
"##;

const BATCH_JOB_BODY_TEMPLATE: &str = r##"#!/bin/bash
BATCH_ID=$1
TASK_ORDER=({task_order})
GROUP_SIZES=({group_sizes})
OFFSET=0
for ((i = 0; i < BATCH_ID; i++)); do
    OFFSET=$((OFFSET + GROUP_SIZES[i]))
done
COUNT=${{GROUP_SIZES[$BATCH_ID]}}
for ((i = 0; i < COUNT; i++)); do
    RUN_ID=${{TASK_ORDER[$((OFFSET + i))]}}
    RUN_DIR="$(printf '{exp_path}/runs/%05d' "$RUN_ID")"
    (cd "$RUN_DIR" && ./run) &
    while [ "$(jobs -r | wc -l)" -ge {processes} ]; do
        wait -n
    done
done
wait
"##;

const STEP_JOB_BODY_TEMPLATE: &str = r##"#!/bin/bash
cd {cwd}
exec {script} {step_name}
"##;

/// HTCondor backend. Single selected steps go through `condor_submit`;
/// multi-step selections become one DAG submitted via `condor_submit_dag`,
/// since plain Condor jobs cannot be chained at submission time.
pub struct CondorBackend {
    /// Group runs into batches, one Condor job per batch, to cut
    /// scheduler and container startup overhead for short runs.
    pub batch_mode: bool,
    pub docker_image: String,
    pub getenv: Vec<String>,
    pub cpus: u64,
    /// Fractional GPU shares are allowed, e.g. "0.5".
    pub gpus: String,
    pub memory: String,
    /// Conjoined with the generated requirements expression.
    pub additional_requirements: Option<String>,
    pub use_scratch: bool,
    /// Runs executed concurrently inside one batch (batch mode only).
    pub batch_concurrent_processes: usize,
    /// Upper bound on runs per batch; actual group sizes are balanced.
    pub max_batch_size: usize,
    pub email: Option<String>,
    pub max_tasks: Option<usize>,
    script_path: PathBuf,
}

impl CondorBackend {
    const AUX_STEP_CPUS: u64 = 8;
    const AUX_STEP_GPUS: &'static str = "0";
    const AUX_STEP_MEMORY: &'static str = "8G";

    pub fn new(batch_mode: bool) -> crate::Result<Self> {
        let script_path =
            std::env::current_exe().context("Cannot get experiment script path")?;
        Ok(CondorBackend {
            batch_mode,
            docker_image: "gridstep/runner:latest".to_string(),
            getenv: vec!["HOME".to_string()],
            cpus: if batch_mode { 16 } else { 1 },
            gpus: "0".to_string(),
            memory: if batch_mode { "64G" } else { "4G" }.to_string(),
            additional_requirements: None,
            use_scratch: true,
            batch_concurrent_processes: 15,
            max_batch_size: 150,
            email: None,
            max_tasks: None,
            script_path,
        })
    }

    fn num_tasks(&self, exp: &Experiment, step: &Step) -> crate::Result<usize> {
        if !step.is_run_step() {
            return Ok(1);
        }
        let num_runs = exp.num_runs();
        if num_runs == 0 {
            return config_error("the experiment has no runs".into());
        }
        if let Some(max) = self.max_tasks {
            if num_runs > max {
                return config_error(format!(
                    "you are trying to submit a job with {num_runs} tasks, \
                     but only {max} are allowed"
                ));
            }
        }
        Ok(num_runs)
    }

    fn render_job(
        &self,
        exp: &Experiment,
        step: &Step,
        is_last: bool,
        task_order: &[usize],
    ) -> crate::Result<JobPlan> {
        let job_name = exp.job_name(step);
        let num_tasks = self.num_tasks(exp, step)?;
        let batched = self.batch_mode && step.is_run_step();

        let queue_jobs = if batched {
            balanced_groups(num_tasks, self.max_batch_size)?.len()
        } else {
            num_tasks
        };

        let (cpus, gpus, memory) = if step.is_run_step() {
            (self.cpus, self.gpus.clone(), self.memory.clone())
        } else {
            (
                Self::AUX_STEP_CPUS,
                Self::AUX_STEP_GPUS.to_string(),
                Self::AUX_STEP_MEMORY.to_string(),
            )
        };

        let transfer = if step.is_run_step() && self.use_scratch {
            "should_transfer_files = YES\nwhen_to_transfer_output = ON_EXIT"
        } else {
            "should_transfer_files = NO"
        };

        let mail = if is_last && self.email.is_some() {
            format!(
                "notification = Always\nnotify_user = {}",
                self.email.clone().unwrap_or_default()
            )
        } else {
            "notification = Never".to_string()
        };

        let requirements = match &self.additional_requirements {
            Some(expr) => format!("requirements = $(requirements) && ({expr})"),
            None => "## no additional requirements".to_string(),
        };

        let executable = format!("{job_name}.sh");
        let arguments = if step.is_run_step() {
            "arguments = $(Process)"
        } else {
            "## no arguments"
        };

        let submit_params = params(&[
            ("name", job_name.clone()),
            ("dockerimage", self.docker_image.clone()),
            ("getenv", self.getenv.join(",")),
            ("executable", executable.clone()),
            ("arguments", arguments.to_string()),
            ("logdir", JOB_LOG_DIR.to_string()),
            ("cpus", cpus.to_string()),
            ("gpus", gpus),
            ("memory", memory),
            ("requirements", requirements),
            ("transfer", transfer.to_string()),
            ("mail", mail),
            ("jobs", queue_jobs.to_string()),
        ]);
        let submit_content = fill_template(SUBMIT_TEMPLATE, &submit_params)?;

        let order_string = task_order
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let body = if batched {
            let sizes = balanced_groups(num_tasks, self.max_batch_size)?;
            let body_params = params(&[
                ("task_order", order_string),
                (
                    "group_sizes",
                    sizes
                        .iter()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
                ("exp_path", exp.path().display().to_string()),
                ("processes", self.batch_concurrent_processes.to_string()),
            ]);
            fill_template(BATCH_JOB_BODY_TEMPLATE, &body_params)?
        } else if step.is_run_step() {
            let body_params = params(&[
                ("task_order", order_string),
                ("exp_path", exp.path().display().to_string()),
            ]);
            fill_template(RUN_JOB_BODY_TEMPLATE, &body_params)?
        } else {
            let body_params = params(&[
                ("cwd", get_current_dir().display().to_string()),
                ("script", self.script_path.display().to_string()),
                ("step_name", step.name().to_string()),
            ]);
            fill_template(STEP_JOB_BODY_TEMPLATE, &body_params)?
        };

        let category = if step.is_run_step() {
            JobCategory::Main
        } else {
            JobCategory::Other
        };

        Ok(JobPlan {
            submit_file: format!("{job_name}.sub"),
            files: vec![
                JobFile {
                    name: format!("{job_name}.sub"),
                    content: submit_content,
                    executable: false,
                },
                JobFile {
                    name: executable,
                    content: body,
                    executable: true,
                },
            ],
            job_name,
            category,
            num_tasks,
        })
    }
}

impl GridBackend for CondorBackend {
    fn name(&self) -> &'static str {
        "condor"
    }

    fn plan(
        &self,
        exp: &Experiment,
        steps: &[&Step],
        task_order: &[usize],
    ) -> crate::Result<SubmissionPlan> {
        let last_ordinal = steps.iter().map(|s| s.ordinal()).max().unwrap_or(0);
        let jobs = steps
            .iter()
            .map(|step| self.render_job(exp, step, step.ordinal() == last_ordinal, task_order))
            .collect::<crate::Result<Vec<_>>>()?;

        if jobs.len() == 1 {
            return Ok(SubmissionPlan::Chain(jobs));
        }

        // Plain condor_submit cannot express dependencies, so multiple
        // steps become one DAG with linear parent/child edges.
        let mut graph = String::new();
        for job in &jobs {
            graph.push_str(&format!("JOB {} {}\n", job.job_name, job.submit_file));
        }
        for pair in jobs.windows(2) {
            graph.push_str(&format!(
                "PARENT {} CHILD {}\n",
                pair[0].job_name, pair[1].job_name
            ));
        }
        Ok(SubmissionPlan::Dag {
            graph: JobFile {
                name: format!("{}.dag", exp.name()),
                content: graph,
                executable: false,
            },
            name: exp.name().to_string(),
            jobs,
        })
    }

    fn submit_command(
        &self,
        kind: SubmitKind,
        submit_file: &str,
        dependency: Option<&str>,
    ) -> crate::Result<Vec<String>> {
        if dependency.is_some() {
            return config_error(
                "the condor backend expresses dependencies as DAG edges, not at submit time"
                    .into(),
            );
        }
        let program = match kind {
            SubmitKind::Job => "condor_submit",
            SubmitKind::Dag => "condor_submit_dag",
        };
        Ok(vec![program.to_string(), submit_file.to_string()])
    }

    fn parse_submit_output(&self, kind: SubmitKind, output: &str) -> crate::Result<String> {
        let marker = match kind {
            SubmitKind::Job => "job(s) submitted to cluster ",
            SubmitKind::Dag => "1 job(s) submitted to cluster ",
        };
        for line in output.lines() {
            if let Some(pos) = line.find(marker) {
                let tail = &line[pos + marker.len()..];
                let id: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
                if !id.is_empty() {
                    return Ok(id);
                }
            }
        }
        protocol_error(format!(
            "missing cluster id in condor submission output:\n{output}"
        ))
    }

    fn status_command(&self, cluster_id: &str) -> Vec<String> {
        vec!["condor_q".to_string(), cluster_id.to_string()]
    }

    fn job_active(&self, output: &str) -> crate::Result<bool> {
        let lines: Vec<&str> = output.lines().collect();
        if lines.len() == 8
            && lines[5].starts_with(
                "Total for query: 0 jobs; 0 completed, 0 removed, 0 idle, 0 running, \
                 0 held, 0 suspended",
            )
        {
            return Ok(false);
        }
        if lines.len() == 9 {
            return Ok(true);
        }
        protocol_error(format!("unrecognized condor_q output:\n{output}"))
    }

    fn cancel_command(&self, cluster_id: &str) -> Vec<String> {
        vec!["condor_rm".to_string(), cluster_id.to_string()]
    }

    fn side_dirs(&self) -> Vec<&'static str> {
        vec![JOB_LOG_DIR]
    }
}

/// Splits `num_runs` into `ceil(num_runs / max_batch_size)` groups whose
/// sizes differ by at most one. Resource planning downstream assumes no
/// degenerate small trailing group.
pub fn balanced_groups(num_runs: usize, max_batch_size: usize) -> crate::Result<Vec<usize>> {
    if max_batch_size == 0 {
        return config_error("max_batch_size must be positive".into());
    }
    if num_runs == 0 {
        return Ok(Vec::new());
    }
    let num_groups = num_runs.div_ceil(max_batch_size);
    let base = num_runs / num_groups;
    let remainder = num_runs % num_groups;
    Ok((0..num_groups)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> CondorBackend {
        CondorBackend::new(false).unwrap()
    }

    #[test]
    fn groups_are_balanced() {
        assert_eq!(balanced_groups(101, 100).unwrap(), vec![51, 50]);
        assert_eq!(balanced_groups(10, 3).unwrap(), vec![3, 3, 2, 2]);
        assert_eq!(balanced_groups(150, 150).unwrap(), vec![150]);
        assert_eq!(balanced_groups(4, 150).unwrap(), vec![4]);
    }

    #[test]
    fn group_count_is_ceiling_and_spread_at_most_one() {
        for (runs, batch) in [(101, 100), (1000, 150), (7, 2), (99, 10)] {
            let sizes = balanced_groups(runs, batch).unwrap();
            assert_eq!(sizes.len(), runs.div_ceil(batch));
            assert_eq!(sizes.iter().sum::<usize>(), runs);
            let max = sizes.iter().max().unwrap();
            let min = sizes.iter().min().unwrap();
            assert!(max - min <= 1);
        }
    }

    #[test]
    fn parses_condor_submit_acknowledgement() {
        let backend = backend();
        let output = "Submitting job(s)....\n4 job(s) submitted to cluster 1137.\n";
        assert_eq!(
            backend.parse_submit_output(SubmitKind::Job, output).unwrap(),
            "1137"
        );
    }

    #[test]
    fn dag_acknowledgement_requires_single_job() {
        let backend = backend();
        let output = "Submitting job(s).\n1 job(s) submitted to cluster 2205.\n";
        assert_eq!(
            backend.parse_submit_output(SubmitKind::Dag, output).unwrap(),
            "2205"
        );
        assert!(backend
            .parse_submit_output(SubmitKind::Dag, "4 job(s) submitted to cluster 2205.\n")
            .is_err());
    }

    #[test]
    fn unrecognized_submission_output_is_a_protocol_error() {
        let backend = backend();
        assert!(matches!(
            backend.parse_submit_output(SubmitKind::Job, "ERROR: failed to parse submit file\n"),
            Err(crate::Error::SchedulerProtocol(_))
        ));
    }

    #[test]
    fn eight_line_zero_summary_means_completed() {
        let backend = backend();
        // The heuristic keys on line 6 of the 8-line variant.
        let output = [
            "",
            "-- Schedd: cluster.example.org : <10.0.0.1:9618?... @ 08/27/26 12:00:00",
            "OWNER BATCH_NAME      SUBMITTED   DONE   RUN    IDLE   HOLD  TOTAL JOB_IDS",
            "",
            "",
            "Total for query: 0 jobs; 0 completed, 0 removed, 0 idle, 0 running, 0 held, 0 suspended",
            "Total for someone: 0 jobs; 0 completed, 0 removed, 0 idle, 0 running, 0 held, 0 suspended",
            "Total for all users: 31 jobs; 5 completed, 0 removed, 0 idle, 26 running, 0 held, 0 suspended",
        ]
        .join("\n");
        assert_eq!(output.lines().count(), 8);
        assert!(!backend.job_active(&output).unwrap());
    }

    #[test]
    fn nine_line_output_means_active() {
        let backend = backend();
        let output = [
            "",
            "-- Schedd: cluster.example.org : <10.0.0.1:9618?... @ 08/27/26 12:00:00",
            "OWNER BATCH_NAME      SUBMITTED   DONE   RUN    IDLE   HOLD  TOTAL JOB_IDS",
            "someone  demo-02-start  8/27 12:00     _     1      3      _      4 1137.0-3",
            "someone  demo-03-eval   8/27 12:00     _     _      1      _      1 1138.0",
            "",
            "Total for query: 5 jobs; 0 completed, 0 removed, 4 idle, 1 running, 0 held, 0 suspended",
            "Total for someone: 5 jobs; 0 completed, 0 removed, 4 idle, 1 running, 0 held, 0 suspended",
            "Total for all users: 35 jobs; 5 completed, 0 removed, 4 idle, 27 running, 0 held, 0 suspended",
        ]
        .join("\n");
        assert_eq!(output.lines().count(), 9);
        assert!(backend.job_active(&output).unwrap());
    }

    #[test]
    fn malformed_condor_q_output_is_a_protocol_error() {
        let backend = backend();
        assert!(matches!(
            backend.job_active("condor_q: command not found\n"),
            Err(crate::Error::SchedulerProtocol(_))
        ));
    }

    #[test]
    fn submit_time_dependencies_are_rejected() {
        let backend = backend();
        assert!(backend
            .submit_command(SubmitKind::Job, "demo-01-build.sub", Some("42"))
            .is_err());
    }
}
