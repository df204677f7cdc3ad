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

/// Written by every array task; sharing two files beats one pair per task.
const LOG_FILE: &str = "slurm.log";
const ERR_FILE: &str = "slurm.err";

const JOB_HEADER_TEMPLATE: &str = r##"#!/bin/bash -l
#SBATCH --job-name={name}
#SBATCH --output={logfile}
#SBATCH --error={errfile}
#SBATCH --array=1-{num_tasks}
#SBATCH --partition={partition}
#SBATCH --qos={qos}
#SBATCH --cpus-per-task={cpus}
#SBATCH --mem-per-cpu={memory_per_cpu}
#SBATCH --nice={nice}
#SBATCH --mail-type={mailtype}
#SBATCH --mail-user={mailuser}
{time_limit}
{extra_options}

ulimit -Sv {soft_memory_limit}
{environment_setup}"##;

const RUN_JOB_BODY_TEMPLATE: &str = r##"TASK_ORDER=({task_order})
RUN_ID=${{TASK_ORDER[$((SLURM_ARRAY_TASK_ID - 1))]}}
RUN_DIR="$(printf '{exp_path}/runs/%05d' "$RUN_ID")"
if [ "{use_scratch}" = "true" ] && [ -d "${{SCRATCH:-}}" ]; then
    WORK_DIR=$(mktemp -d "$SCRATCH/{name}-XXXXXX")
    cp -r "$RUN_DIR/." "$WORK_DIR"
    (cd "$WORK_DIR" && ./run)
    cp -r "$WORK_DIR/." "$RUN_DIR"
    rm -rf "$WORK_DIR"
else
    (cd "$RUN_DIR" && ./run)
fi"##;

const STEP_JOB_BODY_TEMPLATE: &str = r##"cd {cwd}
exec {script} {step_name}"##;

/// Slurm-family backend: one `sbatch` submission per step, chained with
/// `afterany` dependencies so a step becomes runnable only once every
/// task of its predecessor has reached a terminal state.
pub struct SlurmBackend {
    pub partition: String,
    pub qos: String,
    /// Memory per core, `<int>[K|M|G]`, no suffix meaning megabytes.
    pub memory_per_cpu: String,
    pub cpus: u64,
    /// Environment variables exported to the compute nodes.
    pub export: Vec<String>,
    /// Bash prologue prepended to every job script.
    pub setup: String,
    /// Slurm `--time` value, verbatim.
    pub time_limit: Option<String>,
    /// Extra raw `#SBATCH` lines.
    pub extra_options: Option<String>,
    /// Mail target for the final step of the experiment.
    pub email: Option<String>,
    /// Partition for auxiliary (non-run) steps; defaults to `partition`.
    pub aux_partition: Option<String>,
    pub use_scratch: bool,
    pub max_tasks: Option<usize>,
    script_path: PathBuf,
}

impl SlurmBackend {
    /// Fixed resource envelope for auxiliary steps; they are not the
    /// parallel payload.
    const AUX_STEP_CPUS: u64 = 8;
    const AUX_STEP_MEMORY_PER_CPU: &'static str = "1G";

    pub fn new() -> crate::Result<Self> {
        let script_path =
            std::env::current_exe().context("Cannot get experiment script path")?;
        Ok(SlurmBackend {
            partition: "normal".to_string(),
            qos: "normal".to_string(),
            memory_per_cpu: "3872M".to_string(),
            cpus: 1,
            export: vec!["ALL".to_string()],
            setup: String::new(),
            time_limit: None,
            extra_options: None,
            email: None,
            aux_partition: None,
            use_scratch: true,
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

        // Auxiliary steps get a small fixed envelope.
        let (partition, cpus, memory_per_cpu) = if step.is_run_step() {
            (self.partition.clone(), self.cpus, self.memory_per_cpu.clone())
        } else {
            (
                self.aux_partition.clone().unwrap_or_else(|| self.partition.clone()),
                Self::AUX_STEP_CPUS,
                Self::AUX_STEP_MEMORY_PER_CPU.to_string(),
            )
        };

        // Slurm enforces memory with cgroups; the soft ulimit below it
        // exists so child processes can still raise their own limit.
        let memory_kb = parse_memory_kb(&memory_per_cpu)?;
        let soft_memory_limit = (cpus as f64 * memory_kb as f64 * 0.98) as u64;

        let (mailtype, mailuser) = if is_last && self.email.is_some() {
            (
                "END,FAIL,REQUEUE,STAGE_OUT".to_string(),
                self.email.clone().unwrap_or_default(),
            )
        } else {
            ("NONE".to_string(), String::new())
        };

        let header_params = params(&[
            ("name", job_name.clone()),
            ("logfile", LOG_FILE.to_string()),
            ("errfile", ERR_FILE.to_string()),
            ("num_tasks", num_tasks.to_string()),
            ("partition", partition),
            ("qos", self.qos.clone()),
            ("cpus", cpus.to_string()),
            ("memory_per_cpu", memory_per_cpu),
            ("soft_memory_limit", soft_memory_limit.to_string()),
            ("nice", "0".to_string()),
            ("mailtype", mailtype),
            ("mailuser", mailuser),
            (
                "time_limit",
                match &self.time_limit {
                    Some(limit) => format!("#SBATCH --time={limit}"),
                    None => "### no time limit".to_string(),
                },
            ),
            (
                "extra_options",
                self.extra_options
                    .clone()
                    .unwrap_or_else(|| "## (not used)".to_string()),
            ),
            ("environment_setup", self.setup.clone()),
        ]);
        let header = fill_template(JOB_HEADER_TEMPLATE, &header_params)?;

        let body = if step.is_run_step() {
            let body_params = params(&[
                (
                    "task_order",
                    task_order
                        .iter()
                        .map(|i| i.to_string())
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
                ("exp_path", exp.path().display().to_string()),
                ("use_scratch", self.use_scratch.to_string()),
                ("name", job_name.clone()),
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
            submit_file: job_name.clone(),
            files: vec![JobFile {
                name: job_name.clone(),
                content: format!("{header}\n\n{body}\n"),
                executable: false,
            }],
            job_name,
            category,
            num_tasks,
        })
    }
}

impl GridBackend for SlurmBackend {
    fn name(&self) -> &'static str {
        "slurm"
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
        Ok(SubmissionPlan::Chain(jobs))
    }

    fn submit_command(
        &self,
        kind: SubmitKind,
        submit_file: &str,
        dependency: Option<&str>,
    ) -> crate::Result<Vec<String>> {
        if kind == SubmitKind::Dag {
            return config_error("the slurm backend has no graph submission".into());
        }
        let mut command = vec!["sbatch".to_string()];
        if !self.export.is_empty() {
            command.push("--export".to_string());
            command.push(self.export.join(","));
        }
        if let Some(previous) = dependency {
            command.push("-d".to_string());
            command.push(format!("afterany:{previous}"));
            command.push("--kill-on-invalid-dep=yes".to_string());
        }
        command.push(submit_file.to_string());
        Ok(command)
    }

    fn parse_submit_output(&self, _kind: SubmitKind, output: &str) -> crate::Result<String> {
        output
            .lines()
            .map(|l| l.trim())
            .find(|l| l.to_lowercase().starts_with("submitted batch job"))
            .and_then(|l| l.split(' ').nth(3))
            .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .map(|id| id.to_string())
            .ok_or_else(|| {
                crate::Error::SchedulerProtocol(format!(
                    "missing job id in sbatch output:\n{output}"
                ))
            })
    }

    fn status_command(&self, cluster_id: &str) -> Vec<String> {
        vec!["squeue".to_string(), "-j".to_string(), cluster_id.to_string()]
    }

    fn job_active(&self, output: &str) -> crate::Result<bool> {
        let lines: Vec<&str> = output.lines().collect();
        match lines.as_slice() {
            [header] if header.contains("JOBID") => Ok(false),
            [header, rest @ ..] if header.contains("JOBID") && !rest.is_empty() => Ok(true),
            _ => protocol_error(format!("unrecognized squeue output:\n{output}")),
        }
    }

    fn cancel_command(&self, cluster_id: &str) -> Vec<String> {
        vec!["scancel".to_string(), cluster_id.to_string()]
    }
}

/// Normalizes `<int>[K|M|G]` (case-insensitive, no suffix = megabytes)
/// to kilobytes.
pub fn parse_memory_kb(limit: &str) -> crate::Result<u64> {
    let malformed = || crate::Error::ConfigError(format!("malformed memory limit: {limit}"));
    let (digits, suffix) = match limit.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => {
            let (digits, rest) = limit.split_at(pos);
            if rest.len() != 1 {
                return Err(malformed());
            }
            (digits, rest.chars().next())
        }
        None => (limit, None),
    };
    if digits.is_empty() {
        return Err(malformed());
    }
    let memory: u64 = digits.parse().map_err(|_| malformed())?;
    match suffix.map(|c| c.to_ascii_lowercase()) {
        Some('k') => Ok(memory),
        None | Some('m') => Ok(memory * 1024),
        Some('g') => Ok(memory * 1024 * 1024),
        Some(_) => Err(malformed()),
    }
}
