use crate::environment::grid::registry::JobCategory;
use crate::experiment::{Experiment, Step};

/// One rendered file belonging to a job submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    pub name: String,
    pub content: String,
    pub executable: bool,
}

/// One scheduler-visible job: its rendered files and which of them is
/// handed to the submission command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    pub job_name: String,
    pub files: Vec<JobFile>,
    /// File name (relative to the job directory) passed to the submit command.
    pub submit_file: String,
    pub category: JobCategory,
    /// Scheduler-visible task count of this job.
    pub num_tasks: usize,
}

/// Everything a submission attempt will write and submit, fully rendered
/// up front. Plans are pure data: building one performs no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionPlan {
    /// One job per step; each is submitted with a terminal-state
    /// ("afterany") dependency on its predecessor's cluster id.
    Chain(Vec<JobPlan>),
    /// All steps grouped into a single graph submission with explicit
    /// parent/child edges.
    Dag {
        jobs: Vec<JobPlan>,
        graph: JobFile,
        name: String,
    },
}

impl SubmissionPlan {
    pub fn job_plans(&self) -> &[JobPlan] {
        match self {
            SubmissionPlan::Chain(jobs) => jobs,
            SubmissionPlan::Dag { jobs, .. } => jobs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    Job,
    Dag,
}

/// Scheduler-specific half of the grid environment.
///
/// Planning is pure; the command builders return argv vectors and the
/// output parsers enforce the scheduler CLI contract, failing loudly on
/// anything that does not match (see `GridError::SchedulerProtocol`).
pub trait GridBackend {
    fn name(&self) -> &'static str;

    /// Renders one job per step (or one graph covering all of them),
    /// using the given task dispatch order for the run-step.
    fn plan(
        &self,
        exp: &Experiment,
        steps: &[&Step],
        task_order: &[usize],
    ) -> crate::Result<SubmissionPlan>;

    /// Submission argv. `dependency` is the predecessor's cluster id for
    /// chained submissions.
    fn submit_command(
        &self,
        kind: SubmitKind,
        submit_file: &str,
        dependency: Option<&str>,
    ) -> crate::Result<Vec<String>>;

    /// Extracts the cluster id from the submission acknowledgement.
    fn parse_submit_output(&self, kind: SubmitKind, output: &str) -> crate::Result<String>;

    fn status_command(&self, cluster_id: &str) -> Vec<String>;

    /// Interprets status-query output: "no such job" means completed,
    /// a listed job means active, anything else is a protocol error.
    fn job_active(&self, output: &str) -> crate::Result<bool>;

    fn cancel_command(&self, cluster_id: &str) -> Vec<String>;

    /// Directories to create inside the job directory before submitting.
    fn side_dirs(&self) -> Vec<&'static str> {
        Vec::new()
    }
}
