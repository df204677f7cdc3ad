use std::path::{Path, PathBuf};

use crate::common::error::config_error;
use crate::common::fsutils::{absolute_path, remove_path};

/// Suffix of the side directory holding rendered job files and the job
/// registry for one experiment.
const JOB_DIR_SUFFIX: &str = "-grid-steps";
const EVAL_DIR_SUFFIX: &str = "-eval";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Builds the experiment; submitting it wipes the experiment directory.
    Build,
    /// The step that fans out over all runs as an array job.
    Run,
    Other,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Build => "build",
            StepKind::Run => "run",
            StepKind::Other => "other",
        }
    }
}

pub type StepAction = Box<dyn Fn(&Experiment) -> crate::Result<()>>;

/// One named phase of an experiment. Immutable once added.
pub struct Step {
    name: String,
    ordinal: usize,
    kind: StepKind,
    action: StepAction,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based position in the step sequence.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn is_run_step(&self) -> bool {
        self.kind == StepKind::Run
    }

    pub fn is_build_step(&self) -> bool {
        self.kind == StepKind::Build
    }

    pub fn execute(&self, exp: &Experiment) -> crate::Result<()> {
        (self.action)(exp)
    }
}

/// An experiment: a name, an output directory, a run count and an ordered
/// list of steps. Steps are defined up front and never reordered.
pub struct Experiment {
    name: String,
    path: PathBuf,
    eval_dir: PathBuf,
    num_runs: usize,
    steps: Vec<Step>,
}

impl Experiment {
    pub fn new(name: &str, path: PathBuf) -> crate::Result<Self> {
        if name.is_empty() {
            return config_error("experiment name must not be empty".into());
        }
        let path = absolute_path(path);
        let eval_dir = PathBuf::from(format!("{}{}", path.display(), EVAL_DIR_SUFFIX));
        Ok(Experiment {
            name: name.to_string(),
            path,
            eval_dir,
            num_runs: 0,
            steps: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn eval_dir(&self) -> &Path {
        &self.eval_dir
    }

    pub fn set_eval_dir(&mut self, path: PathBuf) {
        self.eval_dir = absolute_path(path);
    }

    /// Number of runs the run-step fans out over.
    pub fn num_runs(&self) -> usize {
        self.num_runs
    }

    pub fn set_num_runs(&mut self, num_runs: usize) {
        self.num_runs = num_runs;
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Appends a step. Ordinals are assigned contiguously from 1 in the
    /// order of addition; step names must be unique and at most one step
    /// may be the run-step.
    pub fn add_step<F>(&mut self, name: &str, kind: StepKind, action: F) -> crate::Result<()>
    where
        F: Fn(&Experiment) -> crate::Result<()> + 'static,
    {
        if name.is_empty() {
            return config_error("step name must not be empty".into());
        }
        if self.steps.iter().any(|s| s.name == name) {
            return config_error(format!("duplicate step name: {name}"));
        }
        if kind == StepKind::Run && self.steps.iter().any(|s| s.is_run_step()) {
            return config_error("an experiment can have only one run step".into());
        }
        self.steps.push(Step {
            name: name.to_string(),
            ordinal: self.steps.len() + 1,
            kind,
            action: Box::new(action),
        });
        Ok(())
    }

    /// Resolves step selectors (names or 1-based positions) to steps,
    /// keeping the experiment's step order.
    pub fn select_steps(&self, selectors: &[String]) -> crate::Result<Vec<&Step>> {
        let mut selected: Vec<&Step> = Vec::new();
        for selector in selectors {
            let step = if let Ok(ordinal) = selector.parse::<usize>() {
                self.steps
                    .get(ordinal.wrapping_sub(1))
                    .ok_or_else(|| crate::Error::ConfigError(format!("no step #{ordinal}")))?
            } else {
                self.steps
                    .iter()
                    .find(|s| s.name == *selector)
                    .ok_or_else(|| crate::Error::ConfigError(format!("unknown step: {selector}")))?
            };
            if !selected.iter().any(|s| s.ordinal == step.ordinal) {
                selected.push(step);
            }
        }
        selected.sort_by_key(|s| s.ordinal);
        Ok(selected)
    }

    /// Job names must not start with a digit on either scheduler, so such
    /// experiment names get a `j` prepended.
    pub fn job_name_prefix(&self) -> String {
        let escape = if self.name.starts_with(|c: char| c.is_ascii_digit()) {
            "j"
        } else {
            ""
        };
        format!("{escape}{}-", self.name)
    }

    pub fn job_name(&self, step: &Step) -> String {
        format!("{}{:02}-{}", self.job_name_prefix(), step.ordinal, step.name)
    }

    pub fn job_dir_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.path.display(), JOB_DIR_SUFFIX))
    }

    pub fn remove_experiment_dir(&self) -> std::io::Result<()> {
        remove_path(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &Experiment) -> crate::Result<()> {
        Ok(())
    }

    fn three_step_exp() -> Experiment {
        let mut exp = Experiment::new("demo", PathBuf::from("/tmp/demo")).unwrap();
        exp.add_step("build", StepKind::Build, noop).unwrap();
        exp.add_step("start", StepKind::Run, noop).unwrap();
        exp.add_step("evaluate", StepKind::Other, noop).unwrap();
        exp
    }

    #[test]
    fn ordinals_are_contiguous_from_one() {
        let exp = three_step_exp();
        let ordinals: Vec<_> = exp.steps().iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_second_run_step() {
        let mut exp = three_step_exp();
        assert!(exp.add_step("start2", StepKind::Run, noop).is_err());
    }

    #[test]
    fn rejects_duplicate_step_name() {
        let mut exp = three_step_exp();
        assert!(exp.add_step("build", StepKind::Other, noop).is_err());
    }

    #[test]
    fn job_name_prefix_escapes_leading_digit() {
        let exp = Experiment::new("2024-eval", PathBuf::from("/tmp/e")).unwrap();
        assert_eq!(exp.job_name_prefix(), "j2024-eval-");
        let exp = Experiment::new("demo", PathBuf::from("/tmp/e")).unwrap();
        assert_eq!(exp.job_name_prefix(), "demo-");
    }

    #[test]
    fn job_name_contains_two_digit_ordinal() {
        let exp = three_step_exp();
        assert_eq!(exp.job_name(&exp.steps()[1]), "demo-02-start");
    }

    #[test]
    fn job_dir_is_derived_from_experiment_path() {
        let exp = three_step_exp();
        assert_eq!(exp.job_dir_path(), PathBuf::from("/tmp/demo-grid-steps"));
    }

    #[test]
    fn select_steps_by_name_and_ordinal() {
        let exp = three_step_exp();
        let steps = exp.select_steps(&["evaluate".into(), "1".into()]).unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["build", "evaluate"]);
    }

    #[test]
    fn select_steps_rejects_unknown() {
        let exp = three_step_exp();
        assert!(exp.select_steps(&["transmogrify".into()]).is_err());
        assert!(exp.select_steps(&["4".into()]).is_err());
    }
}
