use crate::common::error::config_error;
use crate::environment::{validate_step_selection, Environment};
use crate::experiment::{Experiment, Step};

/// Runs the selected steps sequentially in the calling process.
pub struct LocalEnvironment {
    processes: usize,
}

impl LocalEnvironment {
    /// If given, `processes` must be between 1 and the number of CPUs.
    /// If omitted, it is set to the number of CPUs.
    pub fn new(processes: Option<usize>) -> crate::Result<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let processes = processes.unwrap_or(cores);
        if processes < 1 || processes > cores {
            return config_error(format!(
                "processes must be in the range [1, ..., {cores}], got {processes}"
            ));
        }
        Ok(LocalEnvironment { processes })
    }

    /// Concurrency width the run-step's action may use.
    pub fn processes(&self) -> usize {
        self.processes
    }
}

impl Environment for LocalEnvironment {
    fn run_steps(&mut self, exp: &Experiment, steps: &[&Step]) -> crate::Result<()> {
        validate_step_selection(steps)?;
        for step in steps {
            log::info!("Running step {:02}-{}", step.ordinal(), step.name());
            step.execute(exp)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    use super::*;
    use crate::experiment::StepKind;

    fn recording_exp(fail_step: Option<&str>) -> (Experiment, Rc<RefCell<Vec<String>>>) {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut exp = Experiment::new("local", PathBuf::from("/tmp/local-exp")).unwrap();
        for (name, kind) in [
            ("build", StepKind::Build),
            ("start", StepKind::Run),
            ("evaluate", StepKind::Other),
        ] {
            let trace = Rc::clone(&trace);
            let fails = fail_step == Some(name);
            let name_owned = name.to_string();
            exp.add_step(name, kind, move |_| {
                trace.borrow_mut().push(name_owned.clone());
                if fails {
                    Err(crate::Error::GenericError("step failed".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        }
        (exp, trace)
    }

    #[test]
    fn executes_steps_in_ordinal_order() {
        let (exp, trace) = recording_exp(None);
        let steps: Vec<_> = exp.steps().iter().collect();
        let mut env = LocalEnvironment::new(Some(1)).unwrap();
        env.run_steps(&exp, &steps).unwrap();
        assert_eq!(*trace.borrow(), vec!["build", "start", "evaluate"]);
    }

    #[test]
    fn failing_step_aborts_the_rest() {
        let (exp, trace) = recording_exp(Some("start"));
        let steps: Vec<_> = exp.steps().iter().collect();
        let mut env = LocalEnvironment::new(Some(1)).unwrap();
        assert!(env.run_steps(&exp, &steps).is_err());
        assert_eq!(*trace.borrow(), vec!["build", "start"]);
    }

    #[test]
    fn empty_selection_is_rejected() {
        let (exp, _) = recording_exp(None);
        let mut env = LocalEnvironment::new(None).unwrap();
        assert!(env.run_steps(&exp, &[]).is_err());
    }

    #[test]
    fn process_count_is_bounded() {
        assert!(LocalEnvironment::new(Some(0)).is_err());
        assert!(LocalEnvironment::new(Some(100_000)).is_err());
    }
}
