pub mod grid;
pub mod local;

use rand::seq::SliceRandom;

use crate::common::error::config_error;
use crate::experiment::{Experiment, Step};

/// How an ordered list of steps gets executed: in-process (local) or as
/// chained scheduler jobs (grid).
pub trait Environment {
    fn run_steps(&mut self, exp: &Experiment, steps: &[&Step]) -> crate::Result<()>;

    /// Returns true if the scheduler still reports any tracked job.
    fn check_cluster_status(&mut self, exp: &Experiment, printout: bool) -> crate::Result<bool> {
        let _ = (exp, printout);
        log::info!("Checking cluster status is not supported for this environment.");
        Ok(false)
    }

    fn remove_cluster_jobs(&mut self, exp: &Experiment, confirm_each: bool) -> crate::Result<()> {
        let _ = (exp, confirm_each);
        log::info!("Removing cluster jobs is not supported for this environment.");
        Ok(())
    }
}

pub(crate) fn validate_step_selection(steps: &[&Step]) -> crate::Result<()> {
    if steps.is_empty() {
        return config_error("no steps selected".into());
    }
    Ok(())
}

/// The order in which array tasks are dispatched, as run indices `1..=n`.
/// Shuffling avoids systematic correlated load; it is fixed once per
/// submission and is a presentation detail, not a semantic reordering.
pub fn task_order(num_runs: usize, randomize: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (1..=num_runs).collect();
    if randomize {
        order.shuffle(&mut rand::rng());
    }
    order
}
