use std::collections::VecDeque;
use std::io::Write;

use crate::Error;

/// Capability for asking the operator yes/no questions.
///
/// Destructive operations (clearing a job directory, cancelling cluster
/// jobs) are gated behind these prompts. The safe default answer is "no".
pub trait Confirmer {
    fn answer_yes(&mut self, question: &str) -> bool;

    fn confirm_or_abort(&mut self, question: &str) -> crate::Result<()> {
        if self.answer_yes(question) {
            Ok(())
        } else {
            Err(Error::UserAbort)
        }
    }
}

/// Blocking stdin prompt, `(y/N)` convention.
#[derive(Default)]
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn answer_yes(&mut self, question: &str) -> bool {
        print!("{question} (y/N): ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }
}

/// Answers every question the same way. Used for `--yes` invocations.
pub struct PresetConfirmer {
    answer: bool,
}

impl PresetConfirmer {
    pub fn new(answer: bool) -> Self {
        PresetConfirmer { answer }
    }
}

impl Confirmer for PresetConfirmer {
    fn answer_yes(&mut self, question: &str) -> bool {
        log::info!("{question} -> {}", if self.answer { "y" } else { "n" });
        self.answer
    }
}

/// Replays a scripted sequence of answers; runs out loudly.
pub struct CannedConfirmer {
    answers: VecDeque<bool>,
}

impl CannedConfirmer {
    pub fn new(answers: Vec<bool>) -> Self {
        CannedConfirmer {
            answers: answers.into(),
        }
    }
}

impl Confirmer for CannedConfirmer {
    fn answer_yes(&mut self, question: &str) -> bool {
        match self.answers.pop_front() {
            Some(answer) => answer,
            None => panic!("no canned answer left for question: {question}"),
        }
    }
}
