//! Terminal implementation of [`DialogPresenter`].
//!
//! Questions go to stdout and answers are read from stdin on the blocking
//! pool, so a pending prompt never stalls the runtime. End of input counts
//! as "no" (or Cancel).

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use tracing::debug;

use crate::restore::{DialogPresenter, RestoreChoice};
use crate::risk::Confirmation;

/// Invalid answers tolerated before a prompt gives up.
const MAX_ATTEMPTS: usize = 3;

pub struct TerminalPresenter {
    assume_yes: bool,
    skip_restore: bool,
}

impl TerminalPresenter {
    pub fn new(assume_yes: bool, skip_restore: bool) -> Self {
        Self {
            assume_yes,
            skip_restore,
        }
    }
}

#[async_trait]
impl DialogPresenter for TerminalPresenter {
    async fn restore_point_prompt(&self) -> RestoreChoice {
        if self.skip_restore {
            return RestoreChoice::Skip;
        }
        if self.assume_yes {
            return RestoreChoice::Create;
        }

        println!();
        println!("Create a System Restore Point?");
        println!("Tweaks may change system settings. A restore point lets you roll back.");
        for _ in 0..MAX_ATTEMPTS {
            let Some(answer) = ask("[C]reate / [S]kip / Ca[n]cel: ").await else {
                return RestoreChoice::Cancel;
            };
            if let Some(choice) = parse_restore_choice(&answer) {
                return choice;
            }
            println!("Please answer c, s or n.");
        }
        RestoreChoice::Cancel
    }

    async fn confirm(&self, confirmation: &Confirmation) -> bool {
        if self.assume_yes {
            return true;
        }

        println!();
        println!("{} - {}", confirmation.title, confirmation.header);
        println!();
        println!("{}", confirmation.body);
        println!();
        if confirmation.high_risk {
            // High-risk actions need the full word
            return ask("Type 'yes' to continue: ")
                .await
                .is_some_and(|answer| answer.eq_ignore_ascii_case("yes"));
        }
        ask("Proceed? [y/N] ")
            .await
            .is_some_and(|answer| parse_yes(&answer))
    }

    async fn confirm_cancel(&self) -> bool {
        if self.assume_yes {
            return true;
        }
        ask("\nCancel the running operation? [y/N] ")
            .await
            .is_some_and(|answer| parse_yes(&answer))
    }
}

async fn ask(question: &str) -> Option<String> {
    let question = question.to_string();
    let answer = tokio::task::spawn_blocking(move || -> io::Result<Option<String>> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(question.as_bytes())?;
        stdout.flush()?;
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        Ok((read > 0).then(|| line.trim().to_string()))
    })
    .await;

    match answer {
        Ok(Ok(answer)) => answer,
        Ok(Err(e)) => {
            debug!("Prompt failed: {e}");
            None
        }
        Err(e) => {
            debug!("Prompt task failed: {e}");
            None
        }
    }
}

fn parse_yes(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}

fn parse_restore_choice(answer: &str) -> Option<RestoreChoice> {
    match answer.to_ascii_lowercase().as_str() {
        "c" | "create" => Some(RestoreChoice::Create),
        "s" | "skip" => Some(RestoreChoice::Skip),
        "n" | "cancel" => Some(RestoreChoice::Cancel),
        _ => None,
    }
}
