//! Operator confirmation capability.
//!
//! The rebuild machinery never talks to a terminal directly - it is handed a
//! [`Prompt`] by the command layer. Non-interactive runs inject
//! [`AutoConfirm`]; tests inject scripted implementations.

use anyhow::Error;
use rustyline::error::ReadlineError;

pub trait Prompt: Send + Sync {
    /// Ask a yes/no question. The default answer is "no".
    fn confirm(&self, message: &str) -> Result<bool, Error>;
}

/// Interactive confirmation on the controlling terminal.
pub struct TtyPrompt;

impl Prompt for TtyPrompt {
    fn confirm(&self, message: &str) -> Result<bool, Error> {
        let mut rl = rustyline::Editor::<()>::new();
        loop {
            match rl.readline(&format!("{} [y/N]: ", message)) {
                Ok(line) => match line.trim().to_ascii_lowercase().as_str() {
                    "y" | "yes" => return Ok(true),
                    "" | "n" | "no" => return Ok(false),
                    _ => continue,
                },
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Fixed answer for non-interactive runs (`--no-safe-run`, `--yes`).
pub struct AutoConfirm(pub bool);

impl Prompt for AutoConfirm {
    fn confirm(&self, _message: &str) -> Result<bool, Error> {
        Ok(self.0)
    }
}
