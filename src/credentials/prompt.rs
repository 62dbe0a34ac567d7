//! Interactive line reader used as the last credential source.

use std::io::{self, BufRead, IsTerminal, Write};

use thiserror::Error;

/// Errors raised while prompting for a value.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PromptError {
    /// Raised when stdin is not attached to a terminal.
    #[error("no interactive terminal is attached")]
    NotInteractive,
    /// Raised when stdin reaches end of file before a line is read.
    #[error("input closed before a value was entered")]
    Closed,
    /// Raised when reading from the terminal fails.
    #[error("failed to read input: {message}")]
    Io {
        /// Operating system error string.
        message: String,
    },
}

/// Reads a single line of user input.
pub trait LineReader {
    /// Shows `prompt` and returns the entered line without its terminator.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError`] when no terminal is attached or input fails.
    fn read_line(&self, prompt: &str) -> Result<String, PromptError>;
}

impl<R: LineReader + ?Sized> LineReader for &R {
    fn read_line(&self, prompt: &str) -> Result<String, PromptError> {
        (**self).read_line(prompt)
    }
}

/// Prompts on stderr and reads from stdin.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalLineReader;

impl LineReader for TerminalLineReader {
    fn read_line(&self, prompt: &str) -> Result<String, PromptError> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Err(PromptError::NotInteractive);
        }

        let mut stderr = io::stderr().lock();
        stderr
            .write_all(prompt.as_bytes())
            .and_then(|()| stderr.flush())
            .map_err(|err| PromptError::Io {
                message: err.to_string(),
            })?;

        let mut line = String::new();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .map_err(|err| PromptError::Io {
                message: err.to_string(),
            })?;
        if read == 0 {
            return Err(PromptError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_owned())
    }
}

/// Reader that never has input, for non-interactive runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonInteractive;

impl LineReader for NonInteractive {
    fn read_line(&self, _prompt: &str) -> Result<String, PromptError> {
        Err(PromptError::NotInteractive)
    }
}
