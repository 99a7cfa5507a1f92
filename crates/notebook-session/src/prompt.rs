//! Confirmation prompt contract.
//!
//! Only a response whose text is exactly [`AFFIRMATIVE`] counts as consent.
//! Any other text, and any dismissal, is a decline.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::container::ContainerId;
use crate::error::PromptDismissed;

/// Response text that confirms the prompt.
pub const AFFIRMATIVE: &str = "OK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub title: String,
    pub body: String,
    /// Container the dialog is shown over
    pub host: ContainerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptResponse {
    pub text: String,
}

impl PromptResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn is_affirmative(&self) -> bool {
        self.text == AFFIRMATIVE
    }
}

#[async_trait]
pub trait ConfirmPrompt: Send + Sync {
    async fn show(&self, dialog: Dialog) -> Result<PromptResponse, PromptDismissed>;
}

/// Prompt on the controlling terminal.
///
/// "y", "yes" and "ok" (any case) map to [`AFFIRMATIVE`]; other input is
/// passed through as-is, and end of input dismisses the prompt.
pub struct TerminalPrompt;

#[async_trait]
impl ConfirmPrompt for TerminalPrompt {
    async fn show(&self, dialog: Dialog) -> Result<PromptResponse, PromptDismissed> {
        let mut stdout = tokio::io::stdout();
        let question = format!("{}\n{} [OK/Cancel] ", dialog.title, dialog.body);
        stdout
            .write_all(question.as_bytes())
            .await
            .map_err(|e| PromptDismissed(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| PromptDismissed(e.to_string()))?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| PromptDismissed(e.to_string()))?;
        if read == 0 {
            return Err(PromptDismissed("end of input".into()));
        }
        Ok(normalize_answer(&line))
    }
}

fn normalize_answer(line: &str) -> PromptResponse {
    let answer = line.trim();
    if ["y", "yes", "ok"]
        .iter()
        .any(|a| a.eq_ignore_ascii_case(answer))
    {
        PromptResponse::new(AFFIRMATIVE)
    } else {
        PromptResponse::new(answer)
    }
}
