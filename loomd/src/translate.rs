//! Translation through an external command
//!
//! The command gets the text on stdin and prints the translation on stdout.

use async_trait::async_trait;
use loom_core::Translator;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs a shell command once per text
#[derive(Debug, Clone)]
pub struct CommandTranslator {
    command: String,
}

impl CommandTranslator {
    /// Translator for a shell command line
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Translator for CommandTranslator {
    async fn translate(&self, text: &str) -> Result<String, String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("cannot start {:?}: {e}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await.map_err(|e| e.to_string())?;
        }

        let output = child.wait_with_output().await.map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(format!(
                "translator exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_is_the_translation() {
        let translator = CommandTranslator::new("tr a-z A-Z");
        assert_eq!(translator.translate("a room.\n").await.unwrap(), "A ROOM.");
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let translator = CommandTranslator::new("cat >/dev/null; echo nope >&2; exit 3");
        let err = translator.translate("x").await.unwrap_err();
        assert!(err.contains("nope"), "{err}");
    }
}
