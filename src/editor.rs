//! Interactive text entry through an external editor.

use std::fs;
use std::io::Write;
use std::process::Command;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EditorError {
    #[error("Editor command is empty")]
    NoCommand,

    #[error("Editor '{command}' exited with {status}")]
    Failed { command: String, status: String },

    #[error("I/O error while editing: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that lets a person edit a seed text and hands back the result.
pub trait Editor {
    /// Returns `Ok(None)` when the user left the text unchanged or empty.
    fn edit(&self, seed: &str) -> Result<Option<String>, EditorError>;
}

/// Runs a shell command such as `vi` or `emacsclient -t` on a temporary file.
#[derive(Debug, Clone)]
pub struct ExternalEditor {
    command: String,
}

impl ExternalEditor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Build from an optional configured command.
    pub fn from_config(command: Option<&str>) -> Option<Self> {
        command
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(Self::new)
    }

    fn shell(&self, path: &str) -> Command {
        let line = format!("{} {}", self.command, path);
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(line);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        }
    }
}

impl Editor for ExternalEditor {
    fn edit(&self, seed: &str) -> Result<Option<String>, EditorError> {
        if self.command.trim().is_empty() {
            return Err(EditorError::NoCommand);
        }

        let mut file = tempfile::Builder::new()
            .prefix("everbug-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(seed.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        debug!(command = %self.command, path = %path, "launching editor");
        let status = self.shell(&path).status()?;
        if !status.success() {
            return Err(EditorError::Failed {
                command: self.command.clone(),
                status: status.to_string(),
            });
        }

        let output = fs::read_to_string(file.path())?;
        if output == seed || output.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(output))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_editor_replaces_text() {
        let editor = ExternalEditor::new("echo 'I like cheese' >");
        let out = editor.edit("seed\n").unwrap();
        assert_eq!(out.as_deref(), Some("I like cheese\n"));
    }

    #[test]
    fn test_unchanged_text_is_none() {
        let editor = ExternalEditor::new("true");
        assert!(editor.edit("seed\n").unwrap().is_none());
    }

    #[test]
    fn test_failing_editor() {
        let editor = ExternalEditor::new("false");
        assert!(matches!(
            editor.edit("seed\n").unwrap_err(),
            EditorError::Failed { .. }
        ));
    }

    #[test]
    fn test_from_config_ignores_blank() {
        assert!(ExternalEditor::from_config(Some("  ")).is_none());
        assert!(ExternalEditor::from_config(None).is_none());
        assert!(ExternalEditor::from_config(Some("vi")).is_some());
    }
}
