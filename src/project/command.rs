//! External command execution

use crate::core::action::ActionError;
use std::fmt;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// Placeholder replaced with the project's build directory
const BUILDDIR_PLACEHOLDER: &str = "{{ builddir }}";

/// SIGINT
#[cfg(unix)]
const SIGINT: i32 = 2;

/// An external command invoked by a project step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
}

impl ShellCommand {
    /// Create a command for the given program
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program name or path
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Render the argument list for the given build directory
    fn render_args(&self, builddir: &Path) -> Vec<String> {
        let builddir = builddir.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(BUILDDIR_PLACEHOLDER, &builddir))
            .collect()
    }

    /// Run the command inside `builddir` and capture stdout
    ///
    /// # Errors
    /// Returns `ActionError::CommandFailed` if the program cannot be spawned
    /// or exits non-zero, and `ActionError::Interrupted` if it was killed by
    /// an interrupt signal.
    pub async fn execute(&self, builddir: &Path) -> Result<String, ActionError> {
        let args = self.render_args(builddir);
        let rendered = format!("{} {}", self.program, args.join(" "));
        debug!("Running `{}` in {}", rendered.trim_end(), builddir.display());

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(builddir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ActionError::CommandFailed {
                command: rendered.trim_end().to_string(),
                exit_code: None,
                stderr: format!("failed to start: {}", e),
            })?;

        if !output.status.success() {
            if interrupted(&output.status) {
                return Err(ActionError::Interrupted);
            }

            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                "`{}` exited with code {:?}: {}",
                rendered.trim_end(),
                output.status.code(),
                stderr
            );
            return Err(ActionError::CommandFailed {
                command: rendered.trim_end().to_string(),
                exit_code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn interrupted(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(SIGINT)
}

#[cfg(not(unix))]
fn interrupted(_status: &std::process::ExitStatus) -> bool {
    false
}
