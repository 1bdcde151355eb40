//! Projects that experiments are applied to

pub mod command;

use crate::core::action::{ActionResult, ActionStatus};
use crate::core::subject::Subject;
use async_trait::async_trait;
pub use command::ShellCommand;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A project whose compile and run steps are external commands
///
/// Commands of a step run in order inside the build directory and the step
/// stops at the first failing command.
#[derive(Debug, Clone)]
pub struct CommandProject {
    name: String,
    version: String,
    builddir: PathBuf,
    compile: Vec<ShellCommand>,
    run: Vec<ShellCommand>,
}

impl CommandProject {
    /// Create a project without any commands
    pub fn new(name: impl Into<String>, version: impl Into<String>, builddir: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            builddir: builddir.as_ref().to_path_buf(),
            compile: Vec::new(),
            run: Vec::new(),
        }
    }

    /// Set the commands of the compile step
    pub fn with_compile(mut self, commands: Vec<ShellCommand>) -> Self {
        self.compile = commands;
        self
    }

    /// Set the commands of the run step
    pub fn with_run(mut self, commands: Vec<ShellCommand>) -> Self {
        self.run = commands;
        self
    }

    async fn run_all(&self, step: &str, commands: &[ShellCommand]) -> ActionResult {
        if commands.is_empty() {
            debug!("{}: nothing to {}", self.name, step);
            return Ok(None);
        }

        for command in commands {
            let stdout = command.execute(&self.builddir).await?;
            debug!("{}: `{}` produced {} bytes", self.name, command, stdout.len());
        }

        Ok(Some(ActionStatus::Ok))
    }
}

#[async_trait]
impl Subject for CommandProject {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn builddir(&self) -> &Path {
        &self.builddir
    }

    async fn compile(&self) -> ActionResult {
        self.run_all("compile", &self.compile).await
    }

    async fn run(&self) -> ActionResult {
        self.run_all("run", &self.run).await
    }
}
