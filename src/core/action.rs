//! Action domain model - one executable step of an experiment

use crate::core::subject::Subject;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, warn};

/// Result type for action results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActionStatus {
    /// Never executed
    #[default]
    Unset,
    /// Completed normally
    Ok,
    /// Completed with a recoverable condition, the sequence proceeds
    CanContinue,
    /// Execution raised a reportable failure
    Error,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Unset => "UNSET",
            ActionStatus::Ok => "OK",
            ActionStatus::CanContinue => "CAN_CONTINUE",
            ActionStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Error types raised while executing an action
#[derive(Debug, Error)]
pub enum ActionError {
    /// An external command exited non-zero or could not be started
    #[error("command `{command}` failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The operator asked the run to stop
    #[error("interrupted by operator")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected fault: {0}")]
    Unexpected(String),
}

/// Outcome of a single action invocation
pub type ActionResult = Result<Option<ActionStatus>, ActionError>;

/// Boxed future produced by an action callable
pub type ActionFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;

/// Zero-argument callable bound to an action
pub type ActionFn = Arc<dyn Fn() -> ActionFuture + Send + Sync>;

/// A single named step of an experiment
///
/// Everything except `status` is fixed at construction. The bound subject is
/// held weakly and only used for logging.
pub struct Action {
    /// Short identifier
    pub name: String,

    /// Human-readable description
    pub description: String,

    subject: Weak<dyn Subject>,
    execute: Option<ActionFn>,
    status: ActionStatus,
}

impl Action {
    /// Create an action without a callable
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        subject: &Arc<dyn Subject>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            subject: Arc::downgrade(subject),
            execute: None,
            status: ActionStatus::Unset,
        }
    }

    /// Bind the callable executed by this action
    pub fn with_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.execute = Some(Arc::new(move || Box::pin(f()) as ActionFuture));
        self
    }

    /// The subject this action acts on, if it is still alive
    pub fn subject(&self) -> Option<Arc<dyn Subject>> {
        self.subject.upgrade()
    }

    /// Name of the bound subject, if it is still alive
    pub fn subject_name(&self) -> Option<String> {
        self.subject().map(|s| s.name().to_string())
    }

    /// Current status
    pub fn status(&self) -> ActionStatus {
        self.status
    }

    /// Record the status of the current execution attempt
    pub fn record(&mut self, status: ActionStatus) {
        if self.status != ActionStatus::Unset {
            warn!(
                "Action '{}' already recorded {}, overwriting with {}",
                self.name, self.status, status
            );
        }
        self.status = status;
    }

    /// Invoke the bound callable; no callable yields no result
    pub async fn call(&self) -> ActionResult {
        match &self.execute {
            Some(f) => f().await,
            None => Ok(None),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("subject", &self.subject_name())
            .field("status", &self.status)
            .finish()
    }
}

/// Create the subject's build directory if it does not exist yet
pub fn make_build_dir(subject: &Arc<dyn Subject>) -> Action {
    let builddir: PathBuf = subject.builddir().to_path_buf();
    let description = format!("Create the build directory '{}'", builddir.display());

    Action::new("mkdir", description, subject)
        .with_fn(move || create_build_dir(builddir.clone()))
}

async fn create_build_dir(builddir: PathBuf) -> ActionResult {
    if !tokio::fs::try_exists(&builddir).await? {
        debug!("Creating build directory {}", builddir.display());
        tokio::fs::create_dir_all(&builddir).await?;
    }
    Ok(Some(ActionStatus::Ok))
}

/// Cleanup hook for the subject's build directory; currently a no-op
pub fn clean(subject: &Arc<dyn Subject>) -> Action {
    let description = format!(
        "Clean the build directory '{}'",
        subject.builddir().display()
    );

    Action::new("clean", description, subject).with_fn(|| async { Ok(None) })
}

/// Delegate to the project's compile capability
pub fn compile(project: &Arc<dyn Subject>) -> Action {
    let target = Arc::clone(project);
    Action::new("compile", "Compile the project", project).with_fn(move || {
        let target = Arc::clone(&target);
        async move { target.compile().await }
    })
}

/// Delegate to the project's run capability
pub fn run(project: &Arc<dyn Subject>) -> Action {
    let target = Arc::clone(project);
    Action::new("run", "Execute the run action", project).with_fn(move || {
        let target = Arc::clone(&target);
        async move { target.run().await }
    })
}

/// Emit a message
pub fn echo(subject: &Arc<dyn Subject>, message: impl Into<String>) -> Action {
    let message = message.into();
    let printed = message.clone();

    Action::new("echo", message, subject).with_fn(move || {
        let printed = printed.clone();
        async move {
            println!("{}", printed);
            Ok(None)
        }
    })
}

/// The standard clean/build/compile/run/clean sequence for one project
pub fn action_sequence(project: &Arc<dyn Subject>) -> Vec<Action> {
    vec![
        clean(project),
        make_build_dir(project),
        echo(
            project,
            format!(
                "Selected {} with version {}",
                project.name(),
                project.version()
            ),
        ),
        compile(project),
        run(project),
        clean(project),
    ]
}
