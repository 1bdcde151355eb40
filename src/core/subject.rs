//! The project/experiment an action sequence acts on

use crate::core::action::ActionResult;
use async_trait::async_trait;
use std::path::Path;

/// A project (or experiment) that can be built and run
///
/// Implementations return `Ok(None)` when the step produced no explicit
/// status; the pipeline treats that as success.
#[async_trait]
pub trait Subject: Send + Sync {
    /// Project name, used in log lines and failure reports
    fn name(&self) -> &str;

    /// Project version
    fn version(&self) -> &str;

    /// Directory the project is built in
    fn builddir(&self) -> &Path;

    /// Compile the project
    async fn compile(&self) -> ActionResult;

    /// Run the project
    async fn run(&self) -> ActionResult;
}
