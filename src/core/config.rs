//! Experiment configuration from YAML

use crate::core::subject::Subject;
use crate::project::{CommandProject, ShellCommand};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level experiment configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment name
    pub name: String,

    /// Optional experiment description
    #[serde(default)]
    pub description: Option<String>,

    /// Number of pool workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Projects the experiment is applied to
    pub projects: Vec<ProjectConfig>,
}

/// Project configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Unique project name
    pub name: String,

    /// Project version
    #[serde(default = "default_version")]
    pub version: String,

    /// Build directory
    pub builddir: PathBuf,

    /// Commands run by the compile step, each as an argv list
    #[serde(default)]
    pub compile: Vec<Vec<String>>,

    /// Commands run by the run step, each as an argv list
    #[serde(default)]
    pub run: Vec<Vec<String>>,
}

fn default_workers() -> usize {
    4
}

fn default_version() -> String {
    "0.0.1".to_string()
}

impl ExperimentConfig {
    /// Load experiment configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse experiment configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ExperimentConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the experiment configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Experiment name must not be empty");
        }

        if self.workers == 0 {
            anyhow::bail!("Experiment '{}' needs at least one worker", self.name);
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            if !seen.insert(&project.name) {
                anyhow::bail!("Duplicate project name: {}", project.name);
            }

            for argv in project.compile.iter().chain(project.run.iter()) {
                if argv.is_empty() || argv[0].trim().is_empty() {
                    anyhow::bail!("Project '{}' has an empty command", project.name);
                }
            }
        }

        Ok(())
    }

    /// Build the configured projects
    pub fn to_projects(&self) -> Vec<Arc<dyn Subject>> {
        self.projects
            .iter()
            .map(|p| Arc::new(p.to_project()) as Arc<dyn Subject>)
            .collect()
    }
}

impl ProjectConfig {
    /// Build a command-backed project from this configuration
    pub fn to_project(&self) -> CommandProject {
        let to_commands = |argvs: &[Vec<String>]| {
            argvs
                .iter()
                .map(|argv| ShellCommand::new(&argv[0]).args(argv[1..].iter().cloned()))
                .collect::<Vec<_>>()
        };

        CommandProject::new(&self.name, &self.version, &self.builddir)
            .with_compile(to_commands(&self.compile))
            .with_run(to_commands(&self.run))
    }
}
