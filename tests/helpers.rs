//! Test utility functions for expipe

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use expipe::core::action::{Action, ActionError, ActionResult, ActionStatus};
use expipe::core::subject::Subject;
use expipe::execution::{ExperimentEvent, ExperimentPipeline, ProcessPoolScheduler, SignalRegistry, StepOutcome};
use expipe::persistence::{
    ExperimentRecord, ExperimentStore, InMemoryStore, PersistenceError, StoreSession,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What a mock subject does when compiled or run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Return no status
    Silent,
    /// Return the given status
    Status(ActionStatus),
    /// Fail like a command exiting non-zero
    Fail,
    /// Report an operator interrupt
    Interrupt,
    /// Raise an unexpected fault
    Fault,
}

impl Behavior {
    fn act(self, command: &str) -> ActionResult {
        match self {
            Behavior::Silent => Ok(None),
            Behavior::Status(status) => Ok(Some(status)),
            Behavior::Fail => Err(ActionError::CommandFailed {
                command: command.to_string(),
                exit_code: Some(2),
                stderr: "mock failure".to_string(),
            }),
            Behavior::Interrupt => Err(ActionError::Interrupted),
            Behavior::Fault => Err(ActionError::Unexpected(format!("{} exploded", command))),
        }
    }
}

/// Subject with scripted compile and run outcomes
pub struct MockSubject {
    name: String,
    builddir: PathBuf,
    compile: Behavior,
    run: Behavior,
    calls: Mutex<Vec<&'static str>>,
}

impl MockSubject {
    pub fn new(name: &str, builddir: &Path) -> Self {
        Self {
            name: name.to_string(),
            builddir: builddir.to_path_buf(),
            compile: Behavior::Silent,
            run: Behavior::Silent,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn compiling(mut self, behavior: Behavior) -> Self {
        self.compile = behavior;
        self
    }

    pub fn running(mut self, behavior: Behavior) -> Self {
        self.run = behavior;
        self
    }

    /// Capabilities invoked so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subject for MockSubject {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn builddir(&self) -> &Path {
        &self.builddir
    }

    async fn compile(&self) -> ActionResult {
        self.calls.lock().unwrap().push("compile");
        self.compile.act("compile")
    }

    async fn run(&self) -> ActionResult {
        self.calls.lock().unwrap().push("run");
        self.run.act("run")
    }
}

/// Wrap a mock subject for use in actions
pub fn shared(subject: MockSubject) -> (Arc<MockSubject>, Arc<dyn Subject>) {
    let concrete = Arc::new(subject);
    let dynamic: Arc<dyn Subject> = concrete.clone();
    (concrete, dynamic)
}

/// Action that returns `status` without doing anything else
pub fn status_action(subject: &Arc<dyn Subject>, name: &str, status: ActionStatus) -> Action {
    Action::new(name, format!("Return {}", status), subject)
        .with_fn(move || async move { Ok(Some(status)) })
}

/// Action that appends `(subject, step)` to `log` after yielding once
pub fn logging_action(
    subject: &Arc<dyn Subject>,
    step: usize,
    log: &Arc<Mutex<Vec<(String, usize)>>>,
) -> Action {
    let name = subject.name().to_string();
    let log = Arc::clone(log);
    Action::new(format!("step-{}", step), format!("Log step {}", step), subject).with_fn(
        move || {
            let name = name.clone();
            let log = Arc::clone(&log);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                log.lock().unwrap().push((name, step));
                Ok(None)
            }
        },
    )
}

/// Action that waits `delay_ms`, then records the current time into `stamps`
pub fn stamping_action(
    subject: &Arc<dyn Subject>,
    delay_ms: u64,
    stamps: &Arc<Mutex<Vec<DateTime<Utc>>>>,
) -> Action {
    let stamps = Arc::clone(stamps);
    Action::new("stamp", "Record the time", subject).with_fn(move || {
        let stamps = Arc::clone(&stamps);
        async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            stamps.lock().unwrap().push(Utc::now());
            Ok(None)
        }
    })
}

/// Latest time recorded by any stamping action
pub fn last_stamp(stamps: &Arc<Mutex<Vec<DateTime<Utc>>>>) -> DateTime<Utc> {
    stamps.lock().unwrap().iter().copied().max().unwrap()
}

/// Pipeline over a fresh in-memory store
pub fn in_memory_pipeline(
    workers: usize,
) -> (ExperimentPipeline<ProcessPoolScheduler>, InMemoryStore, Arc<SignalRegistry>) {
    let scheduler = ProcessPoolScheduler::new(workers).unwrap();
    let store = InMemoryStore::new();
    let registry = Arc::new(SignalRegistry::new());
    let pipeline = ExperimentPipeline::new(scheduler, Arc::new(store.clone()), Arc::clone(&registry));
    (pipeline, store, registry)
}

/// Step failures among `events`, in arrival order
pub fn step_failures(events: &[ExperimentEvent]) -> Vec<StepOutcome> {
    events
        .iter()
        .filter_map(|event| match event {
            ExperimentEvent::StepFailed(outcome) => Some(outcome.clone()),
            _ => None,
        })
        .collect()
}

/// Stream failures among `events` as `(subject, error)`
pub fn stream_failures(events: &[ExperimentEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            ExperimentEvent::StreamFailed { subject, error, .. } => {
                Some((subject.clone(), error.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Subjects whose streams completed
pub fn completed(events: &[ExperimentEvent]) -> Vec<String> {
    let mut subjects: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ExperimentEvent::Completed { subject, .. } => Some(subject.clone()),
            _ => None,
        })
        .collect();
    subjects.sort();
    subjects
}

/// Store that cannot persist anything
pub struct BrokenStore;

#[async_trait]
impl ExperimentStore for BrokenStore {
    async fn persist_experiment(
        &self,
        _record: &ExperimentRecord,
    ) -> Result<(ExperimentRecord, Box<dyn StoreSession>), PersistenceError> {
        Err(PersistenceError::Database("disk is read-only".to_string()))
    }

    async fn load_experiment(&self, _id: Uuid) -> Result<Option<ExperimentRecord>, PersistenceError> {
        Ok(None)
    }

    async fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, PersistenceError> {
        Ok(Vec::new())
    }
}
