//! Experiment pipeline - runs action sequences on a scheduler and merges
//! their failures into one stream
//!
//! Each experiment is produced by an [`ExperimentStream`]: a start echo, the
//! experiment's actions, and a completion echo, bracketed by an experiment
//! transaction. Every produced action is pushed through the stages
//! log → execute & classify → normalize → filter, and the surviving
//! (non-OK) outcomes are sent to the experiment's channel. The whole
//! sequence is one unit of work on the scheduler, so steps of one
//! experiment never run concurrently.

use crate::core::action::{echo, Action, ActionError, ActionStatus};
use crate::core::subject::Subject;
use crate::execution::scheduler::{Cancellation, Disposable, Scheduler};
use crate::execution::signals::SignalRegistry;
use crate::persistence::{begin_transaction, ExperimentRecord, ExperimentStore, PersistenceError};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, error, info};

/// Capacity of each experiment's outcome channel
const PIPE_CAPACITY: usize = 16;

/// Capacity of the merged outcome channel
const AGGREGATE_CAPACITY: usize = 64;

/// A step that did not finish with `OK`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    /// Experiment name
    pub experiment: String,

    /// Subject the step acted on
    pub subject: String,

    /// Position in the produced sequence, bookends included
    pub index: usize,

    /// Action name
    pub action: String,

    /// Action description
    pub description: String,

    /// Normalized status
    pub status: ActionStatus,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} * {}: {} -> {}",
            self.index, self.subject, self.description, self.status
        )
    }
}

/// Events observed on a merged experiment stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExperimentEvent {
    /// A step finished with a non-OK status
    StepFailed(StepOutcome),

    /// The experiment's stream was aborted
    StreamFailed {
        experiment: String,
        subject: String,
        error: String,
    },

    /// The experiment's stream ran to its end
    Completed { experiment: String, subject: String },
}

impl ExperimentEvent {
    /// Subject the event originates from
    pub fn subject(&self) -> &str {
        match self {
            ExperimentEvent::StepFailed(outcome) => &outcome.subject,
            ExperimentEvent::StreamFailed { subject, .. } => subject,
            ExperimentEvent::Completed { subject, .. } => subject,
        }
    }

    /// Whether the event reports a step or stream failure
    pub fn is_failure(&self) -> bool {
        !matches!(self, ExperimentEvent::Completed { .. })
    }
}

/// Error types that abort an experiment stream
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("interrupted by operator")]
    Interrupted,

    #[error("stream was disposed")]
    Cancelled,

    #[error("no one is listening for outcomes")]
    Closed,

    #[error("experiment bookkeeping failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Receives every action an [`ExperimentStream`] produces, in order
#[async_trait]
pub trait ActionObserver: Send {
    async fn on_next(&mut self, index: usize, action: Action) -> Result<(), StreamError>;
}

/// One experiment's ordered action sequence
pub struct ExperimentStream {
    record: ExperimentRecord,
    subject: Arc<dyn Subject>,
    actions: Vec<Action>,
}

/// Build the stream for `actions` applied to `subject` within `experiment`
pub fn observable_experiment(
    experiment: &ExperimentRecord,
    subject: &Arc<dyn Subject>,
    actions: Vec<Action>,
) -> ExperimentStream {
    ExperimentStream {
        record: experiment.clone(),
        subject: Arc::clone(subject),
        actions,
    }
}

impl ExperimentStream {
    /// Experiment name
    pub fn experiment_name(&self) -> &str {
        &self.record.name
    }

    /// Subject name
    pub fn subject_name(&self) -> &str {
        self.subject.name()
    }

    /// Number of items the stream produces, bookends included
    pub fn len(&self) -> usize {
        self.actions.len() + 2
    }

    /// Never true: the bookends are always produced
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Begin the transaction, push every action to `observer`, then end it
    ///
    /// The transaction is ended on every exit path once it has begun, a
    /// panicking action included; the panic is resumed afterwards.
    /// Returns the number of actions pushed.
    pub async fn subscribe(
        self,
        store: &dyn ExperimentStore,
        registry: &Arc<SignalRegistry>,
        cancellation: &Cancellation,
        observer: &mut dyn ActionObserver,
    ) -> Result<usize, StreamError> {
        let transaction = begin_transaction(store, registry, &self.record).await?;
        let produced = AssertUnwindSafe(self.produce(cancellation, observer))
            .catch_unwind()
            .await;
        transaction.finish().await;

        match produced {
            Ok(result) => result,
            Err(panic) => panic::resume_unwind(panic),
        }
    }

    async fn produce(
        self,
        cancellation: &Cancellation,
        observer: &mut dyn ActionObserver,
    ) -> Result<usize, StreamError> {
        let start = echo(&self.subject, "Start experiment.");
        let stop = echo(&self.subject, "Completed experiment.");
        let sequence = iter::once(start)
            .chain(self.actions)
            .chain(iter::once(stop));

        let mut produced = 0;
        for (index, action) in sequence.enumerate() {
            if cancellation.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            observer.on_next(index, action).await?;
            produced += 1;
        }

        Ok(produced)
    }
}

/// Log an action with its position in the sequence
pub fn log_action(action: &Action, index: usize) {
    if let Some(subject) = action.subject_name() {
        info!("#{} * {}: {}", index, subject, action);
    }
}

fn log_error(error: &ActionError) {
    error!("==== ERROR ====");
    error!("Action failed because: {}", error);
    error!("==== ERROR ====");
}

/// Execute an action and classify its outcome
///
/// Command failures and unexpected faults become `ERROR`. Only an operator
/// interrupt is returned as an error, which aborts the stream.
pub async fn run_action(action: &Action, index: usize) -> Result<Option<ActionStatus>, ActionError> {
    match action.call().await {
        Ok(status) => Ok(status),
        Err(e @ ActionError::CommandFailed { .. }) => {
            log_error(&e);
            Ok(Some(ActionStatus::Error))
        }
        Err(ActionError::Interrupted) => {
            info!("User requested termination.");
            Err(ActionError::Interrupted)
        }
        Err(e) => {
            error!(
                "Exception in step #{} ({}) of {}: {:?}",
                index,
                action,
                action.subject_name().unwrap_or_default(),
                e
            );
            Ok(Some(ActionStatus::Error))
        }
    }
}

/// Map "no result" to `OK`, pass every status through unchanged otherwise
pub fn to_status(result: Option<ActionStatus>) -> ActionStatus {
    result.unwrap_or(ActionStatus::Ok)
}

/// Whether a normalized status is surfaced
pub fn is_failure(status: ActionStatus) -> bool {
    status != ActionStatus::Ok
}

/// The per-action stages of one experiment, ending in its outcome channel
pub struct StageChain {
    experiment: String,
    subject: String,
    sink: Sender<ExperimentEvent>,
}

impl StageChain {
    pub fn new(experiment: impl Into<String>, subject: impl Into<String>, sink: Sender<ExperimentEvent>) -> Self {
        Self {
            experiment: experiment.into(),
            subject: subject.into(),
            sink,
        }
    }
}

#[async_trait]
impl ActionObserver for StageChain {
    async fn on_next(&mut self, index: usize, mut action: Action) -> Result<(), StreamError> {
        log_action(&action, index);

        let result = run_action(&action, index)
            .await
            .map_err(|_| StreamError::Interrupted)?;
        let status = to_status(result);
        action.record(status);

        if !is_failure(status) {
            return Ok(());
        }

        let outcome = StepOutcome {
            experiment: self.experiment.clone(),
            subject: self.subject.clone(),
            index,
            action: action.name.clone(),
            description: action.description.clone(),
            status,
        };
        self.sink
            .send(ExperimentEvent::StepFailed(outcome))
            .await
            .map_err(|_| StreamError::Closed)
    }
}

/// One scheduled experiment and its outcome channel
pub struct ExperimentPipe {
    experiment: String,
    subject: String,
    events: Receiver<ExperimentEvent>,
    disposable: Disposable,
}

impl ExperimentPipe {
    /// Subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next non-OK outcome of this experiment alone
    pub async fn next(&mut self) -> Option<ExperimentEvent> {
        self.events.recv().await
    }

    /// Stop the experiment at its next action boundary
    pub fn dispose(&self) {
        self.disposable.dispose();
    }
}

/// The merged outcome stream of several experiments
///
/// Events of one experiment arrive in production order; events of different
/// experiments interleave arbitrarily. The stream ends once every experiment
/// has finished.
pub struct AggregateStream {
    events: Receiver<ExperimentEvent>,
    cancellations: Vec<Cancellation>,
}

impl AggregateStream {
    /// Next event, or `None` once every experiment has finished
    pub async fn next(&mut self) -> Option<ExperimentEvent> {
        self.events.recv().await
    }

    /// Drain the stream
    pub async fn collect(mut self) -> Vec<ExperimentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Number of merged experiments
    pub fn experiments(&self) -> usize {
        self.cancellations.len()
    }

    /// Stop every experiment at its next action boundary
    pub fn dispose(&self) {
        for cancellation in &self.cancellations {
            cancellation.cancel();
        }
    }
}

/// Runs experiment streams on a scheduler
pub struct ExperimentPipeline<S> {
    scheduler: S,
    store: Arc<dyn ExperimentStore>,
    registry: Arc<SignalRegistry>,
}

impl<S: Scheduler> ExperimentPipeline<S> {
    pub fn new(scheduler: S, store: Arc<dyn ExperimentStore>, registry: Arc<SignalRegistry>) -> Self {
        Self {
            scheduler,
            store,
            registry,
        }
    }

    /// The scheduler experiments are subscribed on
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Subscribe the stream on the scheduler as a single unit of work
    pub fn create_experiment_pipe(&self, stream: ExperimentStream) -> ExperimentPipe {
        let (sink, events) = mpsc::channel(PIPE_CAPACITY);
        let experiment = stream.experiment_name().to_string();
        let subject = stream.subject_name().to_string();
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);

        let disposable = self
            .scheduler
            .schedule((stream, sink), move |_scheduler, token, (stream, sink)| async move {
                run_experiment(stream, store.as_ref(), &registry, &token, sink).await;
            });

        ExperimentPipe {
            experiment,
            subject,
            events,
            disposable,
        }
    }

    /// Schedule every stream and merge their outcomes
    pub fn run(&self, streams: Vec<ExperimentStream>) -> AggregateStream {
        let pipes = streams
            .into_iter()
            .map(|stream| self.create_experiment_pipe(stream))
            .collect();
        merge(pipes)
    }
}

async fn run_experiment(
    stream: ExperimentStream,
    store: &dyn ExperimentStore,
    registry: &Arc<SignalRegistry>,
    token: &Cancellation,
    sink: Sender<ExperimentEvent>,
) {
    let experiment = stream.experiment_name().to_string();
    let subject = stream.subject_name().to_string();
    let mut stages = StageChain::new(experiment.clone(), subject.clone(), sink.clone());

    match stream.subscribe(store, registry, token, &mut stages).await {
        Ok(produced) => debug!("{} on {}: produced {} actions", experiment, subject, produced),
        Err(StreamError::Cancelled) => info!("{} on {} was disposed", experiment, subject),
        Err(StreamError::Closed) => debug!("{} on {}: outcome channel closed", experiment, subject),
        Err(e) => {
            error!("{} on {} aborted: {}", experiment, subject, e);
            let _ = sink
                .send(ExperimentEvent::StreamFailed {
                    experiment,
                    subject,
                    error: e.to_string(),
                })
                .await;
        }
    }
}

/// Fan the pipes' outcomes into one stream
pub fn merge(pipes: Vec<ExperimentPipe>) -> AggregateStream {
    let (sink, events) = mpsc::channel(AGGREGATE_CAPACITY);
    let cancellations = pipes.iter().map(|p| p.disposable.cancellation()).collect();

    for pipe in pipes {
        tokio::spawn(forward(pipe, sink.clone()));
    }

    AggregateStream {
        events,
        cancellations,
    }
}

async fn forward(pipe: ExperimentPipe, sink: Sender<ExperimentEvent>) {
    let ExperimentPipe {
        experiment,
        subject,
        mut events,
        disposable,
    } = pipe;

    let mut aborted = false;
    while let Some(event) = events.recv().await {
        aborted |= matches!(event, ExperimentEvent::StreamFailed { .. });
        if sink.send(event).await.is_err() {
            break;
        }
    }
    drop(events);

    let disposed = disposable.is_disposed();
    let terminal = match disposable.join().await {
        Err(e) => Some(ExperimentEvent::StreamFailed {
            experiment,
            subject,
            error: e.to_string(),
        }),
        Ok(()) if aborted || disposed => None,
        Ok(()) => Some(ExperimentEvent::Completed { experiment, subject }),
    };

    if let Some(event) = terminal {
        let _ = sink.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::ActionResult;
    use std::path::Path;

    struct Quiet;

    #[async_trait]
    impl Subject for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }

        fn version(&self) -> &str {
            "1"
        }

        fn builddir(&self) -> &Path {
            Path::new("/tmp")
        }

        async fn compile(&self) -> ActionResult {
            Ok(None)
        }

        async fn run(&self) -> ActionResult {
            Ok(None)
        }
    }

    fn subject() -> Arc<dyn Subject> {
        Arc::new(Quiet)
    }

    fn failing_with(subject: &Arc<dyn Subject>, error: fn() -> ActionError) -> Action {
        Action::new("fail", "Fails", subject).with_fn(move || async move { Err(error()) })
    }

    #[test]
    fn test_to_status() {
        assert_eq!(to_status(None), ActionStatus::Ok);
        assert_eq!(to_status(Some(ActionStatus::Ok)), ActionStatus::Ok);
        assert_eq!(to_status(Some(ActionStatus::CanContinue)), ActionStatus::CanContinue);
        assert_eq!(to_status(Some(ActionStatus::Error)), ActionStatus::Error);
    }

    #[test]
    fn test_filter_keeps_non_ok() {
        let statuses = [
            ActionStatus::Ok,
            ActionStatus::Error,
            ActionStatus::Ok,
            ActionStatus::CanContinue,
        ];
        let surfaced: Vec<_> = statuses.into_iter().filter(|s| is_failure(*s)).collect();
        assert_eq!(surfaced, vec![ActionStatus::Error, ActionStatus::CanContinue]);
    }

    #[tokio::test]
    async fn test_run_action_classifies_command_failure() {
        let subject = subject();
        let action = failing_with(&subject, || ActionError::CommandFailed {
            command: "false".to_string(),
            exit_code: Some(1),
            stderr: String::new(),
        });
        assert_eq!(run_action(&action, 0).await.unwrap(), Some(ActionStatus::Error));
    }

    #[tokio::test]
    async fn test_run_action_classifies_unexpected_fault_as_error() {
        let subject = subject();
        let action = failing_with(&subject, || ActionError::Unexpected("disk on fire".to_string()));
        assert_eq!(run_action(&action, 3).await.unwrap(), Some(ActionStatus::Error));

        let io = failing_with(&subject, || {
            ActionError::Io(std::io::Error::new(std::io::ErrorKind::Other, "io"))
        });
        assert_eq!(run_action(&io, 4).await.unwrap(), Some(ActionStatus::Error));
    }

    #[tokio::test]
    async fn test_run_action_propagates_interrupt() {
        let subject = subject();
        let action = failing_with(&subject, || ActionError::Interrupted);
        assert!(matches!(
            run_action(&action, 0).await,
            Err(ActionError::Interrupted)
        ));
    }

    #[tokio::test]
    async fn test_run_action_passes_status_through() {
        let subject = subject();
        let action = Action::new("maybe", "Maybe", &subject)
            .with_fn(|| async { Ok(Some(ActionStatus::CanContinue)) });
        assert_eq!(
            run_action(&action, 0).await.unwrap(),
            Some(ActionStatus::CanContinue)
        );

        let silent = Action::new("silent", "Silent", &subject);
        assert_eq!(run_action(&silent, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stage_chain_sends_only_failures() {
        let subject = subject();
        let (sink, mut events) = mpsc::channel(8);
        let mut stages = StageChain::new("raw", "quiet", sink);

        let ok = Action::new("ok", "Fine", &subject).with_fn(|| async { Ok(Some(ActionStatus::Ok)) });
        let bad = Action::new("bad", "Broken", &subject)
            .with_fn(|| async { Ok(Some(ActionStatus::Error)) });

        stages.on_next(0, ok).await.unwrap();
        stages.on_next(1, bad).await.unwrap();
        drop(stages);

        let event = events.recv().await.unwrap();
        match event {
            ExperimentEvent::StepFailed(outcome) => {
                assert_eq!(outcome.index, 1);
                assert_eq!(outcome.action, "bad");
                assert_eq!(outcome.subject, "quiet");
                assert_eq!(outcome.status, ActionStatus::Error);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.recv().await.is_none());
    }

    #[test]
    fn test_stream_len_counts_bookends() {
        let subject = subject();
        let record = ExperimentRecord::new("raw");
        let actions = vec![Action::new("a", "A", &subject), Action::new("b", "B", &subject)];
        let stream = observable_experiment(&record, &subject, actions);
        assert_eq!(stream.len(), 4);
        assert_eq!(stream.subject_name(), "quiet");
        assert_eq!(stream.experiment_name(), "raw");
    }
}
