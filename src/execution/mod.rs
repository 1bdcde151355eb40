//! Experiment execution: schedulers, termination handling and the pipeline

pub mod pipeline;
pub mod pool;
pub mod scheduler;
pub mod signals;

pub use pipeline::{
    merge, observable_experiment, AggregateStream, ExperimentEvent, ExperimentPipe,
    ExperimentPipeline, ExperimentStream, StepOutcome, StreamError,
};
pub use pool::ProcessPoolScheduler;
pub use scheduler::{Cancellation, Disposable, Scheduler, SchedulerError};
pub use signals::{SignalRegistry, Termination};
