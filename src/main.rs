use anyhow::{Context, Result};
use expipe::cli::commands::{HistoryCommand, RunCommand, ValidateCommand};
use expipe::cli::output::*;
use expipe::cli::{Cli, Command};
use expipe::core::action::action_sequence;
use expipe::core::config::ExperimentConfig;
use expipe::execution::{
    observable_experiment, ExperimentEvent, ExperimentPipeline, ProcessPoolScheduler, SignalRegistry,
    Termination,
};
use expipe::persistence::{ExperimentRecord, ExperimentStore, InMemoryStore};
use std::sync::Arc;
use tracing::{debug, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_experiment(cmd).await?,
        Command::Validate(cmd) => validate_experiment(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history() -> Result<Arc<dyn ExperimentStore>> {
    let store = expipe::persistence::SqliteExperimentStore::with_default_path().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history() -> Result<Arc<dyn ExperimentStore>> {
    warn!("Built without sqlite support, history is not kept");
    Ok(Arc::new(InMemoryStore::new()))
}

async fn run_experiment(cmd: &RunCommand) -> Result<()> {
    let config = ExperimentConfig::from_file(&cmd.file)
        .context("Failed to load experiment config")?;

    println!(
        "{} Loaded experiment: {}",
        INFO,
        style(&config.name).bold()
    );

    let workers = cmd.workers.unwrap_or(config.workers);
    let scheduler = ProcessPoolScheduler::new(workers)?;

    // Set up persistence
    let store: Arc<dyn ExperimentStore> = if cmd.no_history {
        Arc::new(InMemoryStore::new())
    } else {
        open_history().await?
    };

    // Finalize open experiments on SIGINT/SIGTERM
    let registry = Arc::new(SignalRegistry::new());
    let mut listener = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.listen().await })
    };

    let experiment = ExperimentRecord::new(&config.name);
    let projects = config.to_projects();
    let streams: Vec<_> = projects
        .iter()
        .map(|project| observable_experiment(&experiment, project, action_sequence(project)))
        .collect();

    println!(
        "{} Running {} on {} project(s) with {} worker(s)",
        ROCKET,
        style(&config.name).bold(),
        style(projects.len()).cyan(),
        style(workers).cyan()
    );

    let pipeline = ExperimentPipeline::new(scheduler, Arc::clone(&store), Arc::clone(&registry));
    let mut events = pipeline.run(streams);
    let progress = create_progress_bar(projects.len());

    let mut failures = 0;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                if !matches!(event, ExperimentEvent::StepFailed(_)) {
                    progress.inc(1);
                }
                if event.is_failure() {
                    failures += 1;
                }
                progress.println(format_experiment_event(&event));
            }
            finalized = &mut listener, if !interrupted => {
                interrupted = true;
                match finalized {
                    Ok(Ok(count)) => debug!("Finalized {} experiment(s) on termination", count),
                    Ok(Err(e)) => warn!("Could not listen for termination: {}", e),
                    Err(e) => warn!("Termination listener failed: {}", e),
                }
                match exit_on_next_termination() {
                    Ok(()) => progress.println(format!(
                        "{} Finishing running actions, interrupt again to exit immediately",
                        WARN
                    )),
                    Err(e) => warn!("Could not listen for a second termination request: {}", e),
                }
                events.dispose();
            }
        }
    }
    progress.finish_and_clear();
    if !interrupted {
        listener.abort();
    }

    if !cmd.no_history {
        report_history(store.as_ref(), &experiment).await;
    }

    if interrupted {
        println!("\n{} {} {}", WARN, style(&config.name).bold(), style("interrupted").yellow());
        std::process::exit(130);
    }

    if failures == 0 {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&config.name).bold(),
            style("successfully").green()
        );
    } else {
        println!(
            "\n{} {} finished with {} failure(s)",
            CROSS,
            style(&config.name).bold(),
            style(failures).red()
        );
        std::process::exit(1);
    }

    Ok(())
}

/// Exit at once on the next Ctrl-C or SIGTERM
fn exit_on_next_termination() -> std::io::Result<()> {
    let mut termination = Termination::new()?;
    tokio::spawn(async move {
        if termination.recv().await.is_ok() {
            eprintln!("\n{} Interrupted again, exiting", CROSS);
            std::process::exit(130);
        }
    });
    Ok(())
}

/// Tell whether the experiment made it into history with both timestamps
async fn report_history(store: &dyn ExperimentStore, experiment: &ExperimentRecord) {
    let short_id = &experiment.id.to_string()[..8];
    match store.load_experiment(experiment.id).await {
        Ok(Some(stored)) if stored.is_complete() => {
            println!(
                "\n{} Experiment saved to history (ID: {})",
                INFO,
                style(short_id).dim()
            );
        }
        Ok(Some(_)) => println!(
            "\n{} Experiment {} was saved without its {}",
            WARN,
            style(short_id).dim(),
            style("begin or end time").yellow()
        ),
        Ok(None) => println!(
            "\n{} Experiment {} was {}",
            WARN,
            style(short_id).dim(),
            style("not saved to history").yellow()
        ),
        Err(e) => println!(
            "\n{} Could not read back experiment {}: {}",
            WARN,
            style(short_id).dim(),
            style(e).yellow()
        ),
    }
}

fn validate_experiment(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating experiment...", INFO);

    match ExperimentConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Experiment configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Workers: {}", style(config.workers).cyan());
            println!("  Projects: {}", style(config.projects.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history().await?;
    let experiments: Vec<ExperimentRecord> = store
        .list_experiments()
        .await?
        .into_iter()
        .take(cmd.limit)
        .collect();

    if experiments.is_empty() {
        println!("{} No experiments found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "experiments": experiments });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Experiment history (showing latest {}):", INFO, cmd.limit);
        for record in &experiments {
            println!("  {}", format_experiment_record(record));
        }
    }

    Ok(())
}
