use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;
use ultibuild::cli::commands::HistoryCommand;
use ultibuild::cli::output::*;
use ultibuild::cli::{Cli, Command};
use ultibuild::core::{BuildConfig, ExecutionStatus, PipelineContext};
use ultibuild::execution::{ExecutionEvent, PipelineOrchestrator};
use ultibuild::persistence::{create_summary, InMemoryPersistence, PersistenceBackend, RunSummary};
use ultibuild::runner::ProcessRunner;
use ultibuild::toolchain::ProcMeminfo;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Some(Command::History(cmd)) => show_history(cmd).await,
        None => run_build(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Result<BuildConfig> {
    let mut config = match &cli.config {
        Some(path) => BuildConfig::from_file(path)
            .with_context(|| format!("Failed to load build config {}", path.display()))?,
        None => BuildConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root_dir = root.clone();
    }
    config.validate().context("Invalid build config")?;
    Ok(config)
}

async fn open_store(no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if no_history {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }

    #[cfg(feature = "sqlite")]
    let store: Arc<dyn PersistenceBackend> =
        Arc::new(ultibuild::persistence::SqliteRunStore::with_default_path().await?);
    #[cfg(not(feature = "sqlite"))]
    let store: Arc<dyn PersistenceBackend> = Arc::new(InMemoryPersistence::new());

    Ok(store)
}

async fn run_build(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let options = cli.run_options();

    println!(
        "{} Loaded build: {} (root {})",
        INFO,
        style(&config.name).bold(),
        style(config.root_dir.display()).dim()
    );

    let mut ctx = PipelineContext::new(config);
    let mut orchestrator = PipelineOrchestrator::standard(
        Arc::new(ProcessRunner::new()),
        Arc::new(ProcMeminfo::new()),
        options,
    );

    if options.dry_run {
        println!("{} Dry run, stages that would run:", INFO);
        println!("{}", format_plan(&orchestrator.plan()));
        return Ok(());
    }

    let store = open_store(cli.no_history).await?;

    let progress = create_progress_bar(orchestrator.plan().len());
    let bar = progress.clone();
    orchestrator.add_event_handler(move |event| {
        bar.println(format_execution_event(&event));
        match &event {
            ExecutionEvent::StageStarted { stage } => bar.set_message(stage.to_string()),
            ExecutionEvent::StageCompleted { .. }
            | ExecutionEvent::StageSkipped { .. }
            | ExecutionEvent::StageFailed { .. } => bar.inc(1),
            _ => {}
        }
    });

    let outcome = tokio::select! {
        result = orchestrator.run(&mut ctx) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    progress.finish_and_clear();

    let result = match outcome {
        Some(result) => result,
        None => {
            ctx.state.cancel();
            println!("\n{} {} interrupted", WARN, style(&ctx.config.name).bold());
            Ok(())
        }
    };

    if !cli.no_history {
        let summary = create_summary(&ctx);
        store.save_run(&summary).await?;
        println!(
            "\n{} Run saved to history (ID: {})",
            INFO,
            style(&summary.run_id.to_string()[..8]).dim()
        );
    }

    match (ctx.state.status, result) {
        (ExecutionStatus::Completed, _) => {
            if let Some(evidence) = &ctx.evidence {
                println!(
                    "{} Optimization evidence: {}% ({})",
                    INFO,
                    style(evidence.score).bold(),
                    evidence.rating.as_str()
                );
            }
            if let Some(package) = &ctx.package_path {
                println!("{} Package: {}", INFO, style(package.display()).cyan());
            }
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&ctx.config.name).bold(),
                style("successfully").green()
            );
            Ok(())
        }
        (_, Err(failure)) => {
            eprintln!(
                "\n{} {} {}",
                CROSS,
                style(&ctx.config.name).bold(),
                style("failed").red()
            );
            error!("{}", failure);
            std::process::exit(1);
        }
        _ => std::process::exit(130),
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_store(false).await?;

    if let Some(id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => print_run_details(&summary, cmd.json)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let runs = store.list_runs(cmd.limit).await?;
    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }

    Ok(())
}

fn print_run_details(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Build: {}", style(&summary.pipeline_name).bold());
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Stages: {}/{}",
        summary.finished_stages, summary.total_stages
    );
    if let Some(toolchain) = &summary.toolchain {
        println!("  Toolchain: {}", style(toolchain).cyan());
    }
    if let Some(score) = summary.verification_score {
        println!("  Evidence score: {}%", score);
    }
    if let Some(stage) = &summary.failed_stage {
        println!("  Failed stage: {}", style(stage).red());
    }

    Ok(())
}
