use anyhow::{Context, Result};
use console::Term;
use intentflow::cli::commands::{MemoryAction, MemoryCommand, RunCommand, ValidateCommand};
use intentflow::cli::output::{format_event, format_status, style, CHECK, CROSS, INFO};
use intentflow::cli::shell::{ShellProvider, TerminalCollector};
use intentflow::cli::{Cli, Command};
use intentflow::execution::PipelineEvent;
use intentflow::memory::{ClearMemoryInput, QueryMemoryInput, RunMemoryStore};
use intentflow::{
    Engine, EngineContext, EventBus, PipelineFile, ProviderRegistry, RunOptions, RuntimeConfig,
};
use std::sync::{Arc, Weak};
use tracing::Level;
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

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path).context("Failed to load runtime config")?,
        None => RuntimeConfig::default(),
    };

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, config).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Memory(cmd) => memory_command(cmd, config)?,
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand, config: RuntimeConfig) -> Result<()> {
    let pipeline = PipelineFile::from_file(&cmd.file).context("Failed to load pipeline")?;
    println!("{} Loaded pipeline: {}", INFO, style(&pipeline.name).bold());

    for (key, value) in &cmd.variable {
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let registry = Arc::new(ProviderRegistry::new());
    registry.register("terminal.run", Arc::new(ShellProvider));

    let bus = Arc::new(EventBus::new());
    let _console = bus.on(|event| {
        if let Some(line) = format_event(event) {
            println!("{line}");
        }
    });

    let root = std::env::current_dir().context("Failed to resolve working directory")?;
    let engine = Arc::new(Engine::new(EngineContext {
        registry,
        bus: Arc::clone(&bus),
        config,
        root,
        inputs: Box::new(TerminalCollector::new()),
    }));

    // Approval steps block the run until a decision arrives, so the
    // console answers them from the event listener.
    let weak: Weak<Engine> = Arc::downgrade(&engine);
    let auto_approve = cmd.yes;
    let _approvals = bus.on(move |event| {
        let PipelineEvent::ApprovalReviewReady { run_id, .. } = event else {
            return;
        };
        let Some(engine) = weak.upgrade() else {
            return;
        };
        let approved = auto_approve || prompt_approval();
        engine.submit_decision(run_id, approved);
    });

    let options = RunOptions {
        dry_run: cmd.dry_run,
        start_step_id: cmd.start_step.clone(),
        variables: cmd.variable.clone(),
        cwd: cmd.cwd.clone(),
        session_id: cmd.session.clone(),
    };

    println!();
    let outcome = engine.run_pipeline_from_data(pipeline, options).await?;

    if outcome.success {
        println!(
            "\n{} Run {} finished: {}",
            CHECK,
            style(&outcome.run_id[..8]).dim(),
            format_status(outcome.status)
        );
    } else {
        println!(
            "\n{} Run {} finished: {}",
            CROSS,
            style(&outcome.run_id[..8]).dim(),
            format_status(outcome.status)
        );
        std::process::exit(1);
    }

    Ok(())
}

fn prompt_approval() -> bool {
    let term = Term::stdout();
    if !term.is_term() {
        return false;
    }
    let _ = term.write_str("Approve this step? [y/N] ");
    matches!(term.read_line().as_deref(), Ok(line) if line.trim().eq_ignore_ascii_case("y"))
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineFile::from_file(&cmd.file) {
        Ok(pipeline) => {
            println!("{} Pipeline is valid!", CHECK);
            println!("  Name: {}", style(&pipeline.name).bold());
            println!("  Steps: {}", style(pipeline.steps.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&pipeline)?;
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

fn memory_command(cmd: &MemoryCommand, config: RuntimeConfig) -> Result<()> {
    let root = std::env::current_dir().context("Failed to resolve working directory")?;
    let store = RunMemoryStore::new(&root, config.memory_limits());

    match &cmd.action {
        MemoryAction::List { session, key, limit, json } => {
            let records = store.query(&QueryMemoryInput {
                session_id: session.clone(),
                key: key.clone(),
                limit: Some(*limit),
                ..Default::default()
            });
            if records.is_empty() {
                println!("{} No memory records found", INFO);
                return Ok(());
            }
            if *json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    println!(
                        "  {} {} [{}] {}",
                        style(&record.id[..record.id.len().min(12)]).dim(),
                        style(&record.key).bold(),
                        style(&record.session_id).cyan(),
                        style(record.tags.join(",")).dim()
                    );
                }
            }
        }
        MemoryAction::Clear { session, key, keep_last } => {
            let (removed, remaining) = store.clear(&ClearMemoryInput {
                session_id: session.clone(),
                key: key.clone(),
                keep_last: *keep_last,
                ..Default::default()
            })?;
            println!(
                "{} Removed {} record(s), {} remaining",
                CHECK,
                style(removed).cyan(),
                style(remaining).dim()
            );
        }
    }
    Ok(())
}
