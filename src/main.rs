use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use weave::cli::{Cli, Commands, FabricArgs};
use weave::config;
use weave::llm::scripted::ScriptedProvider;
use weave::orchestration::fabric::{Fabric, TaskOutcome};
use weave::streaming::bridge::StreamEvent;
use weave::streaming::transcript::TranscriptLogger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only the event stream.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli)?;
    tracing::info!(
        model = %config.default_model,
        task_secs = config.task_secs,
        llm_call_secs = config.llm_call_secs,
        critique = config.critique,
        "Config loaded"
    );

    let options = cli.options().clone();
    let mut builder = Fabric::builder(config);
    if options.offline {
        builder = builder.provider(Arc::new(ScriptedProvider::echo()));
    }
    let fabric = builder.build()?;

    let work = async {
        match &cli.command {
            Commands::Run { task, .. } => {
                let outcome = run_one(&fabric, task, &options).await?;
                anyhow::Ok(outcome.error.map(|e| e.to_string()))
            }
            Commands::Compare { task, .. } => {
                let fabric_outcome = run_one(&fabric, task, &options).await?;
                let baseline = fabric.run_traditional(task).await;
                print_comparison(&fabric_outcome, &baseline);
                anyhow::Ok(baseline.error.or(fabric_outcome.error).map(|e| e.to_string()))
            }
            Commands::Interactive { .. } => {
                interactive(&fabric, &options).await?;
                Ok(None)
            }
        }
    };
    let failed = tokio::select! {
        result = work => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, shutting down");
            Some("interrupted".to_string())
        }
    };

    fabric.shutdown().await;
    match failed {
        Some(error) => anyhow::bail!(error),
        None => Ok(()),
    }
}

async fn run_one(fabric: &Fabric, task: &str, options: &FabricArgs) -> anyhow::Result<TaskOutcome> {
    let mut transcript = if options.transcript {
        let mut logger = TranscriptLogger::create(&fabric.config().transcript_dir)?;
        logger.task_start(task)?;
        Some(logger)
    } else {
        None
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = async {
        while let Some(event) = rx.recv().await {
            if let Some(logger) = transcript.as_mut() {
                if let Err(e) = logger.stream_event(&event) {
                    tracing::warn!("Transcript write failed: {e:#}");
                }
            }
            print_event(&event, options.json);
        }
    };
    let (outcome, ()) = tokio::join!(fabric.run_task_streaming(task, tx), printer);

    if let Some(logger) = transcript.as_mut() {
        let error = outcome.error.as_ref().map(|e| e.to_string());
        logger.task_end(outcome.success(), error.as_deref(), &outcome.summary)?;
        eprintln!("Transcript: {}", logger.path().display());
    }
    if !options.json {
        println!("\n{}", outcome.summary);
    }
    Ok(outcome)
}

fn print_comparison(fabric: &TaskOutcome, baseline: &TaskOutcome) {
    println!("\n=== Single model ===");
    match (&baseline.final_answer, &baseline.error) {
        (Some(answer), _) => println!("{answer}"),
        (None, Some(e)) => println!("Error: {e}"),
        (None, None) => {}
    }
    println!("\n{}", baseline.summary);

    let (multi, single) = (&fabric.summary, &baseline.summary);
    println!(
        "\nmulti-agent: {} calls, {} tokens, ${:.6}, {} ms",
        multi.llm_calls, multi.tokens.total, multi.total_cost, multi.elapsed_ms
    );
    println!(
        "single model: {} calls, {} tokens, ${:.6}, {} ms",
        single.llm_calls, single.tokens.total, single.total_cost, single.elapsed_ms
    );
}

fn print_event(event: &StreamEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("Could not serialize event: {e}"),
        }
        return;
    }
    match event {
        StreamEvent::Message { message } => println!("{message}"),
        StreamEvent::Metric { metrics } => println!(
            "  . {} {:?} ({} calls, {} tokens)",
            metrics.agent_id, metrics.status, metrics.llm_calls, metrics.tokens.total
        ),
        StreamEvent::Answer { answer } => println!("\n=== Answer ===\n{answer}"),
        StreamEvent::Done { .. } => println!("=== Done ==="),
        StreamEvent::Error { error } => println!("=== Error: {error} ==="),
    }
}

async fn interactive(fabric: &Fabric, options: &FabricArgs) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("task> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let task = line.trim();
        if task.is_empty() {
            continue;
        }
        if matches!(task, "quit" | "exit" | "q") {
            break;
        }
        let (command, argument) = task.split_once(' ').unwrap_or((task, ""));
        if command == "forget" {
            let keep_last = argument.trim().parse().unwrap_or(50);
            let removed = fabric.memory().clear_old(keep_last).await?;
            println!("Forgot {removed} tasks, kept the last {keep_last}");
            continue;
        }
        if let Err(e) = run_one(fabric, task, options).await {
            tracing::error!("Task failed: {e:#}");
        }
    }

    let stats = fabric.memory().stats().await?;
    println!(
        "{} tasks ({} successful), {} tokens, avg ${:.6} per task",
        stats.total_tasks, stats.successful_tasks, stats.total_tokens, stats.avg_cost
    );
    Ok(())
}
