//! Fork Orchestrator CLI
//!
//! Runs one prompt across N local sandboxes and prints the aggregate.

use std::sync::Arc;

use fork_orchestrator::{
    ForkStatus, LocalSandboxBackend, OrchestrationRequest, Orchestrator, OrchestratorConfig,
    RunProgress,
};

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}

fn print_progress(progress: &RunProgress) {
    println!("\n{}", "=".repeat(60));
    println!("Run Complete: {}", progress.run_id);
    println!("{}", "=".repeat(60));
    println!();
    println!("Forks:      {}", progress.num_forks);
    println!("Completed:  {}", progress.completed_count);
    println!("Failed:     {}", progress.failed_count);
    println!("Total cost: ${:.4}", progress.total_cost_usd);
    println!();
    for fork in &progress.forks {
        match &fork.error {
            Some(error) => println!(
                "  #{:<3} {:<16} {}",
                fork.fork_number,
                fork.status.as_str(),
                error
            ),
            None => println!(
                "  #{:<3} {:<16} ${:.4}",
                fork.fork_number,
                fork.status.as_str(),
                fork.cost_usd
            ),
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 4 {
        eprintln!("Usage: {} <repo_url> <branch> <prompt>", args[0]);
        eprintln!("\nRuns the prompt in N sandboxed forks of the repository.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  ORCHESTRATOR_CONFIG=<path>  TOML or YAML configuration file");
        eprintln!("  FORKS=<n>                   Number of forks (default: 1)");
        eprintln!("  MAX_CONCURRENT=<n>          Forks running at once");
        eprintln!("  MODEL=<name>                Agent model");
        eprintln!("  BUDGET_USD=<amount>         Soft cost ceiling for the run");
        eprintln!("  TIMEOUT_SECS=<n>            Agent wall-clock budget per fork");
        std::process::exit(1);
    }

    let config = match std::env::var("ORCHESTRATOR_CONFIG") {
        Ok(path) => match OrchestratorConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        Err(_) => OrchestratorConfig::default(),
    };

    let backend = Arc::new(LocalSandboxBackend::new(config.sandbox.root.clone()));
    let orchestrator = match Orchestrator::from_config(&config, backend).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Failed to start orchestrator: {}", e);
            std::process::exit(1);
        }
    };

    match orchestrator.recover().await {
        Ok(recovered) if !recovered.is_empty() => {
            tracing::info!(runs = recovered.len(), "resumed unfinished runs");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to recover unfinished runs"),
    }

    let mut request = OrchestrationRequest::new(
        &args[1],
        &args[2],
        args[3..].join(" "),
        env_parse("FORKS").unwrap_or(1),
    )
    .with_model(std::env::var("MODEL").unwrap_or_else(|_| config.agent.default_model.clone()))
    .with_max_concurrent(env_parse("MAX_CONCURRENT").unwrap_or(config.runs.default_max_concurrent));
    if let Some(timeout) = env_parse("TIMEOUT_SECS") {
        request = request.with_timeout_seconds(timeout);
    }
    if let Some(budget) = env_parse("BUDGET_USD") {
        request = request.with_budget_limit_usd(budget);
    }

    let run_id = match orchestrator.submit(request).await {
        Ok(run_id) => run_id,
        Err(e) => {
            eprintln!("Submit failed: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(run_id = %run_id, "run started; press Ctrl-C to cancel");

    let progress = tokio::select! {
        progress = orchestrator.wait(&run_id) => progress,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(run_id = %run_id, "interrupted, cancelling run");
            if let Err(e) = orchestrator.cancel(&run_id).await {
                tracing::warn!(error = %e, "cancel failed");
            }
            orchestrator.wait(&run_id).await
        }
    };
    orchestrator.stop_sweeper().await;

    match progress {
        Ok(progress) => {
            print_progress(&progress);
            if progress.count_in(ForkStatus::Success) < progress.forks.len() {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Run failed: {}", e);
            std::process::exit(1);
        }
    }
}
