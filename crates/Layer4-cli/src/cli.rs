//! Non-interactive commands

use crate::console::ConsoleStatus;
use crucible_agent::{SandboxRuntime, TaskReport, TaskSpec};
use crucible_container::{CliEngine, CommandResult, ContainerEngine};
use crucible_foundation::{Result, SandboxConfig};
use std::path::Path;
use std::sync::Arc;

/// Run one task file; `Ok(false)` when the task itself failed
pub async fn run_task(config: SandboxConfig, task_file: &Path, json: bool) -> Result<bool> {
    let spec = TaskSpec::load(task_file)?;
    let runtime = SandboxRuntime::init(config).await?;
    if !json {
        runtime.subscribe_status(Arc::new(ConsoleStatus::new()));
    }

    let agent = runtime.spawn_agent();
    let task = agent.execute_task(spec);
    tokio::pin!(task);

    let outcome = tokio::select! {
        outcome = &mut task => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, cancelling...");
            agent.cancel_all();
            task.await
        }
    };

    agent.retire().await;
    runtime.shutdown("cli exit").await;

    let report = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.is_success())
}

/// Print which engine would be used
pub async fn check(config: &SandboxConfig) -> Result<()> {
    match CliEngine::detect(config.engine.runtime) {
        Ok(engine) if engine.is_available().await => {
            println!("✓ {} is available ({})", engine.name(), engine.binary().display());
        }
        Ok(engine) => {
            println!("✗ {} is installed but not responding", engine.name());
        }
        Err(e) => {
            println!("✗ {}", e);
        }
    }
    Ok(())
}

fn print_report(report: &TaskReport) {
    println!();
    if !report.setup_results.is_empty() {
        println!("Setup");
        for result in &report.setup_results {
            print_result(result);
        }
        println!();
    }

    println!("{:<12} {:<8} {:<10} Command", "Status", "Exit", "Duration");
    for result in &report.results {
        print_result(result);
    }

    println!();
    let status = if report.is_success() { "✓" } else { "✗" };
    match &report.failure_reason {
        Some(reason) => println!(
            "{} Task {} {} after {:.1}s: {}",
            status,
            report.id,
            report.status,
            report.duration().as_secs_f64(),
            reason
        ),
        None => println!(
            "{} Task {} {} in {:.1}s ({} commands)",
            status,
            report.id,
            report.status,
            report.duration().as_secs_f64(),
            report.results.len()
        ),
    }
}

fn print_result(result: &CommandResult) {
    let exit = result
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<12} {:<8} {:<10} {}",
        result.status.as_str(),
        exit,
        format!("{:.2}s", result.duration.as_secs_f64()),
        truncate(&result.command, 60)
    );
}

fn truncate(s: &str, max_chars: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    if first_line.chars().count() > max_chars {
        let cut: String = first_line.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        first_line.to_string()
    }
}
