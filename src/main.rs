//! taskmill binary entry point

use std::path::Path;

use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use tracing::info;

use taskmill::cli::{Cli, Commands, ConfigSubcommand};
use taskmill::config::Config;
use taskmill::engine::{SubmitOutcome, TaskEngine};
use taskmill::error::{Error, Result};
use taskmill::status::TaskRecord;
use taskmill::task::{SigMode, TaskSpec};
use taskmill::{logging, report, version};

/// Terminal records younger than this still show without `--all`
const RECENT_WINDOW_HOURS: i64 = 24;

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("{}", e.format_for_log());
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    // Commands that need no engine or full logging
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(0);
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand.clone(), cli.config.as_deref())?;
            return Ok(0);
        }
        _ => {}
    }

    let mut config = Config::load(cli.config.as_deref())?;
    match &cli.command {
        Commands::Run {
            resume,
            max_running,
            no_wait,
            ..
        } => {
            if *resume {
                config.engine.resume_mode = true;
            }
            if let Some(n) = max_running {
                config.engine.max_running_jobs = *n;
            }
            if *no_wait {
                config.engine.wait_for_task = false;
            }
        }
        Commands::Submit { max_running, .. } => {
            if let Some(n) = max_running {
                config.engine.max_running_jobs = *n;
            }
            config.engine.wait_for_task = false;
        }
        _ => {}
    }

    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        profile = %build.profile,
        "Starting taskmill"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("failed to create runtime: {e}")))?;
    runtime.block_on(dispatch(cli, config))
}

async fn dispatch(cli: Cli, config: Config) -> Result<i32> {
    let engine = TaskEngine::new(config)?;

    match cli.command {
        Commands::Run {
            tasks,
            command,
            queue,
            sig_mode,
            ..
        }
        | Commands::Submit {
            tasks,
            command,
            queue,
            sig_mode,
            ..
        } => {
            let specs = collect_tasks(&tasks, command, queue, sig_mode)?;
            run_tasks(&engine, specs).await
        }

        Commands::Status {
            fingerprints,
            host,
            verbosity,
            html,
            all,
        } => {
            let mut records = engine.status(host.as_deref()).await?;
            if !fingerprints.is_empty() {
                records.retain(|r| fingerprints.contains(&r.fingerprint));
            } else if !all {
                records.retain(is_recent);
            }
            if html {
                print!("{}", report::render_html(&records));
                return Ok(0);
            }
            print!("{}", report::render(&records, verbosity));
            // Detail 0 prints nothing; the exit code is the report
            Ok(if verbosity == 0 {
                report::exit_signal(&records)
            } else {
                0
            })
        }

        Commands::Purge {
            fingerprints,
            host,
            force,
        } => {
            let purged = engine.purge(&fingerprints, host.as_deref(), force).await?;
            println!("{} record(s) purged", purged.removed);
            if purged.skipped_live > 0 {
                println!(
                    "{} live record(s) left alone (use --force to kill and purge them)",
                    purged.skipped_live
                );
            }
            Ok(0)
        }

        Commands::Kill { fingerprints, host } => {
            let killed = engine.kill(&fingerprints, host.as_deref()).await?;
            println!("{killed} task(s) killed");
            Ok(0)
        }

        Commands::Execute { fingerprint, host } => {
            let result = engine.execute(&fingerprint, host.as_deref()).await?;
            print_run_summary(&result);
            Ok(if result.success() { 0 } else { 1 })
        }

        Commands::Hosts => {
            for host in engine.hosts() {
                println!(
                    "{}\tbackend={}\twindow={}\troot={}",
                    host.name(),
                    host.backend().name(),
                    host.max_running_jobs(),
                    host.root().display()
                );
            }
            Ok(0)
        }

        Commands::Version | Commands::Config { .. } => unreachable!(),
    }
}

/// Build the task list from descriptor files or a bare command, applying
/// CLI-level overrides
fn collect_tasks(
    files: &[std::path::PathBuf],
    command: Option<String>,
    queue: Option<String>,
    sig_mode: Option<String>,
) -> Result<Vec<TaskSpec>> {
    let sig_mode = match sig_mode {
        Some(text) => Some(SigMode::parse(&text).ok_or_else(|| {
            Error::config_field_invalid("sig_mode", format!("unknown signature mode '{text}'"))
        })?),
        None => None,
    };

    let mut specs = Vec::new();
    if let Some(command) = command {
        specs.push(TaskSpec::from_command(command));
    }
    for file in files {
        specs.push(TaskSpec::from_toml_file(file)?);
    }
    for spec in &mut specs {
        if let Some(queue) = &queue {
            spec.queue = queue.clone();
        }
        if let Some(mode) = sig_mode {
            spec.sig_mode = mode;
        }
    }
    Ok(specs)
}

async fn run_tasks(engine: &TaskEngine, specs: Vec<TaskSpec>) -> Result<i32> {
    if !engine.config().engine.wait_for_task {
        // Fire-and-forget: submit and report the immediate outcomes
        for spec in specs {
            let fingerprint = spec.fingerprint();
            let outcome = engine.submit(&spec).await?;
            let word = match outcome {
                SubmitOutcome::Submitted => "submitted",
                SubmitOutcome::Deferred => "deferred",
                SubmitOutcome::Skipped => "skipped",
                SubmitOutcome::Resumed => "already running",
            };
            println!("{fingerprint}\t{word}");
        }
        return Ok(0);
    }

    let result = engine.run(specs).await?;
    print_run_summary(&result);
    Ok(if result.success() { 0 } else { 1 })
}

fn print_run_summary(result: &taskmill::engine::RunReport) {
    for (fingerprint, status) in &result.statuses {
        println!("{fingerprint}\t{status}");
    }
    println!(
        "completed: {}, skipped: {}, failed: {}, aborted: {}, unknown: {}",
        result.completed, result.skipped, result.failed, result.aborted, result.unknown
    );
}

/// Without `--all`, terminal records fade from the default report a day
/// after they ended
fn is_recent(record: &TaskRecord) -> bool {
    if !record.status.is_terminal() {
        return true;
    }
    match record.ended_at {
        Some(ended) => Utc::now() - ended < ChronoDuration::hours(RECENT_WINDOW_HOURS),
        None => true,
    }
}

fn handle_config_command(subcommand: ConfigSubcommand, config_path: Option<&Path>) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            let config = Config::load(config_path)?;
            let text = toml::to_string_pretty(&config)?;
            print!("{text}");
        }
        ConfigSubcommand::Init { path, force } => {
            let target = path
                .clone()
                .or_else(|| config_path.map(|p| p.to_path_buf()))
                .unwrap_or_else(Config::default_path);
            if target.exists() && !force {
                return Err(Error::config_validation(format!(
                    "'{}' already exists (use --force to overwrite)",
                    target.display()
                )));
            }
            let written = Config::init(Some(&target))?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate => {
            let config = Config::load(config_path)?;
            config.validate()?;
            println!(
                "Configuration OK ({} host(s), default queue '{}')",
                config.hosts.len(),
                config.engine.default_queue
            );
        }
    }
    Ok(())
}
