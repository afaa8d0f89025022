//! taskloop CLI.
//!
//! Foreground driver for a run plus the operator commands. State lives in
//! `.taskloop/` under the project root unless `--state-dir` says otherwise.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use taskloop::control::{self, ControlOutcome};
use taskloop::core::merge::Priority;
use taskloop::exit_codes;
use taskloop::interrupt;
use taskloop::io::agent::CommandAgent;
use taskloop::io::config::load_config;
use taskloop::io::git::Git;
use taskloop::io::host::GhCli;
use taskloop::io::mailbox::MailboxStore;
use taskloop::io::run_state::{LogFormat, LogLevel, OptionsUpdate, RunOptions, RunState};
use taskloop::io::state_store::StateStore;
use taskloop::io::webhooks::{
    Dispatcher, NewWebhook, ReqwestTransport, WebhookStore, WebhookUpdate, send_test,
};
use taskloop::logging;
use taskloop::orchestrator::Orchestrator;

const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "taskloop", version, about = "Unattended goal-driven coding agent loop")]
struct Cli {
    /// State directory of the run.
    #[arg(long, global = true, default_value = ".taskloop")]
    state_dir: PathBuf,
    /// Repository the agent, git and gh operate in.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new run in `planning`.
    Init(InitArgs),
    /// `init` followed by `run`.
    Start(InitArgs),
    /// Drive the run in the foreground until it stops.
    Run,
    /// Move a paused or blocked run back to `working` and drive it.
    Resume {
        #[arg(long)]
        reason: Option<String>,
        /// Change request delivered to the mailbox with high priority.
        #[arg(long)]
        message: Option<String>,
    },
    /// Show the run's state.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Stop the run for good.
    Stop {
        #[arg(long)]
        reason: Option<String>,
        /// Remove run files once stopped (logs and config are kept).
        #[arg(long)]
        cleanup: bool,
    },
    /// Pause the run at its next checkpoint.
    Pause {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Change run options.
    Config(OptionArgs),
    #[command(subcommand)]
    Mailbox(MailboxCommand),
    #[command(subcommand)]
    Webhooks(WebhookCommand),
    /// Remove run files, keeping logs and configuration.
    Clean,
}

#[derive(Args)]
struct InitArgs {
    /// Goal text. Use `--goal-file` for longer goals.
    #[arg(required_unless_present = "goal_file")]
    goal: Option<String>,
    #[arg(long, conflicts_with = "goal")]
    goal_file: Option<PathBuf>,
    /// Checkbox plan to start from; skips planning.
    #[arg(long)]
    plan_file: Option<PathBuf>,
    /// Replace an unfinished run.
    #[arg(long)]
    force: bool,
    #[command(flatten)]
    options: OptionArgs,
}

#[derive(Args)]
struct OptionArgs {
    #[arg(long)]
    auto_merge: Option<bool>,
    /// 0 removes the limit.
    #[arg(long)]
    max_sessions: Option<u32>,
    /// 0 removes the limit.
    #[arg(long)]
    max_prs: Option<u32>,
    #[arg(long)]
    pause_on_pr: Option<bool>,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    pr_per_task: Option<bool>,
}

impl From<OptionArgs> for OptionsUpdate {
    fn from(args: OptionArgs) -> Self {
        OptionsUpdate {
            auto_merge: args.auto_merge,
            max_sessions: args.max_sessions,
            max_prs: args.max_prs,
            pause_on_pr: args.pause_on_pr,
            log_level: args.log_level,
            log_format: args.log_format,
            pr_per_task: args.pr_per_task,
        }
    }
}

#[derive(Subcommand)]
enum MailboxCommand {
    /// Queue a change request for the next checkpoint.
    Send {
        content: String,
        #[arg(long, default_value = "anonymous")]
        sender: String,
        /// low|normal|high|urgent or 0-3.
        #[arg(long, default_value = "normal", value_parser = parse_priority)]
        priority: Priority,
        /// Extra `key=value` metadata.
        #[arg(long = "meta", value_parser = parse_pair)]
        metadata: Vec<(String, String)>,
    },
    Status,
    Clear,
}

#[derive(Subcommand)]
enum WebhookCommand {
    Create {
        url: String,
        #[arg(long)]
        secret: Option<String>,
        /// Event type filter; repeat for several. Empty means every event.
        #[arg(long = "event")]
        events: Vec<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        no_verify_tls: bool,
        #[arg(long = "header", value_parser = parse_pair)]
        headers: Vec<(String, String)>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Get {
        id: String,
    },
    Update {
        id: String,
        #[arg(long)]
        url: Option<String>,
        /// Empty string removes the secret.
        #[arg(long)]
        secret: Option<String>,
        #[arg(long = "event")]
        events: Option<Vec<String>>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        verify_tls: Option<bool>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        id: String,
    },
    /// Send a `webhook.test` ping and report the response.
    Test {
        id: String,
    },
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_codes::BLOCKED);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let store = StateStore::new(&cli.state_dir);
    init_logging(&store);
    debug!(state_dir = %cli.state_dir.display(), "taskloop starting");

    match cli.command {
        Command::Init(args) => {
            let state = cmd_init(&store, args)?;
            println!("initialized run {} ({} tasks)", state.run_id, state.plan.len());
            Ok(exit_codes::SUCCESS)
        }
        Command::Start(args) => {
            let mut state = cmd_init(&store, args)?;
            drive(&store, &cli.workdir, &mut state)
        }
        Command::Run => {
            let mut state = store.load()?;
            drive(&store, &cli.workdir, &mut state)
        }
        Command::Resume { reason, message } => {
            let mut state = control::resume(&store, reason.as_deref(), message.as_deref())?;
            drive(&store, &cli.workdir, &mut state)
        }
        Command::Status { json } => {
            let report = control::status(&store)?;
            if json {
                print_json(&report)?;
            } else {
                println!("run {} [{}]{}", report.run_id, report.status, if report.active { " (active)" } else { "" });
                println!("goal: {}", report.goal);
                println!("tasks: {}/{} complete", report.tasks_completed, report.tasks_total);
                if let Some(task) = &report.current_task {
                    println!("current: {} (#{})", task, report.current_task_index + 1);
                }
                if let Some(pr) = report.current_pr {
                    println!(
                        "pr: #{pr} ({})",
                        report.workflow_stage.as_deref().unwrap_or("unknown")
                    );
                }
                println!(
                    "sessions: {}  prs: {} created, {} merged  mailbox: {}",
                    report.session_count, report.prs_created, report.prs_merged, report.mailbox.count
                );
                if let Some(err) = &report.last_error {
                    println!("last error: {err}");
                }
            }
            Ok(exit_codes::SUCCESS)
        }
        Command::Stop { reason, cleanup } => {
            print_outcome("stop", control::stop(&store, reason, cleanup)?);
            Ok(exit_codes::SUCCESS)
        }
        Command::Pause { reason } => {
            print_outcome("pause", control::pause(&store, reason)?);
            Ok(exit_codes::SUCCESS)
        }
        Command::Config(args) => {
            print_outcome("config update", control::update_config(&store, args.into())?);
            Ok(exit_codes::SUCCESS)
        }
        Command::Mailbox(command) => {
            cmd_mailbox(&store, command)?;
            Ok(exit_codes::SUCCESS)
        }
        Command::Webhooks(command) => cmd_webhooks(&store, command),
        Command::Clean => {
            control::clean(&store)?;
            println!("cleaned {}", store.paths().root().display());
            Ok(exit_codes::SUCCESS)
        }
    }
}

/// Log settings come from the run when one exists.
fn init_logging(store: &StateStore) {
    let options = if store.exists() {
        store.load().map(|s| s.options).unwrap_or_default()
    } else {
        RunOptions::default()
    };
    logging::init(options.log_level, options.log_format);
}

fn cmd_init(store: &StateStore, args: InitArgs) -> Result<RunState> {
    let goal = match (args.goal, &args.goal_file) {
        (Some(goal), _) => goal,
        (None, Some(path)) => fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        (None, None) => bail!("a goal is required"),
    };
    let plan = args
        .plan_file
        .as_deref()
        .map(|path| fs::read_to_string(path).with_context(|| format!("read {}", path.display())))
        .transpose()?;
    let mut options = RunOptions::default();
    options.apply(&args.options.into())?;
    control::init(store, &goal, options, plan.as_deref(), args.force)
}

fn drive(store: &StateStore, workdir: &Path, state: &mut RunState) -> Result<i32> {
    let paths = store.paths();
    let config = load_config(&paths.config())?;
    let agent = CommandAgent {
        command: config.agent.command.clone(),
        workdir: workdir.to_path_buf(),
        scratch_dir: paths.agent_dir(),
        timeout: config.agent.timeout(),
        output_limit_bytes: config.agent.output_limit_bytes,
    };
    let git = Git::new(workdir);
    let host = GhCli::new(workdir, config.pr.repo.clone());
    let dispatcher = Dispatcher::new(
        WebhookStore::new(paths, config.webhooks.clone()),
        Arc::new(ReqwestTransport::new()?),
        paths.webhook_deliveries(),
        &config.webhooks,
    );
    let flag = interrupt::install()?;

    let result = Orchestrator::new(store, &agent, &git, &host, &dispatcher, config)
        .with_interrupt(flag)
        .run(state);
    dispatcher.shutdown(DISPATCH_DRAIN_TIMEOUT);

    let status = result?;
    println!(
        "run {} {}: {}/{} tasks, {} sessions",
        state.run_id,
        status,
        state.plan.completed_count(),
        state.plan.len(),
        state.session_count
    );
    if let Some(err) = &state.last_error {
        eprintln!("last error: {err}");
    }
    Ok(exit_codes::for_status(status))
}

fn cmd_mailbox(store: &StateStore, command: MailboxCommand) -> Result<()> {
    let mailbox = MailboxStore::new(store.paths());
    match command {
        MailboxCommand::Send {
            content,
            sender,
            priority,
            metadata,
        } => {
            let id = mailbox.send(&content, &sender, priority, metadata.into_iter().collect())?;
            println!("{id}");
        }
        MailboxCommand::Status => print_json(&mailbox.status()?)?,
        MailboxCommand::Clear => println!("cleared {} message(s)", mailbox.clear()?),
    }
    Ok(())
}

fn cmd_webhooks(store: &StateStore, command: WebhookCommand) -> Result<i32> {
    let config = load_config(&store.paths().config())?;
    let webhooks = WebhookStore::new(store.paths(), config.webhooks);
    match command {
        WebhookCommand::Create {
            url,
            secret,
            events,
            timeout_secs,
            max_retries,
            no_verify_tls,
            headers,
            name,
            description,
        } => {
            let created = webhooks.create(NewWebhook {
                url,
                secret,
                events,
                timeout_secs,
                max_retries,
                verify_tls: no_verify_tls.then_some(false),
                headers: headers.into_iter().collect(),
                name,
                description,
            })?;
            print_json(&created.view())?;
        }
        WebhookCommand::List => {
            let views: Vec<_> = webhooks.list()?.iter().map(|s| s.view()).collect();
            print_json(&views)?;
        }
        WebhookCommand::Get { id } => print_json(&webhooks.get(&id)?.view())?,
        WebhookCommand::Update {
            id,
            url,
            secret,
            events,
            enabled,
            timeout_secs,
            max_retries,
            verify_tls,
            name,
            description,
        } => {
            let updated = webhooks.update(
                &id,
                WebhookUpdate {
                    url,
                    secret,
                    events,
                    enabled,
                    timeout_secs,
                    max_retries,
                    verify_tls,
                    headers: None,
                    name,
                    description,
                },
            )?;
            print_json(&updated.view())?;
        }
        WebhookCommand::Delete { id } => {
            let removed = webhooks.delete(&id)?;
            println!("deleted {}", removed.id);
        }
        WebhookCommand::Test { id } => {
            let subscription = webhooks.get(&id)?;
            let run_id = store.load().map(|s| s.run_id).unwrap_or_default();
            let record = send_test(&ReqwestTransport::new()?, &subscription, &run_id);
            print_json(&record)?;
            if !record.success {
                return Ok(exit_codes::BLOCKED);
            }
        }
    }
    Ok(exit_codes::SUCCESS)
}

fn print_outcome(what: &str, outcome: ControlOutcome) {
    match outcome {
        ControlOutcome::Queued => println!("{what} queued for the active run"),
        ControlOutcome::Applied(status) => println!("{what} applied; run is {status}"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    Priority::parse(raw).map_err(|err| err.to_string())
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
